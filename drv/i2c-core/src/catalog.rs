// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device-type catalog and its detection/init/poll DSL.
//!
//! Each device type is a plain record carrying string-form write/read
//! specifiers compiled once at catalog-build time, plus a decode function
//! rather than a per-device-type subclass. The decode function is an
//! `Arc<dyn Fn>` closure, the idiomatic Rust replacement for a function
//! pointer plus an implicit device-type discriminant.

use std::fmt;
use std::sync::Arc;

/// A parsed write specifier: raw bytes to put on the wire, from a `0x`
/// literal.
pub type WriteSpec = Vec<u8>;

/// A parsed read specifier: either a detection pattern with a
/// don't-care mask, or (for polling, where no pattern match is needed) a
/// plain read length.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadSpec {
    /// From a `0b` literal: `mask` has a set bit wherever the pattern bit
    /// is significant, `pattern` holds the expected value there.
    Pattern { mask: Vec<u8>, pattern: Vec<u8> },
    /// From an `r<N>` literal: read `N` bytes, no value to check.
    Length(usize),
}

impl ReadSpec {
    pub fn read_len(&self) -> usize {
        match self {
            Self::Pattern { mask, .. } => mask.len(),
            Self::Length(n) => *n,
        }
    }

    /// Compare `bytes` against this spec. A `Length` spec matches any
    /// reply of the right length; a `Pattern` spec requires every masked
    /// bit to equal the expected pattern.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        match self {
            Self::Length(n) => bytes.len() == *n,
            Self::Pattern { mask, pattern } => {
                if bytes.len() != mask.len() {
                    return false;
                }
                bytes
                    .iter()
                    .zip(mask)
                    .zip(pattern)
                    .all(|((b, m), p)| b & m == p & m)
            }
        }
    }
}

/// One step of a DSL spec: a write, optionally paired with a read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DslStep {
    pub write: WriteSpec,
    pub read: Option<ReadSpec>,
}

/// A malformed DSL literal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DslError(pub String);

impl fmt::Display for DslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed catalog DSL: {}", self.0)
    }
}

impl std::error::Error for DslError {}

fn parse_write(s: &str) -> Result<WriteSpec, DslError> {
    let hex = s
        .strip_prefix("0x")
        .ok_or_else(|| DslError(format!("write spec {s:?} missing 0x prefix")))?;
    if hex.len() % 2 != 0 {
        return Err(DslError(format!("write spec {s:?} has odd hex digit count")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| DslError(format!("bad hex byte in {s:?}")))
        })
        .collect()
}

fn parse_read(s: &str) -> Result<ReadSpec, DslError> {
    if let Some(bits) = s.strip_prefix("0b") {
        if bits.len() % 8 != 0 || bits.is_empty() {
            return Err(DslError(format!("read spec {s:?} is not a whole number of bytes")));
        }
        let mut mask = Vec::with_capacity(bits.len() / 8);
        let mut pattern = Vec::with_capacity(bits.len() / 8);
        for byte_bits in bits.as_bytes().chunks(8) {
            let mut m = 0u8;
            let mut p = 0u8;
            for (i, &c) in byte_bits.iter().enumerate() {
                let shift = 7 - i;
                match c {
                    b'0' => {
                        m |= 1 << shift;
                    }
                    b'1' => {
                        m |= 1 << shift;
                        p |= 1 << shift;
                    }
                    b'x' | b'X' => {}
                    _ => return Err(DslError(format!("bad bit char in {s:?}"))),
                }
            }
            mask.push(m);
            pattern.push(p);
        }
        Ok(ReadSpec::Pattern { mask, pattern })
    } else if let Some(n) = s.strip_prefix('r') {
        let n: usize = n
            .parse()
            .map_err(|_| DslError(format!("read spec {s:?} has a non-numeric length")))?;
        Ok(ReadSpec::Length(n))
    } else {
        Err(DslError(format!("read spec {s:?} has an unrecognized prefix")))
    }
}

fn parse_step(s: &str) -> Result<DslStep, DslError> {
    match s.split_once('=') {
        Some((w, r)) => Ok(DslStep {
            write: parse_write(w)?,
            read: Some(parse_read(r)?),
        }),
        None => Ok(DslStep {
            write: parse_write(s)?,
            read: None,
        }),
    }
}

/// Parse a full DSL string into records (`;`-separated) of steps
/// (`&`-separated within a record). Trailing empty records (a trailing
/// `;`) are ignored.
pub fn parse_dsl(s: &str) -> Result<Vec<Vec<DslStep>>, DslError> {
    s.split(';')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|record| record.split('&').map(str::trim).map(parse_step).collect())
        .collect()
}

/// One `(write, read-pattern)` pair used to identify a device type.
#[derive(Clone, Debug)]
pub struct DetectionPair {
    pub write: WriteSpec,
    pub mask: Vec<u8>,
    pub pattern: Vec<u8>,
}

/// Parse a detection DSL string into a flat list of pairs, one per
/// `;`-separated record. Each record must be exactly one step with a
/// `0b` read spec.
pub fn parse_detection_pairs(s: &str) -> Result<Vec<DetectionPair>, DslError> {
    parse_dsl(s)?
        .into_iter()
        .map(|mut record| {
            if record.len() != 1 {
                return Err(DslError("detection record must have exactly one step".into()));
            }
            let step = record.remove(0);
            match step.read {
                Some(ReadSpec::Pattern { mask, pattern }) => Ok(DetectionPair {
                    write: step.write,
                    mask,
                    pattern,
                }),
                _ => Err(DslError("detection step must use a 0b read spec".into())),
            }
        })
        .collect()
}

/// Parse an init DSL string (steps separated by `&`, no read specs) into
/// a flat list of writes executed in order.
pub fn parse_init_writes(s: &str) -> Result<Vec<WriteSpec>, DslError> {
    let records = parse_dsl(s)?;
    let mut writes = Vec::new();
    for record in records {
        for step in record {
            if step.read.is_some() {
                return Err(DslError("init step must not carry a read spec".into()));
            }
            writes.push(step.write);
        }
    }
    Ok(writes)
}

/// One step of a poll sequence: write a command, then read back a fixed
/// number of bytes.
#[derive(Clone, Debug)]
pub struct PollStep {
    pub write: WriteSpec,
    pub read_len: usize,
    /// If nonzero and this isn't the last step, the poll suspends after
    /// this step and resumes on a later worker cycle once `bar_after_ms`
    /// has elapsed, e.g. to give a sensor time to latch a
    /// conversion result between a trigger write and its read.
    pub bar_after_ms: u32,
}

/// Parse a poll DSL string (`"c"` field of the poll config JSON) into
/// an ordered list of poll steps. Each step is `<write>=<read>`, optionally
/// suffixed with `@bar<ms>` to declare a post-step cooldown, e.g.
/// `"0x08=r2@bar50"`.
pub fn parse_poll_steps(s: &str) -> Result<Vec<PollStep>, DslError> {
    let mut steps = Vec::new();
    for record in s.split(';').map(str::trim).filter(|r| !r.is_empty()) {
        for step_str in record.split('&').map(str::trim) {
            let (step_str, bar_after_ms) = match step_str.split_once('@') {
                Some((base, suffix)) => {
                    let digits = suffix.strip_prefix("bar").ok_or_else(|| {
                        DslError(format!("poll step {step_str:?} has an unrecognized @ suffix"))
                    })?;
                    let ms: u32 = digits.parse().map_err(|_| {
                        DslError(format!("poll step {step_str:?} has a non-numeric bar duration"))
                    })?;
                    (base, ms)
                }
                None => (step_str, 0),
            };
            let step = parse_step(step_str)?;
            let read_len = match step.read {
                Some(r) => r.read_len(),
                None => return Err(DslError("poll step must declare a read length".into())),
            };
            steps.push(PollStep {
                write: step.write,
                read_len,
                bar_after_ms,
            });
        }
    }
    Ok(steps)
}

/// The set of addresses a catalog entry claims, either enumerated or an
/// inclusive range.
#[derive(Clone, Debug)]
pub enum AddressSet {
    List(Vec<u8>),
    Range(u8, u8),
}

impl AddressSet {
    pub fn contains(&self, addr: u8) -> bool {
        match self {
            Self::List(addrs) => addrs.contains(&addr),
            Self::Range(lo, hi) => (*lo..=*hi).contains(&addr),
        }
    }
}

/// One decoded field out of a poll record.
#[derive(Clone, Debug, PartialEq)]
pub struct PollSample {
    pub label: &'static str,
    pub value: f64,
}

/// A pure function translating a raw poll-step reply buffer (the
/// concatenation of every poll step's bytes, sans the timestamp prefix)
/// into typed samples.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> Vec<PollSample> + Send + Sync>;

/// Poll schedule and wire steps for one device type.
#[derive(Clone)]
pub struct PollConfig {
    pub steps: Vec<PollStep>,
    pub interval_ms: u32,
    pub samples_to_store: u16,
}

impl PollConfig {
    pub fn raw_record_size(&self) -> usize {
        self.steps.iter().map(|s| s.read_len).sum()
    }
}

/// An immutable catalog entry.
#[derive(Clone)]
pub struct DeviceTypeRecord {
    pub type_name: String,
    pub address_set: AddressSet,
    pub detection_pairs: Vec<DetectionPair>,
    pub init_pairs: Vec<WriteSpec>,
    pub poll: PollConfig,
    pub decode: DecodeFn,
}

/// Builds a [`DeviceTypeRecord`] from DSL strings, matching the
/// compile-time catalog generator's inputs.
pub struct DeviceTypeBuilder {
    type_name: String,
    address_set: AddressSet,
    detection_pairs: Vec<DetectionPair>,
    init_pairs: Vec<WriteSpec>,
    poll: PollConfig,
}

impl DeviceTypeBuilder {
    pub fn new(type_name: impl Into<String>, address_set: AddressSet) -> Self {
        Self {
            type_name: type_name.into(),
            address_set,
            detection_pairs: Vec::new(),
            init_pairs: Vec::new(),
            poll: PollConfig {
                steps: Vec::new(),
                interval_ms: 0,
                samples_to_store: 0,
            },
        }
    }

    pub fn detection(mut self, dsl: &str) -> Result<Self, DslError> {
        self.detection_pairs = parse_detection_pairs(dsl)?;
        Ok(self)
    }

    pub fn init(mut self, dsl: &str) -> Result<Self, DslError> {
        self.init_pairs = parse_init_writes(dsl)?;
        Ok(self)
    }

    pub fn poll(mut self, dsl: &str, interval_ms: u32, samples_to_store: u16) -> Result<Self, DslError> {
        self.poll = PollConfig {
            steps: parse_poll_steps(dsl)?,
            interval_ms,
            samples_to_store,
        };
        Ok(self)
    }

    pub fn build(self, decode: DecodeFn) -> DeviceTypeRecord {
        DeviceTypeRecord {
            type_name: self.type_name,
            address_set: self.address_set,
            detection_pairs: self.detection_pairs,
            init_pairs: self.init_pairs,
            poll: self.poll,
            decode,
        }
    }
}

/// The process-wide, immutable device-type catalog.
#[derive(Clone, Default)]
pub struct DeviceTypeCatalog {
    records: Vec<DeviceTypeRecord>,
}

impl DeviceTypeCatalog {
    pub fn new(records: Vec<DeviceTypeRecord>) -> Self {
        Self { records }
    }

    /// Candidates whose address set includes `addr`, in catalog order.
    pub fn candidates_for(&self, addr: u8) -> impl Iterator<Item = (u16, &DeviceTypeRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(move |(_, r)| r.address_set.contains(addr))
            .map(|(i, r)| (i as u16, r))
    }

    pub fn get(&self, index: u16) -> Option<&DeviceTypeRecord> {
        self.records.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_spec_parses_hex_bytes() {
        assert_eq!(parse_write("0x041007").unwrap(), vec![0x04, 0x10, 0x07]);
    }

    #[test]
    fn write_spec_without_prefix_is_rejected() {
        assert!(parse_write("041007").is_err());
    }

    #[test]
    fn read_pattern_dont_cares_are_ignored_when_matching() {
        let spec = parse_read("0b1xxxxxxx").unwrap();
        assert!(spec.matches(&[0x80]));
        assert!(spec.matches(&[0xFF]));
        assert!(!spec.matches(&[0x00]));
    }

    #[test]
    fn read_length_form_only_checks_size() {
        let spec = parse_read("r2").unwrap();
        assert!(spec.matches(&[1, 2]));
        assert!(!spec.matches(&[1, 2, 3]));
    }

    #[test]
    fn detection_pairs_parse_multiple_records() {
        let pairs = parse_detection_pairs("0x0c=0b00001001;0x04=0b10010000").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].write, vec![0x0c]);
        assert_eq!(pairs[1].pattern, vec![0x90]);
    }

    #[test]
    fn detection_step_without_read_spec_is_rejected() {
        assert!(parse_detection_pairs("0x0c").is_err());
    }

    #[test]
    fn init_writes_parse_ampersand_joined_steps() {
        let writes = parse_init_writes("0x0011&0x0201").unwrap();
        assert_eq!(writes, vec![vec![0x00, 0x11], vec![0x02, 0x01]]);
    }

    #[test]
    fn poll_steps_parse_the_vcnl4040_scenario_string() {
        let steps = parse_poll_steps("0x08=r2&0x09=r2&0x0a=r2").unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].write, vec![0x08]);
        assert_eq!(steps[0].read_len, 2);
        assert_eq!(steps[0].bar_after_ms, 0);
    }

    #[test]
    fn poll_step_bar_suffix_is_parsed_and_defaults_to_zero() {
        let steps = parse_poll_steps("0x00=r1@bar50&0x01=r1").unwrap();
        assert_eq!(steps[0].bar_after_ms, 50);
        assert_eq!(steps[1].bar_after_ms, 0);
    }

    #[test]
    fn poll_step_bad_bar_suffix_is_rejected() {
        assert!(parse_poll_steps("0x00=r1@foo50").is_err());
        assert!(parse_poll_steps("0x00=r1@barxyz").is_err());
    }

    #[test]
    fn address_set_range_and_list_membership() {
        assert!(AddressSet::Range(0x60, 0x63).contains(0x61));
        assert!(!AddressSet::Range(0x60, 0x63).contains(0x64));
        assert!(AddressSet::List(vec![0x29, 0x60]).contains(0x29));
    }

    fn vcnl4040() -> DeviceTypeRecord {
        DeviceTypeBuilder::new("vcnl4040", AddressSet::List(vec![0x60]))
            .detection("0x0c=0b00001001")
            .unwrap()
            .init("0x0011&0x0201")
            .unwrap()
            .poll("0x08=r2&0x09=r2&0x0a=r2", 100, 16)
            .unwrap()
            .build(Arc::new(|raw: &[u8]| {
                vec![
                    PollSample {
                        label: "prox",
                        value: u16::from_le_bytes([raw[0], raw[1]]) as f64,
                    },
                    PollSample {
                        label: "als",
                        value: u16::from_le_bytes([raw[2], raw[3]]) as f64 / 10.0,
                    },
                    PollSample {
                        label: "white",
                        value: u16::from_le_bytes([raw[4], raw[5]]) as f64 / 10.0,
                    },
                ]
            }))
    }

    #[test]
    fn catalog_finds_candidates_by_address() {
        let catalog = DeviceTypeCatalog::new(vec![vcnl4040()]);
        let found: Vec<_> = catalog.candidates_for(0x60).collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.type_name, "vcnl4040");
        assert!(catalog.candidates_for(0x61).next().is_none());
    }

    #[test]
    fn decode_fn_produces_labeled_samples() {
        let catalog = DeviceTypeCatalog::new(vec![vcnl4040()]);
        let record = catalog.get(0).unwrap();
        let samples = (record.decode)(&[0x10, 0x00, 0x64, 0x00, 0xC8, 0x00]);
        assert_eq!(samples[0], PollSample { label: "prox", value: 16.0 });
        assert_eq!(samples[1], PollSample { label: "als", value: 10.0 });
        assert_eq!(samples[2], PollSample { label: "white", value: 20.0 });
    }
}
