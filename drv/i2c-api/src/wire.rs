// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-wire poll-record layout.
//!
//! A poll record crosses a thread boundary: it is produced by a worker
//! thread and consumed by a caller that may not even link
//! `drv-i2c-core`, so the header derives `zerocopy`'s traits on a
//! `#[repr(C)]` type instead of being hand-rolled byte slicing.

use zerocopy::{FromBytes, IntoBytes};

use crate::TIMESTAMP_UNIT_US;

/// The first two bytes of every poll record: a little-endian tick count
/// in `TIMESTAMP_UNIT_US` units, wrapping at `u16::MAX`.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    zerocopy::IntoBytes,
    zerocopy::FromBytes,
    zerocopy::Immutable,
    zerocopy::KnownLayout,
)]
#[repr(C)]
pub struct PollRecordHeader {
    ticks_le: u16,
}

impl PollRecordHeader {
    pub fn new(ticks: u16) -> Self {
        Self { ticks_le: ticks.to_le() }
    }

    pub fn ticks(&self) -> u16 {
        u16::from_le(self.ticks_le)
    }
}

/// Splits a raw poll record into its header and device-defined payload.
/// Returns `None` if `record` is shorter than the header.
pub fn split_record(record: &[u8]) -> Option<(PollRecordHeader, &[u8])> {
    let (header, payload) = PollRecordHeader::ref_from_prefix(record).ok()?;
    Some((*header, payload))
}

/// Reconstructs monotonically non-decreasing absolute timestamps from a
/// stream of wrapping 16-bit tick counts.
///
/// One decoder instance per device stream: the wrap offset is only valid
/// when fed consecutive records from the same ring in order.
#[derive(Default)]
pub struct PollTimestampDecoder {
    last_ticks: Option<u16>,
    wrap_offset: u64,
}

impl PollTimestampDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one record's raw tick count, returning the absolute tick
    /// count in `TIMESTAMP_UNIT_US` units since this decoder's first
    /// call. Adds a full `u16` wrap whenever the raw count goes backward
    /// relative to the previous call.
    pub fn decode_ticks(&mut self, raw_ticks: u16) -> u64 {
        if let Some(last) = self.last_ticks {
            if raw_ticks < last {
                self.wrap_offset += u64::from(u16::MAX) + 1;
            }
        }
        self.last_ticks = Some(raw_ticks);
        self.wrap_offset + u64::from(raw_ticks)
    }

    /// Convenience over [`Self::decode_ticks`] returning absolute
    /// microseconds.
    pub fn decode_micros(&mut self, raw_ticks: u16) -> u64 {
        self.decode_ticks(raw_ticks) * TIMESTAMP_UNIT_US
    }

    /// Splits `record` and feeds its header through [`Self::decode_ticks`]
    /// in one step, returning the absolute tick count and the payload.
    pub fn decode_record<'a>(&mut self, record: &'a [u8]) -> Option<(u64, &'a [u8])> {
        let (header, payload) = split_record(record)?;
        Some((self.decode_ticks(header.ticks()), payload))
    }
}
