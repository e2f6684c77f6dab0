// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cascaded multiplexer-tree addressing.
//!
//! Built on `drv-i2c-mux-core::{Pca9545, Pca9548}` for the wire protocol,
//! with each chip modeled as gating a downstream bus segment. Mux chips
//! are discovered dynamically (not pre-declared one per cascade level),
//! each keyed by the slot through which *it* is reached, so two chips can
//! legitimately share an I2C address as long as they live behind
//! different slots.

use drv_i2c_api::{AddrSlot, ElemStatusChange, ResponseCode};
use drv_i2c_mux_core::{channel_bit, I2cMuxChip, Pca9548};
use drv_i2c_types::I2cHardware;
use log::{debug, info, warn};

use crate::central::I2CCentral;

/// Channels per physical mux chip; the tree's `divmod(slot_num - 1, 8)`
/// addressing is sized around PCA9548.
pub const CHANNELS_PER_MUX: u8 = Pca9548::CHANNEL_COUNT;

/// Largest number of distinct mux chips one tree tracks.
pub const MUX_MAX: usize = 16;

/// Deepest a slot's mux chain may cascade.
pub const MAX_CASCADE_LEVEL: u8 = 5;

/// Consecutive consistent observations *on the same `conn_slot`* required
/// before a mux chip is trusted online.
pub const DETECTION_THRESHOLD: u8 = 2;

/// One physical mux chip, keyed by `(addr, conn_slot)` so a chip reached
/// through a different slot is tracked as a distinct record even if it
/// shares an address with another chip elsewhere in the tree.
struct MuxRecord {
    addr: u8,
    /// The slot through which this mux chip itself is reached; `0` means
    /// directly on the main bus.
    conn_slot: u8,
    detection_count: u8,
    is_online: bool,
    current_channel_mask: u8,
}

/// Decompose a 1-based slot number into `(mux_idx, chan_idx)`. `mux_idx` indexes into the tree's
/// discovery-ordered record list, not a physical address.
fn divmod_slot(slot_num: u8) -> (usize, u8) {
    let zero_based = (slot_num - 1) as u32;
    (
        (zero_based / CHANNELS_PER_MUX as u32) as usize,
        (zero_based % CHANNELS_PER_MUX as u32) as u8,
    )
}

/// Tracks every mux chip discovered on a bus and resolves `(bus-addr,
/// slot)` targets down to the channel writes needed to reach them,
/// including chips reached only through another chip's channel.
pub struct MultiplexerTree {
    records: Vec<MuxRecord>,
    min_addr: u8,
    max_addr: u8,
    enabled: bool,
}

impl MultiplexerTree {
    /// `min_addr..=max_addr` is the configured address range mux chips
    /// are expected in; `enabled` mirrors `MuxConfig::enable`.
    pub fn new(enabled: bool, min_addr: u8, max_addr: u8) -> Self {
        Self {
            records: Vec::new(),
            min_addr,
            max_addr,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True if `addr` falls in the configured mux address range, i.e.
    /// the scanner should treat a probe of it as mux detection rather
    /// than ordinary device discovery.
    pub fn in_mux_range(&self, addr: u8) -> bool {
        self.enabled && (self.min_addr..=self.max_addr).contains(&addr)
    }

    fn find(&self, addr: u8, conn_slot: u8) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.addr == addr && r.conn_slot == conn_slot)
    }

    fn find_or_register(&mut self, addr: u8, conn_slot: u8) -> Option<usize> {
        if let Some(i) = self.find(addr, conn_slot) {
            return Some(i);
        }
        if self.records.len() >= MUX_MAX {
            return None;
        }
        self.records.push(MuxRecord {
            addr,
            conn_slot,
            detection_count: 0,
            is_online: false,
            current_channel_mask: 0,
        });
        Some(self.records.len() - 1)
    }

    /// Every slot currently reachable: the main bus plus every channel of
    /// every online mux chip, used by the scanner to grow its sweep as
    /// topology is discovered.
    pub fn known_slots(&self) -> Vec<u8> {
        let mut slots = vec![0u8];
        for (idx, rec) in self.records.iter().enumerate() {
            if rec.is_online {
                let base = idx as u8 * CHANNELS_PER_MUX;
                slots.extend((0..CHANNELS_PER_MUX).map(|c| base + c + 1));
            }
        }
        slots
    }

    /// Feed one probe observation of a candidate mux address into its
    /// detection counter. Returns `Some(..)` exactly on a
    /// transition (online or offline), which the caller uses to restart
    /// mux-only scanning ("topology changed").
    pub fn elem_state_change(
        &mut self,
        addr: u8,
        conn_slot: u8,
        responding: bool,
    ) -> Result<Option<ElemStatusChange>, ResponseCode> {
        let Some(idx) = self.find_or_register(addr, conn_slot) else {
            return Err(ResponseCode::Invalid);
        };
        let rec = &mut self.records[idx];
        let packed = AddrSlot::new(addr, conn_slot);
        if responding {
            rec.detection_count = rec.detection_count.saturating_add(1);
            if !rec.is_online && rec.detection_count >= DETECTION_THRESHOLD {
                rec.is_online = true;
                info!(
                    target: "i2c_core::mux",
                    "mux {addr:#04x} behind slot {conn_slot} online (mux_idx {idx})"
                );
                return Ok(Some(ElemStatusChange::online(packed)));
            }
            Ok(None)
        } else {
            rec.detection_count = 0;
            if rec.is_online {
                rec.is_online = false;
                warn!(
                    target: "i2c_core::mux",
                    "mux {addr:#04x} behind slot {conn_slot} went offline"
                );
                return Ok(Some(ElemStatusChange::offline(packed)));
            }
            Ok(None)
        }
    }

    pub fn is_online(&self, addr: u8, conn_slot: u8) -> bool {
        self.find(addr, conn_slot)
            .map(|i| self.records[i].is_online)
            .unwrap_or(false)
    }

    /// The `conn_slot` of `addr`'s online record, if it has one. Used by
    /// the scanner to honor "never probe a mux address at a slot
    /// inconsistent with its recorded `conn_slot`" once a mux chip
    /// has actually been confirmed online somewhere.
    pub fn online_conn_slot(&self, addr: u8) -> Option<u8> {
        self.records
            .iter()
            .find(|r| r.addr == addr && r.is_online)
            .map(|r| r.conn_slot)
    }

    /// The slot number that selects channel `chan` of the mux chip at
    /// `(addr, conn_slot)`, if that chip has been discovered. Used by
    /// [`crate::ioexpander::IOExpanderSet`] to resolve a statically
    /// configured `(mux_addr, mux_chan_idx)` pair down to a slot it can
    /// pass to `enable_one_slot`.
    pub fn slot_for_channel(&self, addr: u8, conn_slot: u8, chan: u8) -> Option<u8> {
        let idx = self.find(addr, conn_slot)?;
        Some(idx as u8 * CHANNELS_PER_MUX + chan + 1)
    }

    /// Select the channel path leading to `slot`, recursing into the
    /// target mux's own `conn_slot` first if it is itself reached
    /// through another mux's channel.
    pub fn enable_one_slot<H: I2cHardware>(
        &mut self,
        central: &mut I2CCentral<H>,
        slot: u8,
    ) -> Result<(), ResponseCode> {
        if slot == 0 {
            self.disable_all_slots(central)?;
            return Ok(());
        }
        self.select_path(central, slot, 0)
    }

    fn select_path<H: I2cHardware>(
        &mut self,
        central: &mut I2CCentral<H>,
        slot: u8,
        depth: u8,
    ) -> Result<(), ResponseCode> {
        if depth >= MAX_CASCADE_LEVEL {
            warn!(target: "i2c_core::mux", "cascade depth exceeded resolving slot {slot}");
            return Err(ResponseCode::Invalid);
        }
        let (mux_idx, chan) = divmod_slot(slot);
        let Some(rec) = self.records.get(mux_idx) else {
            return Err(ResponseCode::Invalid);
        };
        let conn_slot = rec.conn_slot;
        if conn_slot != 0 {
            if conn_slot == slot {
                return Err(ResponseCode::Invalid); // self-referential cycle
            }
            self.select_path(central, conn_slot, depth + 1)?;
        }
        let Some(bit) = channel_bit::<Pca9548>(chan) else {
            return Err(ResponseCode::Invalid);
        };
        let rec = &mut self.records[mux_idx];
        if rec.current_channel_mask != bit {
            central.access(rec.addr, &[bit], &mut [])?;
            rec.current_channel_mask = bit;
            debug!(
                target: "i2c_core::mux",
                "mux_idx {mux_idx} ({:#04x}) channel {chan} selected for slot {slot}",
                rec.addr
            );
        }
        Ok(())
    }

    /// Isolate every slot. Chips reached only through another chip's
    /// channel are cleared first, since a hardware reset pin on a
    /// top-level chip cannot reach them.
    pub fn disable_all_slots<H: I2cHardware>(
        &mut self,
        central: &mut I2CCentral<H>,
    ) -> Result<(), ResponseCode> {
        let mut order: Vec<usize> = (0..self.records.len()).collect();
        order.sort_by_key(|&i| if self.records[i].conn_slot == 0 { 1 } else { 0 });
        for i in order {
            if self.records[i].current_channel_mask != 0 {
                let addr = self.records[i].addr;
                central.access(addr, &[0], &mut [])?;
                self.records[i].current_channel_mask = 0;
            }
        }
        Ok(())
    }
}
