// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPIO-expander-backed virtual pins for slot power control.
//!
//! Addresses a GPIO-expander chip through the same `I2cHardware` the rest
//! of the bus uses, wrapped in a flat "virtual pin" number space so
//! [`crate::power::PowerController`] never needs to know which
//! physical chip or register backs a given pin. Each chip is a simple
//! byte- or word-wide output port expander (PCF8574/PCA9555-style): a
//! single write sets every pin atomically, so writes are coalesced with a
//! dirty flag and flushed in a batch rather than one I2C transaction per
//! pin.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use drv_i2c_api::ResponseCode;
use drv_i2c_types::I2cHardware;
use log::{error, trace, warn};

use crate::central::I2CCentral;
use crate::config::IoExpanderConfig;
use crate::mux::MultiplexerTree;

/// Output register address written first on a dirty flush.
const OUTPUT_REG: u8 = 0x02;
/// Configuration (direction) register address, written after the output
/// register; `0` in a bit position means that pin is an output, matching
/// a PCA9555-style expander's reset default.
const CONFIG_REG: u8 = 0x06;

/// A completion callback registered via `virtual_pin_set`, invoked once
/// per flush with the aggregate write result.
pub type CompletionCallback = Arc<dyn Fn(Result<(), ResponseCode>) + Send + Sync>;

/// One physical GPIO-expander chip: shadow copies of its output and
/// configuration registers plus the virtual-pin range it backs, and
/// optionally the mux hop needed to reach it.
struct Expander {
    addr: u8,
    v_pin_base: u16,
    num_pins: u16,
    /// Shadow of the bits we believe are currently driven; bit `n`
    /// corresponds to virtual pin `v_pin_base + n`.
    output_shadow: u16,
    output_dirty: bool,
    /// Direction shadow; every pin here is configured as output and never
    /// changes after the first flush, but is still tracked so it follows
    /// the same dirty-flush discipline as the output register.
    config_shadow: u16,
    config_dirty: bool,
    mux_addr: Option<u8>,
    mux_chan_idx: Option<u8>,
}

impl Expander {
    fn bytes_needed(&self) -> usize {
        (self.num_pins as usize).div_ceil(8).max(1)
    }

    fn encode(&self, reg: u8, shadow: u16) -> Vec<u8> {
        let n = self.bytes_needed();
        let mut out = Vec::with_capacity(1 + n);
        out.push(reg);
        out.extend((0..n).map(|i| (shadow >> (i * 8)) as u8));
        out
    }
}

/// One pending completion callback, held deduplicated by identity of the
/// `Arc`: a closure already closes over whatever user data it needs, so
/// there's no separate `(callback, user_data)` pair to track.
#[derive(Clone)]
struct PendingCallback(CompletionCallback);

impl PendingCallback {
    fn same_as(&self, other: &CompletionCallback) -> bool {
        Arc::ptr_eq(&self.0, other)
    }
}

/// A flat namespace of "virtual pins" spanning every GPIO-expander chip on
/// a bus, with writes coalesced and flushed together.
#[derive(Default)]
pub struct IOExpanderSet {
    expanders: Vec<Expander>,
    pending_callbacks: Vec<PendingCallback>,
}

impl IOExpanderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chip from its configuration entry.
    pub fn add(&mut self, cfg: &IoExpanderConfig) {
        self.expanders.push(Expander {
            addr: cfg.addr,
            v_pin_base: cfg.v_pin_base,
            num_pins: cfg.num_pins,
            output_shadow: 0,
            output_dirty: true, // drive every output to its reset state on first flush
            config_shadow: 0,   // all pins output
            config_dirty: true,
            mux_addr: cfg.mux_addr,
            mux_chan_idx: cfg.mux_chan_idx,
        });
    }

    fn find_mut(&mut self, vpin: u16) -> Option<(&mut Expander, u16)> {
        self.expanders.iter_mut().find_map(|e| {
            if vpin >= e.v_pin_base && vpin < e.v_pin_base + e.num_pins {
                let bit = vpin - e.v_pin_base;
                Some((e, bit))
            } else {
                None
            }
        })
    }

    /// Set one virtual pin's level in the shadow register without
    /// touching hardware. Returns `Err(Invalid)` if no expander owns this
    /// pin number.
    pub fn set_pin(&mut self, vpin: u16, high: bool) -> Result<(), ResponseCode> {
        self.set_pin_with_callback(vpin, high, None)
    }

    /// As [`Self::set_pin`], additionally registering a completion
    /// callback to be invoked once, after the dirty flush that applies
    /// this write, with the aggregate result across every chip flushed
    /// that cycle. Registering the same callback (by `Arc` identity)
    /// again before it fires does not duplicate it.
    pub fn set_pin_with_callback(
        &mut self,
        vpin: u16,
        high: bool,
        callback: Option<CompletionCallback>,
    ) -> Result<(), ResponseCode> {
        let Some((expander, bit)) = self.find_mut(vpin) else {
            return Err(ResponseCode::Invalid);
        };
        let mask = 1u16 << bit;
        let new_shadow = if high {
            expander.output_shadow | mask
        } else {
            expander.output_shadow & !mask
        };
        if new_shadow != expander.output_shadow {
            expander.output_shadow = new_shadow;
            expander.output_dirty = true;
        }
        if let Some(cb) = callback {
            if !self.pending_callbacks.iter().any(|p| p.same_as(&cb)) {
                self.pending_callbacks.push(PendingCallback(cb));
            }
        }
        Ok(())
    }

    /// Current shadow state of a virtual pin, without touching hardware.
    pub fn get_pin(&self, vpin: u16) -> Option<bool> {
        self.expanders.iter().find_map(|e| {
            if vpin >= e.v_pin_base && vpin < e.v_pin_base + e.num_pins {
                Some(e.output_shadow & (1 << (vpin - e.v_pin_base)) != 0)
            } else {
                None
            }
        })
    }

    /// Write out every chip whose shadow registers have pending changes,
    /// routing through a mux channel first for any chip only reachable
    /// that way, and invoke every pending completion callback once with
    /// the aggregate result.
    pub fn flush<H: I2cHardware>(
        &mut self,
        mux: &mut MultiplexerTree,
        central: &mut I2CCentral<H>,
    ) -> Result<(), ResponseCode> {
        let mut result = Ok(());
        for expander in &mut self.expanders {
            if !expander.output_dirty && !expander.config_dirty {
                continue;
            }

            let routed_slot = match (expander.mux_addr, expander.mux_chan_idx) {
                (Some(mux_addr), Some(chan)) => {
                    match mux.slot_for_channel(mux_addr, 0, chan) {
                        Some(slot) => Some(slot),
                        None => {
                            warn!(
                                target: "i2c_core::ioexpander",
                                "expander {:#04x} routed mux {mux_addr:#04x}/{chan} not yet discovered, skipping",
                                expander.addr
                            );
                            continue;
                        }
                    }
                }
                _ => None,
            };

            if let Some(slot) = routed_slot {
                if let Err(e) = mux.enable_one_slot(central, slot) {
                    result = Err(e);
                    break;
                }
            }

            let write_result = (|| {
                if expander.output_dirty {
                    let bytes = expander.encode(OUTPUT_REG, expander.output_shadow);
                    trace!(
                        target: "i2c_core::ioexpander",
                        "flushing expander {:#04x} output: {:?}", expander.addr, bytes
                    );
                    central.access(expander.addr, &bytes, &mut [])?;
                }
                if expander.config_dirty {
                    let bytes = expander.encode(CONFIG_REG, expander.config_shadow);
                    trace!(
                        target: "i2c_core::ioexpander",
                        "flushing expander {:#04x} config: {:?}", expander.addr, bytes
                    );
                    central.access(expander.addr, &bytes, &mut [])?;
                }
                Ok(())
            })();

            if routed_slot.is_some() {
                let _ = mux.disable_all_slots(central);
            }

            match write_result {
                Ok(()) => {
                    expander.output_dirty = false;
                    expander.config_dirty = false;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        for pending in self.pending_callbacks.drain(..) {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (pending.0)(result))) {
                error!(target: "i2c_core::ioexpander", "ioexpander completion callback panicked: {panic:?}");
            }
        }

        result
    }

    /// True if any chip has pending, unflushed changes.
    pub fn has_pending(&self) -> bool {
        self.expanders.iter().any(|e| e.output_dirty || e.config_dirty)
    }

    /// Snapshot of every virtual pin's shadow output state, for
    /// diagnostics.
    pub fn snapshot(&self) -> BTreeMap<u16, bool> {
        let mut map = BTreeMap::new();
        for e in &self.expanders {
            for bit in 0..e.num_pins {
                map.insert(e.v_pin_base + bit, e.output_shadow & (1 << bit) != 0);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_i2c_types::mock::MockI2cHardware;
    use drv_i2c_types::HardwareInit;

    fn set_with_one_chip() -> IOExpanderSet {
        let mut set = IOExpanderSet::new();
        set.add(&IoExpanderConfig {
            dev: "pca9555".into(),
            addr: 0x20,
            mux_addr: None,
            mux_chan_idx: None,
            mux_rst_pin: None,
            v_pin_base: 0,
            num_pins: 16,
        });
        set
    }

    #[test]
    fn unknown_pin_is_invalid() {
        let mut set = set_with_one_chip();
        assert_eq!(set.set_pin(99, true), Err(ResponseCode::Invalid));
    }

    #[test]
    fn set_and_get_round_trip_before_flush() {
        let mut set = set_with_one_chip();
        set.set_pin(3, true).unwrap();
        assert_eq!(set.get_pin(3), Some(true));
        assert_eq!(set.get_pin(4), Some(false));
    }

    fn no_mux() -> MultiplexerTree {
        MultiplexerTree::new(false, 0x70, 0x77)
    }

    #[test]
    fn redundant_set_does_not_redirty_after_flush() {
        let mut set = set_with_one_chip();
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x20);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        let mut mux = no_mux();

        set.set_pin(0, true).unwrap();
        set.flush(&mut mux, &mut central).unwrap();
        assert!(!set.has_pending());

        set.set_pin(0, true).unwrap(); // same value, should not mark dirty
        assert!(!set.has_pending());
    }

    #[test]
    fn flush_writes_output_then_config_register_once_each() {
        let mut set = set_with_one_chip();
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x20);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        let mut mux = no_mux();

        set.set_pin(0, true).unwrap();
        set.set_pin(1, true).unwrap();
        set.set_pin(15, true).unwrap();
        set.flush(&mut mux, &mut central).unwrap();

        // One write for the output register, one for the configuration
        // register, on the chip's first flush.
        assert_eq!(central.hardware().transaction_count, 2);
        let snap = set.snapshot();
        assert_eq!(snap[&0], true);
        assert_eq!(snap[&2], false);
        assert_eq!(snap[&15], true);

        // A second flush with nothing dirty issues no transactions.
        let before = central.hardware().transaction_count;
        set.flush(&mut mux, &mut central).unwrap();
        assert_eq!(central.hardware().transaction_count, before);
    }

    #[test]
    fn completion_callback_fires_once_after_flush_even_if_registered_twice() {
        let mut set = set_with_one_chip();
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x20);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        let mut mux = no_mux();

        let calls = Arc::new(std::sync::Mutex::new(0usize));
        let calls_clone = Arc::clone(&calls);
        let cb: CompletionCallback = Arc::new(move |_result| {
            *calls_clone.lock().unwrap() += 1;
        });

        set.set_pin_with_callback(0, true, Some(Arc::clone(&cb))).unwrap();
        set.set_pin_with_callback(1, true, Some(Arc::clone(&cb))).unwrap();
        set.flush(&mut mux, &mut central).unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn mux_routed_expander_enables_and_disables_its_channel_around_the_write() {
        let mut set = IOExpanderSet::new();
        set.add(&IoExpanderConfig {
            dev: "pca9555".into(),
            addr: 0x21,
            mux_addr: Some(0x70),
            mux_chan_idx: Some(2),
            mux_rst_pin: None,
            v_pin_base: 0,
            num_pins: 8,
        });

        let mut hw = MockI2cHardware::new();
        hw.add_device(0x70);
        hw.add_device(0x21);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();

        let mut mux = MultiplexerTree::new(true, 0x70, 0x77);
        // Discover the mux chip on the main bus before it can be routed
        // through.
        mux.elem_state_change(0x70, 0, true).unwrap();
        mux.elem_state_change(0x70, 0, true).unwrap();
        assert!(mux.is_online(0x70, 0));

        set.set_pin(0, true).unwrap();
        assert!(set.flush(&mut mux, &mut central).is_ok());
    }
}
