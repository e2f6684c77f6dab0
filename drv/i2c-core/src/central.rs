// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The I2C master engine wrapper.
//!
//! Tracks init state, computes a per-transaction timeout from the
//! configured bus frequency, and budgets engine command slots against the
//! hardware queue depth before issuing a transaction, generalized over
//! [`I2cHardware`] so it drives any backend the same way.

use std::time::{Duration, Instant};

use drv_i2c_api::ResponseCode;
use drv_i2c_types::{HardwareInit, I2cHardware};
use log::{debug, warn};

/// Fixed per-transaction overhead (START/address/STOP framing, controller
/// setup) added on top of the bit-rate-proportional data time when
/// computing a software timeout.
const TIMEOUT_OVERHEAD_MS: u64 = 5;

/// Extra slack multiplier applied to the computed timeout so a correctly
/// operating but slow device is not barred spuriously.
const TIMEOUT_SLACK_NUM: u64 = 3;
const TIMEOUT_SLACK_DEN: u64 = 2;

/// Engine command slots consumed by the implicit START and STOP framing
/// that every transaction needs regardless of payload size.
const FRAMING_COMMANDS: usize = 2;

/// Wraps one [`I2cHardware`] implementor with the timeout policy and
/// command-budgeting rules required for one transaction.
pub struct I2CCentral<H: I2cHardware> {
    hw: H,
    cfg: HardwareInit,
    ready: bool,
}

impl<H: I2cHardware> I2CCentral<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            cfg: HardwareInit::default(),
            ready: false,
        }
    }

    /// Bring the controller up with the given parameters.
    pub fn init(&mut self, cfg: HardwareInit) -> Result<(), ResponseCode> {
        self.hw.init(&cfg).map_err(|e| {
            warn!(target: "i2c_core::central", "hardware init failed: {e:?}");
            e.into()
        })?;
        self.cfg = cfg;
        self.ready = true;
        Ok(())
    }

    pub fn deinit(&mut self) -> Result<(), ResponseCode> {
        self.ready = false;
        self.hw.deinit().map_err(Into::into)
    }

    pub fn is_busy(&self) -> bool {
        self.hw.is_busy()
    }

    pub fn is_operating_ok(&self) -> bool {
        self.ready && self.hw.is_operating_ok()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    /// Reinitializes the controller if it reports itself unhealthy; a
    /// no-op when everything looks healthy.
    pub fn ensure_ready(&mut self) -> Result<(), ResponseCode> {
        if !self.ready {
            return self.init(self.cfg);
        }
        if !self.hw.is_operating_ok() {
            debug!(
                target: "i2c_core::central",
                "controller unhealthy, reinitializing"
            );
            return self.init(self.cfg);
        }
        Ok(())
    }

    /// The number of engine command slots this transaction would need:
    /// one per addressed phase (write, or write-then-read needs a
    /// restart) plus framing, and one slot per data byte.
    fn commands_needed(write_len: usize, read_len: usize) -> usize {
        let phases = if write_len > 0 && read_len > 0 { 2 } else { 1 };
        FRAMING_COMMANDS + phases + write_len + read_len
    }

    /// Software timeout for a transaction of this size at the configured
    /// bus frequency: data time (`bytes * 10 bits / freq_hz`) plus fixed
    /// overhead, with slack applied.
    fn timeout_for(&self, write_len: usize, read_len: usize) -> Duration {
        let bytes = (write_len + read_len).max(1) as u64;
        let freq = self.cfg.freq_hz.max(1) as u64;
        let data_ms = (bytes * 10 * 1000) / freq;
        let base_ms = data_ms + TIMEOUT_OVERHEAD_MS;
        Duration::from_millis(base_ms * TIMEOUT_SLACK_NUM / TIMEOUT_SLACK_DEN)
    }

    /// Run one transaction, matching the four write/read-length
    /// cases bit-exactly:
    ///
    /// - `write` empty, `read_buf` empty: bare address probe.
    /// - `write` non-empty, `read_buf` empty: write-only.
    /// - `write` empty, `read_buf` non-empty: read-only from wherever the
    ///   device's internal pointer currently sits.
    /// - both non-empty: write (typically a register pointer), then a
    ///   repeated-start read.
    ///
    /// Returns the number of bytes actually read.
    pub fn access(
        &mut self,
        addr: u8,
        write: &[u8],
        read_buf: &mut [u8],
    ) -> Result<usize, ResponseCode> {
        if !self.ready {
            return Err(ResponseCode::NotInit);
        }

        let needed = Self::commands_needed(write.len(), read_buf.len());
        let budget = self.hw.max_queue_commands().saturating_sub(FRAMING_COMMANDS);
        if needed > self.hw.max_queue_commands() || write.len() + read_buf.len() > budget {
            return Err(ResponseCode::Invalid);
        }

        let timeout = self.timeout_for(write.len(), read_buf.len());
        let started = Instant::now();
        let result = self.hw.raw_access(addr, write, read_buf);
        let elapsed = started.elapsed();
        if elapsed > timeout {
            warn!(
                target: "i2c_core::central",
                "transaction to {addr:#04x} ran {elapsed:?}, budget was {timeout:?}"
            );
        }

        result.map_err(|e| {
            debug!(target: "i2c_core::central", "access to {addr:#04x} failed: {e:?}");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_i2c_types::mock::MockI2cHardware;

    fn central_with(hw_fn: impl FnOnce(&mut MockI2cHardware)) -> I2CCentral<MockI2cHardware> {
        let mut hw = MockI2cHardware::new();
        hw_fn(&mut hw);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        central
    }

    #[test]
    fn access_before_init_is_not_init() {
        let mut central = I2CCentral::new(MockI2cHardware::new());
        let mut buf = [0u8; 1];
        assert_eq!(
            central.access(0x50, &[], &mut buf),
            Err(ResponseCode::NotInit)
        );
    }

    #[test]
    fn bare_probe_succeeds_for_present_device() {
        let mut central = central_with(|hw| {
            hw.add_device(0x50);
        });
        assert_eq!(central.access(0x50, &[], &mut []), Ok(0));
    }

    #[test]
    fn probe_fails_for_absent_device() {
        let mut central = central_with(|_| {});
        assert_eq!(central.access(0x50, &[], &mut []), Err(ResponseCode::AckError));
    }

    #[test]
    fn write_then_read_round_trips_through_register_file() {
        let mut central = central_with(|hw| {
            hw.add_device(0x60);
            hw.set_registers(0x60, 0x10, &[0xDE, 0xAD]);
        });
        let mut buf = [0u8; 2];
        let n = central.access(0x60, &[0x10], &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [0xDE, 0xAD]);
    }

    #[test]
    fn oversize_transaction_is_rejected_before_reaching_hardware() {
        let mut central = central_with(|hw| {
            hw.add_device(0x22);
            hw.set_max_queue_commands(4);
        });
        let write = [0u8; 16];
        assert_eq!(central.access(0x22, &write, &mut []), Err(ResponseCode::Invalid));
    }

    #[test]
    fn ensure_ready_reinits_unhealthy_controller() {
        let mut central = central_with(|_| {});
        central.hardware_mut().set_operating_ok(false);
        central.ensure_ready().unwrap();
        assert!(central.hardware().is_initialized());
        assert_eq!(central.hardware().init_count, 2);
    }

    #[test]
    fn timeout_scales_with_transaction_size_and_inverse_frequency() {
        let central = central_with(|_| {});
        let small = central.timeout_for(1, 0);
        let large = central.timeout_for(64, 64);
        assert!(large > small);
    }
}
