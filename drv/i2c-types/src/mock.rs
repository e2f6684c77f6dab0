// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Programmable mock I2C hardware for host-side testing.
//!
//! Just enough I2C simulation to exercise the worker, scanner, and
//! identity/polling logic without real hardware: a per-address
//! byte-addressable register file (so detection/poll DSL reads have
//! something realistic to decode), one-shot error injection, and a
//! stuck-bus simulation for `BusStuckHandler` tests.

use std::collections::HashMap;

use drv_i2c_api::ResponseCode;

use crate::{HardwareInit, I2cHardware};

/// One simulated device: present/absent, plus a flat register file
/// addressed the way simple sensor/EEPROM-style devices are (first write
/// byte selects a register, subsequent bytes are written or read from
/// there onward).
#[derive(Clone, Debug, Default)]
struct MockDevice {
    present: bool,
    registers: HashMap<u8, u8>,
    /// If `Some`, overrides ACK/NACK for the *next* access to this device.
    force_error: Option<ResponseCode>,
}

/// Mock I2C hardware backend.
#[derive(Debug, Default)]
pub struct MockI2cHardware {
    devices: HashMap<u8, MockDevice>,
    initialized: bool,
    busy: bool,
    operating_ok: bool,
    max_queue_commands: usize,
    sda_stuck_low: bool,
    scl_stuck_low: bool,
    /// Number of remaining `clock_pulse` calls before a stuck bus clears.
    clocks_to_clear: u32,
    pub init_count: u32,
    pub deinit_count: u32,
    pub transaction_count: u32,
}

impl MockI2cHardware {
    pub fn new() -> Self {
        Self {
            operating_ok: true,
            max_queue_commands: 16,
            ..Default::default()
        }
    }

    /// Add (or update) a device at `addr` so it ACKs its address.
    pub fn add_device(&mut self, addr: u8) -> &mut Self {
        self.devices.entry(addr).or_default().present = true;
        self
    }

    /// Remove a device so it stops ACKing.
    pub fn remove_device(&mut self, addr: u8) {
        if let Some(dev) = self.devices.get_mut(&addr) {
            dev.present = false;
        }
    }

    /// Seed a device's register file, e.g. for detection patterns or poll
    /// reads.
    pub fn set_register(&mut self, addr: u8, reg: u8, value: u8) {
        self.devices.entry(addr).or_default().registers.insert(reg, value);
    }

    pub fn set_registers(&mut self, addr: u8, reg_start: u8, values: &[u8]) {
        for (i, v) in values.iter().enumerate() {
            self.set_register(addr, reg_start.wrapping_add(i as u8), *v);
        }
    }

    /// Make the next access to `addr` fail with `error`.
    pub fn inject_error(&mut self, addr: u8, error: ResponseCode) {
        self.devices.entry(addr).or_default().force_error = Some(error);
    }

    /// Simulate a wedged bus: both SDA and SCL read low until
    /// `clock_pulse` has been called `clocks_to_clear` times.
    pub fn simulate_stuck(&mut self, clocks_to_clear: u32) {
        self.sda_stuck_low = true;
        self.scl_stuck_low = true;
        self.clocks_to_clear = clocks_to_clear;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn set_max_queue_commands(&mut self, n: usize) {
        self.max_queue_commands = n;
    }

    pub fn set_operating_ok(&mut self, ok: bool) {
        self.operating_ok = ok;
    }
}

impl I2cHardware for MockI2cHardware {
    type Error = ResponseCode;

    fn init(&mut self, _cfg: &HardwareInit) -> Result<(), Self::Error> {
        self.initialized = true;
        self.busy = false;
        self.init_count += 1;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), Self::Error> {
        self.initialized = false;
        self.deinit_count += 1;
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn is_operating_ok(&self) -> bool {
        self.operating_ok
    }

    fn max_queue_commands(&self) -> usize {
        self.max_queue_commands
    }

    fn raw_access(
        &mut self,
        addr: u8,
        write: &[u8],
        read_buf: &mut [u8],
    ) -> Result<usize, Self::Error> {
        if !self.initialized {
            return Err(ResponseCode::NotReady);
        }
        self.transaction_count += 1;

        let Some(dev) = self.devices.get_mut(&addr) else {
            return Err(ResponseCode::AckError);
        };
        if let Some(err) = dev.force_error.take() {
            return Err(err);
        }
        if !dev.present {
            return Err(ResponseCode::AckError);
        }

        if write.is_empty() && read_buf.is_empty() {
            // Bare probe: the ACK above is the whole transaction.
            return Ok(0);
        }

        if !write.is_empty() {
            let reg = write[0];
            for (i, byte) in write[1..].iter().enumerate() {
                dev.registers.insert(reg.wrapping_add(i as u8), *byte);
            }
            if read_buf.is_empty() {
                return Ok(0);
            }
            for (i, slot) in read_buf.iter_mut().enumerate() {
                *slot = *dev.registers.get(&reg.wrapping_add(i as u8)).unwrap_or(&0);
            }
            return Ok(read_buf.len());
        }

        // Read with no preceding write: read from register 0 onward.
        for (i, slot) in read_buf.iter_mut().enumerate() {
            *slot = *dev.registers.get(&(i as u8)).unwrap_or(&0);
        }
        Ok(read_buf.len())
    }

    fn sample_lines(&mut self) -> (bool, bool) {
        (self.sda_stuck_low, self.scl_stuck_low)
    }

    fn clock_pulse(&mut self) {
        if self.clocks_to_clear > 0 {
            self.clocks_to_clear -= 1;
            if self.clocks_to_clear == 0 {
                self.sda_stuck_low = false;
                self.scl_stuck_low = false;
            }
        }
    }
}
