// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware abstraction for the I2C master engine.
//!
//! This crate works on both the host and embedded system, so it can be
//! used in host-side tests: `drv-i2c-core`'s worker, scanner, mux tree and
//! every other component are generic over [`I2cHardware`] and never touch
//! registers directly, which keeps the driving logic (here, `I2CCentral`
//! in `drv-i2c-core`) hardware-agnostic and gives it a stable, testable
//! surface.

pub mod mock;

use drv_i2c_api::ResponseCode;

/// Parameters an `I2CCentral` passes to the hardware at `init` time
#[derive(Copy, Clone, Debug)]
pub struct HardwareInit {
    pub port: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    pub freq_hz: u32,
    pub filter_level: u8,
}

impl Default for HardwareInit {
    fn default() -> Self {
        Self {
            port: 0,
            sda_pin: 0,
            scl_pin: 0,
            freq_hz: 100_000,
            filter_level: 0,
        }
    }
}

/// I2C bus speed presets, convenience over a raw `freq_hz`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum I2cSpeed {
    Standard,
    Fast,
    FastPlus,
    HighSpeed,
}

impl I2cSpeed {
    pub const fn hz(self) -> u32 {
        match self {
            Self::Standard => 100_000,
            Self::Fast => 400_000,
            Self::FastPlus => 1_000_000,
            Self::HighSpeed => 3_400_000,
        }
    }
}

/// Hardware abstraction trait for one I2C master engine.
///
/// A `Bus` (in `drv-i2c-core`) owns exactly one implementor of this trait.
/// There is no separate controller-index parameter on every call, because
/// one [`I2cHardware`] value already *is* one controller: each physical
/// bus gets its own hardware instance.
///
/// # Implementation notes
///
/// - Register programming, interrupt management, GPIO/clock setup and bus
///   recovery primitives are all implementation details of a concrete
///   backend; the CORE only calls the methods below.
/// - `raw_access` must implement the four write/read-length combinations
///   bit-exact; `drv-i2c-core::I2CCentral` is responsible for
///   command-count budgeting and timeout policy, not this trait.
pub trait I2cHardware: Send {
    /// Hardware-specific error type, convertible to the shared taxonomy.
    type Error: Into<ResponseCode> + core::fmt::Debug;

    /// Bring the controller up: configure pins, clock tree, interrupts.
    fn init(&mut self, cfg: &HardwareInit) -> Result<(), Self::Error>;

    /// Tear the controller down and release its pins/interrupts.
    fn deinit(&mut self) -> Result<(), Self::Error>;

    /// True while a transaction is in flight.
    fn is_busy(&self) -> bool;

    /// True if the controller's own health checks pass (distinct from bus
    /// topology health, which `StatusManager` tracks separately).
    fn is_operating_ok(&self) -> bool;

    /// The largest number of engine command slots the hardware queue can
    /// hold in one transaction, including the implicit START/STOP.
    fn max_queue_commands(&self) -> usize;

    /// Perform one raw transaction. `write` and `read_buf` select which of
    /// the four cases applies; returns the number of bytes actually
    /// read.
    fn raw_access(
        &mut self,
        addr: u8,
        write: &[u8],
        read_buf: &mut [u8],
    ) -> Result<usize, Self::Error>;

    /// Sample SDA and SCL once; returns `(sda_low, scl_low)`. Used by
    /// `BusStuckHandler::is_stuck`.
    fn sample_lines(&mut self) -> (bool, bool);

    /// Issue one clock pulse on SCL while leaving SDA floating, used by
    /// `BusStuckHandler::clear_by_clocking` to nudge a wedged slave into
    /// releasing the bus.
    fn clock_pulse(&mut self);
}
