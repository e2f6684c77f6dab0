// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus-stuck detection and clock-out recovery.
//!
//! Clocks SCL manually while sampling SDA, the standard way to unwedge a
//! slave holding the bus low after a reset. The clock-out loop bound is
//! [`BUS_CLEAR_ATTEMPTS`].

use std::thread;
use std::time::Duration;

use drv_i2c_api::ResponseCode;
use drv_i2c_types::I2cHardware;
use log::{info, warn};

/// Number of manual SCL pulses attempted before giving up on clearing a
/// stuck bus.
pub const BUS_CLEAR_ATTEMPTS: u32 = 5;

/// Delay between the two samples `is_stuck` takes, long enough that a
/// transient bus owner mid-clock will have released the lines by the
/// second sample.
pub const STUCK_RESAMPLE_US: u64 = 50;

/// Observes and clears a wedged I2C bus by pulsing SCL while SDA is
/// floating, the standard I2C bus-recovery sequence for a slave that is
/// holding SDA low mid-transaction.
#[derive(Default)]
pub struct BusStuckHandler {
    /// Total number of times `clear` has successfully unstuck the bus.
    pub recoveries: u32,
    /// Total number of times `clear` gave up after `BUS_CLEAR_ATTEMPTS`.
    pub recovery_failures: u32,
}

impl BusStuckHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample both lines twice with a short delay between samples; the
    /// bus is stuck only if either line reads low on *both* samples. A single low sample is not
    /// enough: it could be a transient bus owner mid-clock.
    pub fn is_stuck<H: I2cHardware>(&self, hw: &mut H) -> bool {
        let (sda_low_1, scl_low_1) = hw.sample_lines();
        if !sda_low_1 && !scl_low_1 {
            return false;
        }
        thread::sleep(Duration::from_micros(STUCK_RESAMPLE_US));
        let (sda_low_2, scl_low_2) = hw.sample_lines();
        (sda_low_1 && sda_low_2) || (scl_low_1 && scl_low_2)
    }

    /// Attempt to clear a stuck bus by pulsing SCL up to
    /// [`BUS_CLEAR_ATTEMPTS`] times, re-sampling after each pulse.
    ///
    /// Returns `Ok(())` once the bus reports clear, or
    /// `Err(ResponseCode::BusStuck)` if it is still wedged after the
    /// attempt budget is spent.
    pub fn clear<H: I2cHardware>(&mut self, hw: &mut H) -> Result<(), ResponseCode> {
        if !self.is_stuck(hw) {
            return Ok(());
        }

        for attempt in 1..=BUS_CLEAR_ATTEMPTS {
            hw.clock_pulse();
            if !self.is_stuck(hw) {
                info!(
                    target: "i2c_core::stuck",
                    "bus cleared after {attempt} clock pulse(s)"
                );
                self.recoveries += 1;
                return Ok(());
            }
        }

        warn!(
            target: "i2c_core::stuck",
            "bus still stuck after {BUS_CLEAR_ATTEMPTS} clock pulses"
        );
        self.recovery_failures += 1;
        Err(ResponseCode::BusStuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_i2c_types::mock::MockI2cHardware;

    #[test]
    fn healthy_bus_is_not_stuck() {
        let handler = BusStuckHandler::new();
        let mut hw = MockI2cHardware::new();
        assert!(!handler.is_stuck(&mut hw));
    }

    #[test]
    fn clear_recovers_a_bus_that_frees_within_the_attempt_budget() {
        let mut handler = BusStuckHandler::new();
        let mut hw = MockI2cHardware::new();
        hw.simulate_stuck(3);
        assert_eq!(handler.clear(&mut hw), Ok(()));
        assert_eq!(handler.recoveries, 1);
        assert_eq!(handler.recovery_failures, 0);
    }

    #[test]
    fn clear_gives_up_past_the_attempt_budget() {
        let mut handler = BusStuckHandler::new();
        let mut hw = MockI2cHardware::new();
        hw.simulate_stuck(BUS_CLEAR_ATTEMPTS + 10);
        assert_eq!(handler.clear(&mut hw), Err(ResponseCode::BusStuck));
        assert_eq!(handler.recovery_failures, 1);
    }

    #[test]
    fn clear_on_a_bus_that_was_never_stuck_is_a_cheap_no_op() {
        let mut handler = BusStuckHandler::new();
        let mut hw = MockI2cHardware::new();
        assert_eq!(handler.clear(&mut hw), Ok(()));
        assert_eq!(handler.recoveries, 0);
    }

    #[test]
    fn only_scl_held_low_on_both_samples_still_counts_as_stuck() {
        let handler = BusStuckHandler::new();
        let mut hw = MockI2cHardware::new();
        hw.simulate_stuck(100);
        // Drain sda_stuck_low but leave scl held: is_stuck should still
        // trust SCL alone, since either line stuck low on both samples is
        // sufficient.
        assert!(handler.is_stuck(&mut hw));
    }
}
