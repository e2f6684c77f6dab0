// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Result codes returned at the public boundary.
//!
//! A flat, hand-rolled enum rather than a `thiserror` hierarchy, because
//! the values are meant to be put in front of upstack software largely
//! unchanged rather than matched exhaustively.

use core::fmt;

/// The response code returned from an I2C operation or queued request.
///
/// These are reported to the caller unchanged; the CORE does not retry on
/// the caller's behalf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ResponseCode {
    /// The transaction completed and ACKed as expected.
    Ok = 0,
    /// The device did not ACK its address or a data byte.
    AckError,
    /// The controller hardware reported a timeout.
    HwTimeOut,
    /// The software watchdog on the transaction expired first.
    SwTimeOut,
    /// Arbitration was lost to another master.
    ArbLost,
    /// The caller asked for something the engine cannot do (oversize
    /// transaction, bad slot number, ...). Signals a caller bug.
    Invalid,
    /// The controller is uninitialized or in a hiatus.
    NotReady,
    /// One or more engine command slots did not complete.
    Incomplete,
    /// The device's access-bar cooldown window is still active.
    Barred,
    /// The bus is stuck (SDA or SCL held low) and recovery already failed.
    BusStuck,
    /// The device's slot is mid power-cycle or stabilizing.
    SlotPowerUnstable,
    /// The request was accepted but the result is not available yet.
    Pending,
    /// The bus was never initialized.
    NotInit,
}

impl ResponseCode {
    /// Transient wire errors: reported for the single failing operation,
    /// never retried by the CORE, but accounted in per-bus statistics.
    pub const fn is_transient_wire_error(self) -> bool {
        matches!(
            self,
            Self::AckError
                | Self::HwTimeOut
                | Self::SwTimeOut
                | Self::ArbLost
                | Self::Incomplete
        )
    }

    /// Topology faults: the caller should retry later once recovery
    /// (already attempted internally) has had a chance to settle.
    pub const fn is_topology_fault(self) -> bool {
        matches!(self, Self::BusStuck | Self::SlotPowerUnstable)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Ok => "ok",
            Self::AckError => "device did not acknowledge",
            Self::HwTimeOut => "hardware timeout",
            Self::SwTimeOut => "software timeout",
            Self::ArbLost => "arbitration lost",
            Self::Invalid => "invalid request",
            Self::NotReady => "controller not ready",
            Self::Incomplete => "transaction incomplete",
            Self::Barred => "device access barred",
            Self::BusStuck => "bus stuck",
            Self::SlotPowerUnstable => "slot power unstable",
            Self::Pending => "result pending",
            Self::NotInit => "bus not initialized",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for ResponseCode {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_wire_errors_are_classified() {
        assert!(ResponseCode::AckError.is_transient_wire_error());
        assert!(ResponseCode::Incomplete.is_transient_wire_error());
        assert!(!ResponseCode::BusStuck.is_transient_wire_error());
    }

    #[test]
    fn topology_faults_are_classified() {
        assert!(ResponseCode::BusStuck.is_topology_fault());
        assert!(ResponseCode::SlotPowerUnstable.is_topology_fault());
        assert!(!ResponseCode::Invalid.is_topology_fault());
    }
}
