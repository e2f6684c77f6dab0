// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device identification against the catalog.
//!
//! Walks catalog entries whose address set covers the newly-online
//! address, runs each candidate's detection reads, and on the first
//! match runs its init writes before handing the device off to polling.

use drv_i2c_api::{AddrSlot, ResponseCode};
use drv_i2c_types::I2cHardware;
use log::{debug, info, warn};

use crate::catalog::DeviceTypeCatalog;
use crate::central::I2CCentral;
use crate::status::PollingInfo;

/// Outcome of attempting to identify a newly-online address.
pub enum IdentifyOutcome {
    /// A catalog entry matched; init ran and this is the resulting state
    /// to hand to `StatusManager::set_device_type`.
    Identified {
        device_type_index: u16,
        polling: PollingInfo,
        ring_capacity: usize,
    },
    /// No candidate's detection pattern matched.
    NoMatch,
    /// A candidate was tried but an I2C error aborted that candidate;
    /// identification should be retried on a later pass.
    Aborted(ResponseCode),
}

/// Runs detection and init against a freshly-online address.
pub struct IdentityManager<'a> {
    catalog: &'a DeviceTypeCatalog,
}

impl<'a> IdentityManager<'a> {
    pub fn new(catalog: &'a DeviceTypeCatalog) -> Self {
        Self { catalog }
    }

    /// Try every catalog candidate for `address` in turn, stopping at
    /// the first whose detection pairs all match.
    pub fn identify<H: I2cHardware>(
        &self,
        central: &mut I2CCentral<H>,
        address: AddrSlot,
    ) -> IdentifyOutcome {
        // An I2C error aborts only the candidate being tried when it
        // happens; identification keeps walking
        // the rest of the catalog rather than giving up on the address.
        let mut last_error = None;
        for (index, record) in self.catalog.candidates_for(address.addr()) {
            match self.try_candidate(central, address, record) {
                Ok(true) => {
                    info!(
                        target: "i2c_core::identity",
                        "{address} identified as {}", record.type_name
                    );
                    for write in &record.init_pairs {
                        if let Err(e) = central.access(address.addr(), write, &mut []) {
                            warn!(
                                target: "i2c_core::identity",
                                "{address} init step failed for {}: {e:?}", record.type_name
                            );
                            return IdentifyOutcome::Aborted(e);
                        }
                    }
                    return IdentifyOutcome::Identified {
                        device_type_index: index,
                        polling: PollingInfo::new(
                            record.poll.steps.clone(),
                            record.poll.interval_ms,
                        ),
                        ring_capacity: record.poll.samples_to_store as usize,
                    };
                }
                Ok(false) => {
                    debug!(
                        target: "i2c_core::identity",
                        "{address} did not match {}", record.type_name
                    );
                }
                Err(e) => {
                    warn!(
                        target: "i2c_core::identity",
                        "{address} detection read failed against {}: {e:?}", record.type_name
                    );
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => IdentifyOutcome::Aborted(e),
            None => IdentifyOutcome::NoMatch,
        }
    }

    fn try_candidate<H: I2cHardware>(
        &self,
        central: &mut I2CCentral<H>,
        address: AddrSlot,
        record: &crate::catalog::DeviceTypeRecord,
    ) -> Result<bool, ResponseCode> {
        for pair in &record.detection_pairs {
            let mut read_buf = vec![0u8; pair.mask.len()];
            central.access(address.addr(), &pair.write, &mut read_buf)?;
            let matches = read_buf
                .iter()
                .zip(&pair.mask)
                .zip(&pair.pattern)
                .all(|((b, m), p)| b & m == p & m);
            if !matches {
                return Ok(false);
            }
        }
        Ok(!record.detection_pairs.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AddressSet, DeviceTypeBuilder, DeviceTypeCatalog};
    use drv_i2c_types::mock::MockI2cHardware;
    use drv_i2c_types::HardwareInit;
    use std::sync::Arc;

    fn vcnl4040() -> crate::catalog::DeviceTypeRecord {
        DeviceTypeBuilder::new("vcnl4040", AddressSet::List(vec![0x60]))
            .detection("0x0c=0b00001001")
            .unwrap()
            .init("0x0011&0x0201")
            .unwrap()
            .poll("0x08=r2&0x09=r2&0x0a=r2", 100, 16)
            .unwrap()
            .build(Arc::new(|_raw: &[u8]| Vec::new()))
    }

    fn central_with_device(addr: u8) -> I2CCentral<MockI2cHardware> {
        let mut hw = MockI2cHardware::new();
        hw.add_device(addr);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        central
    }

    #[test]
    fn matching_candidate_is_identified_and_initialized() {
        let catalog = DeviceTypeCatalog::new(vec![vcnl4040()]);
        let mut central = central_with_device(0x60);
        central.hardware_mut().set_register(0x60, 0x0c, 0x09);

        let mgr = IdentityManager::new(&catalog);
        match mgr.identify(&mut central, AddrSlot::main_bus(0x60)) {
            IdentifyOutcome::Identified {
                device_type_index,
                polling,
                ring_capacity,
            } => {
                assert_eq!(device_type_index, 0);
                assert_eq!(polling.steps.len(), 3);
                assert_eq!(ring_capacity, 16);
            }
            _ => panic!("expected Identified"),
        }
        // init writes executed: 0x00=0x11, 0x02=0x01
        assert_eq!(central.hardware().transaction_count, 1 + 2);
    }

    #[test]
    fn mismatched_detection_pattern_yields_no_match() {
        let catalog = DeviceTypeCatalog::new(vec![vcnl4040()]);
        let mut central = central_with_device(0x60);
        central.hardware_mut().set_register(0x60, 0x0c, 0x00);

        let mgr = IdentityManager::new(&catalog);
        assert!(matches!(
            mgr.identify(&mut central, AddrSlot::main_bus(0x60)),
            IdentifyOutcome::NoMatch
        ));
    }

    #[test]
    fn i2c_error_during_detection_aborts_only_that_candidate() {
        let catalog = DeviceTypeCatalog::new(vec![vcnl4040()]);
        let mut central = central_with_device(0x60);
        central
            .hardware_mut()
            .inject_error(0x60, ResponseCode::ArbLost);

        let mgr = IdentityManager::new(&catalog);
        match mgr.identify(&mut central, AddrSlot::main_bus(0x60)) {
            IdentifyOutcome::Aborted(ResponseCode::ArbLost) => {}
            _ => panic!("expected Aborted(ArbLost)"),
        }
    }

    #[test]
    fn error_on_one_candidate_does_not_stop_a_later_candidate_from_matching() {
        let first = DeviceTypeBuilder::new("first-guess", AddressSet::List(vec![0x48]))
            .detection("0x00=0b11111111")
            .unwrap()
            .init("")
            .unwrap()
            .poll("0x00=r1", 1000, 8)
            .unwrap()
            .build(Arc::new(|_raw: &[u8]| Vec::new()));
        let second = DeviceTypeBuilder::new("second-guess", AddressSet::List(vec![0x48]))
            .detection("0x01=0b11110000")
            .unwrap()
            .init("")
            .unwrap()
            .poll("0x00=r2", 1000, 8)
            .unwrap()
            .build(Arc::new(|_raw: &[u8]| Vec::new()));
        let catalog = DeviceTypeCatalog::new(vec![first, second]);

        let mut hw = MockI2cHardware::new();
        hw.add_device(0x48);
        hw.set_register(0x48, 0x01, 0xF0);
        // One-shot: consumed by "first-guess"'s detection read, leaving
        // "second-guess"'s own detection read to succeed normally.
        hw.inject_error(0x48, ResponseCode::ArbLost);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();

        let mgr = IdentityManager::new(&catalog);
        match mgr.identify(&mut central, AddrSlot::main_bus(0x48)) {
            IdentifyOutcome::Identified { device_type_index, .. } => {
                assert_eq!(device_type_index, 1);
            }
            _ => panic!("expected Identified for the second candidate"),
        }
    }

    #[test]
    fn address_with_no_catalog_candidates_is_no_match() {
        let catalog = DeviceTypeCatalog::new(vec![vcnl4040()]);
        let mut central = central_with_device(0x29);
        let mgr = IdentityManager::new(&catalog);
        assert!(matches!(
            mgr.identify(&mut central, AddrSlot::main_bus(0x29)),
            IdentifyOutcome::NoMatch
        ));
    }
}
