// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Status-change notifications delivered to the host application.

use crate::AddrSlot;

/// One entry in a `BusElemStatusCB` batch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ElemStatusChange {
    pub address: AddrSlot,
    pub is_change_to_online: bool,
    pub is_change_to_offline: bool,
    pub is_newly_identified: bool,
    pub device_type_index: Option<u16>,
}

impl ElemStatusChange {
    pub fn online(address: AddrSlot) -> Self {
        Self {
            address,
            is_change_to_online: true,
            is_change_to_offline: false,
            is_newly_identified: false,
            device_type_index: None,
        }
    }

    pub fn offline(address: AddrSlot) -> Self {
        Self {
            address,
            is_change_to_online: false,
            is_change_to_offline: true,
            is_newly_identified: false,
            device_type_index: None,
        }
    }

    pub fn identified(address: AddrSlot, device_type_index: u16) -> Self {
        Self {
            address,
            is_change_to_online: false,
            is_change_to_offline: false,
            is_newly_identified: true,
            device_type_index: Some(device_type_index),
        }
    }
}

/// Long-term bus health, reported via `BusOperationStatusCB`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum BusOperationStatus {
    #[default]
    Unknown,
    Ok,
    Failing,
}
