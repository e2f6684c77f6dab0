// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The I2C bus subsystem CORE: one master engine wrapper, bus-recovery
//! handler, IO-expander-backed power control, cascaded multiplexer
//! addressing, a device-type catalog with a detection/init/poll DSL, a
//! debounced address-status table, a priority-tiered scanner, device
//! identification, periodic polling and a bounded request/response queue,
//! all driven by one cooperative worker thread per bus.
//!
//! This crate has no knowledge of any particular I2C controller; it is
//! generic over [`drv_i2c_types::I2cHardware`], the hardware abstraction
//! boundary separating driving logic from the concrete peripheral
//! register interface.

pub mod accessor;
pub mod bus;
pub mod catalog;
pub mod central;
pub mod config;
pub mod identity;
pub mod ioexpander;
pub mod mux;
pub mod polling;
pub mod power;
pub mod scanner;
pub mod status;
pub mod stuck;
pub mod worker;

pub use bus::{Bus, ElemStatusCallback, OperationStatusCallback};
pub use catalog::{
    AddressSet, DecodeFn, DeviceTypeBuilder, DeviceTypeCatalog, DeviceTypeRecord, PollConfig,
    PollSample, PollStep,
};
pub use config::{BusConfig, IoExpanderConfig, LevelPin, LevelPins, MuxConfig, PowerConfig, SlotGroupConfig};
pub use identity::IdentifyOutcome;
pub use mux::{MAX_CASCADE_LEVEL, MUX_MAX};
pub use power::PowerState;
pub use scanner::ScannerState;
pub use status::{ProbeOutcome, FAIL_MAX, OK_MAX};
pub use stuck::BUS_CLEAR_ATTEMPTS;
