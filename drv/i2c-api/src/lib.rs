// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client-facing types for the I2C bus subsystem.
//!
//! This crate is the public boundary between a bus worker (`drv-i2c-core`)
//! and everything that talks to it: composite addresses, request records,
//! result codes and status-change notifications. It depends on nothing but
//! `zerocopy` (for the on-wire poll-record layout) so that callers who only
//! need to decode poll data do not have to pull in the worker itself.

mod addr;
mod request;
mod result;
mod status;
mod wire;

pub use addr::AddrSlot;
pub use request::{Request, RequestBuilder, RequestKind, RequestOutcome};
pub use result::ResponseCode;
pub use status::{BusOperationStatus, ElemStatusChange};
pub use wire::{split_record, PollRecordHeader, PollTimestampDecoder};

/// Number of 100 microsecond ticks that fit in a `u16` timestamp before it
/// wraps. Poll records prepend a timestamp in these units.
pub const TIMESTAMP_UNIT_US: u64 = 100;
