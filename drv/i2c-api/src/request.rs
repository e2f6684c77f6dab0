// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queued requests and their callbacks.

use std::sync::Arc;

use crate::{AddrSlot, ResponseCode};

/// What a queued request is for. Requests with `poll_interval_hz > 0` are
/// periodic; all others are one-shot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RequestKind {
    /// Fast-priority address sweep, normally only used by the scanner
    /// itself but exposed so callers can force a rescan.
    ScanFast,
    /// Slow-priority address sweep.
    ScanSlow,
    /// An ordinary one-shot transaction.
    Std,
    /// A registered periodic poll.
    Poll,
    /// Delivered even while the bus is paused.
    SendEvenIfPaused,
    /// Firmware-update traffic; also exempt from pause.
    FwUpdate,
}

impl RequestKind {
    /// Requests exempt from `Accessor::pause`.
    pub const fn bypasses_pause(self) -> bool {
        matches!(self, Self::SendEvenIfPaused | Self::FwUpdate)
    }
}

/// The outcome of a request, delivered to its callback or to the response
/// queue. Mirrors `BusRequestCallback(user_data, result{...})`, with
/// `user_data` folded into the callback closure's captures, which is the
/// idiomatic Rust equivalent of a C-style callback-plus-context pointer.
#[derive(Clone, Debug)]
pub struct RequestOutcome {
    pub address: AddrSlot,
    pub cmd_id: u32,
    pub read_bytes: Vec<u8>,
    pub code: ResponseCode,
}

impl RequestOutcome {
    pub fn ok(address: AddrSlot) -> Self {
        Self {
            address,
            cmd_id: 0,
            read_bytes: Vec::new(),
            code: ResponseCode::Ok,
        }
    }

    pub const fn is_ok(&self) -> bool {
        matches!(self.code, ResponseCode::Ok)
    }
}

/// A callback invoked from the bus worker thread, outside any lock.
pub type RequestCallback = Arc<dyn Fn(&RequestOutcome) + Send + Sync + 'static>;

/// A single queued request.
#[derive(Clone)]
pub struct Request {
    pub kind: RequestKind,
    pub address: AddrSlot,
    pub write_bytes: Vec<u8>,
    pub read_length: usize,
    /// Don't-care mask applied to the read bytes before they are compared
    /// or decoded; `None` means "no mask, use every bit".
    pub read_mask: Option<Vec<u8>>,
    pub callback: Option<RequestCallback>,
    /// `0` for a one-shot request; otherwise the periodic poll rate.
    pub poll_interval_hz: u32,
    /// Access-bar window applied to this device after the request
    /// completes, in milliseconds; `0` disables the bar.
    pub bar_after_ms: u32,
    /// Opaque identifier echoed back in the [`RequestOutcome`].
    pub cmd_id: u32,
}

impl Request {
    pub const fn is_periodic(&self) -> bool {
        self.poll_interval_hz > 0
    }
}

/// Fluent constructor for [`Request`]; the struct has more optional fields
/// than is comfortable to write out as a literal every time.
pub struct RequestBuilder {
    req: Request,
}

impl RequestBuilder {
    pub fn new(kind: RequestKind, address: AddrSlot) -> Self {
        Self {
            req: Request {
                kind,
                address,
                write_bytes: Vec::new(),
                read_length: 0,
                read_mask: None,
                callback: None,
                poll_interval_hz: 0,
                bar_after_ms: 0,
                cmd_id: 0,
            },
        }
    }

    pub fn write(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.req.write_bytes = bytes.into();
        self
    }

    pub fn read_length(mut self, len: usize) -> Self {
        self.req.read_length = len;
        self
    }

    pub fn read_mask(mut self, mask: impl Into<Vec<u8>>) -> Self {
        self.req.read_mask = Some(mask.into());
        self
    }

    pub fn callback(mut self, cb: RequestCallback) -> Self {
        self.req.callback = Some(cb);
        self
    }

    pub fn poll_interval_hz(mut self, hz: u32) -> Self {
        self.req.poll_interval_hz = hz;
        self
    }

    pub fn bar_after_ms(mut self, ms: u32) -> Self {
        self.req.bar_after_ms = ms;
        self
    }

    pub fn cmd_id(mut self, id: u32) -> Self {
        self.req.cmd_id = id;
        self
    }

    pub fn build(self) -> Request {
        self.req
    }
}
