// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public request/response queue and pause/hiatus controls.
//!
//! Bounded, timeout-on-full, no unbounded growth: a condvar-guarded
//! `VecDeque` plays the role a fixed-size mailbox buffer would on an
//! interrupt-driven system, adapted to an OS-thread model.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use drv_i2c_api::{AddrSlot, Request, RequestKind, RequestOutcome};
use log::warn;

/// Deepest the periodic-poll vector may grow.
pub const MAX_POLL_LIST: usize = 30;
/// Same, for a bus configured `low_load`.
pub const MAX_POLL_LIST_LOW_LOAD: usize = 4;
/// How long `add_request` blocks trying to enqueue a one-shot request
/// before giving up.
pub const ADD_REQ_MAX_MS: u64 = 2;

struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Try to push within `timeout`; returns `false` if still full when
    /// the timeout expires.
    fn push_timeout(&self, item: T, timeout: Duration) -> bool {
        let mut items = self.items.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while items.len() >= self.capacity {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .not_full
                .wait_timeout(items, deadline - now)
                .unwrap();
            items = guard;
            if result.timed_out() && items.len() >= self.capacity {
                return false;
            }
        }
        items.push_back(item);
        true
    }

    /// Non-blocking push; `false` if already full.
    fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        true
    }

    fn pop(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        let item = items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// Guards a `warn!` call so repeated full-queue rejections under sustained
/// overload don't flood the log; one line per second per queue is plenty.
struct WarnLimiter {
    last: Mutex<Option<Instant>>,
}

impl WarnLimiter {
    const PERIOD: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { last: Mutex::new(None) }
    }

    fn fire(&self, f: impl FnOnce()) {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= Self::PERIOD) {
            *last = Some(now);
            f();
        }
    }
}

/// Per-bus request/response queues plus pause/hiatus state.
pub struct Accessor {
    requests: BoundedQueue<Request>,
    responses: BoundedQueue<RequestOutcome>,
    polling: Mutex<HashMap<AddrSlot, Request>>,
    poll_capacity: usize,
    paused: AtomicBool,
    hiatus_until_ms: AtomicU64,
    pub req_buffer_full: AtomicU32,
    poll_full_warn: WarnLimiter,
    req_full_warn: WarnLimiter,
}

impl Accessor {
    pub fn new(low_load: bool, request_capacity: usize, response_capacity: usize) -> Self {
        Self {
            requests: BoundedQueue::new(request_capacity),
            responses: BoundedQueue::new(response_capacity),
            polling: Mutex::new(HashMap::new()),
            poll_capacity: if low_load {
                MAX_POLL_LIST_LOW_LOAD
            } else {
                MAX_POLL_LIST
            },
            paused: AtomicBool::new(false),
            hiatus_until_ms: AtomicU64::new(0),
            req_buffer_full: AtomicU32::new(0),
            poll_full_warn: WarnLimiter::new(),
            req_full_warn: WarnLimiter::new(),
        }
    }

    /// Queue a request from a caller thread.
    /// Periodic requests merge into the polling vector keyed by address;
    /// one-shot requests go into the bounded request FIFO with a short
    /// blocking timeout.
    pub fn add_request(&self, req: Request) -> bool {
        if req.is_periodic() {
            let mut polling = self.polling.lock().unwrap();
            if !polling.contains_key(&req.address) && polling.len() >= self.poll_capacity {
                self.req_buffer_full.fetch_add(1, Ordering::Relaxed);
                let capacity = self.poll_capacity;
                let addr = req.address;
                self.poll_full_warn.fire(|| {
                    warn!(
                        target: "i2c_core::accessor",
                        "poll list full ({}), rejecting {}", capacity, addr
                    );
                });
                return false;
            }
            polling.insert(req.address, req);
            return true;
        }

        let ok = self
            .requests
            .push_timeout(req, Duration::from_millis(ADD_REQ_MAX_MS));
        if !ok {
            self.req_buffer_full.fetch_add(1, Ordering::Relaxed);
            self.req_full_warn.fire(|| {
                warn!(target: "i2c_core::accessor", "request queue full after timeout");
            });
        }
        ok
    }

    /// Remove a registered periodic poll.
    pub fn remove_poll(&self, address: AddrSlot) -> bool {
        self.polling.lock().unwrap().remove(&address).is_some()
    }

    pub fn poll_count(&self) -> usize {
        self.polling.lock().unwrap().len()
    }

    /// Drop all queued one-shot requests, and optionally all registered
    /// polls too.
    pub fn clear(&self, include_polling: bool) {
        while self.requests.pop().is_some() {}
        if include_polling {
            self.polling.lock().unwrap().clear();
        }
    }

    /// `pause(true)` drops all outbound I/O except requests exempt via
    /// `RequestKind::bypasses_pause`.
    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Block all bus activity until `now_ms + duration_ms`.
    pub fn hiatus(&self, now_ms: u64, duration_ms: u64) {
        self.hiatus_until_ms
            .store(now_ms + duration_ms, Ordering::Relaxed);
    }

    pub fn is_in_hiatus(&self, now_ms: u64) -> bool {
        now_ms < self.hiatus_until_ms.load(Ordering::Relaxed)
    }

    /// Worker-side drain of the next eligible queued request, honoring
    /// pause.
    pub fn next_request(&self) -> Option<Request> {
        if !self.is_paused() {
            return self.requests.pop();
        }
        // While paused, only bypass-eligible requests may be drained;
        // peek-and-requeue anything else to preserve FIFO order for it.
        let mut items = self.requests.items.lock().unwrap();
        let pos = items.iter().position(|r| r.kind.bypasses_pause())?;
        let req = items.remove(pos);
        drop(items);
        self.requests.not_full.notify_one();
        req
    }

    /// Worker-side push of a completed request's outcome for the calling
    /// thread to collect.
    pub fn push_response(&self, outcome: RequestOutcome) -> bool {
        self.responses.push(outcome)
    }

    /// Caller-side drain of completed one-shot results.
    pub fn next_response(&self) -> Option<RequestOutcome> {
        self.responses.pop()
    }

    pub fn request_queue_len(&self) -> usize {
        self.requests.len()
    }

    pub fn response_queue_len(&self) -> usize {
        self.responses.len()
    }

    /// Snapshot of every registered periodic request, for the worker's
    /// scheduler (weighted round-robin sizing is left to
    /// `PollingManager`/`StatusManager`, which already track due times).
    pub fn polling_snapshot(&self) -> Vec<Request> {
        self.polling.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_i2c_api::RequestBuilder;

    fn std_req(addr: u8) -> Request {
        RequestBuilder::new(RequestKind::Std, AddrSlot::main_bus(addr)).build()
    }

    #[test]
    fn one_shot_requests_enqueue_and_drain_fifo() {
        let acc = Accessor::new(false, 4, 4);
        assert!(acc.add_request(std_req(0x10)));
        assert!(acc.add_request(std_req(0x11)));
        assert_eq!(acc.next_request().unwrap().address, AddrSlot::main_bus(0x10));
        assert_eq!(acc.next_request().unwrap().address, AddrSlot::main_bus(0x11));
        assert!(acc.next_request().is_none());
    }

    #[test]
    fn request_queue_overflow_is_accounted() {
        let acc = Accessor::new(false, 1, 4);
        assert!(acc.add_request(std_req(0x10)));
        assert!(!acc.add_request(std_req(0x11)));
        assert_eq!(acc.req_buffer_full.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn periodic_requests_merge_by_address_into_the_poll_vector() {
        let acc = Accessor::new(false, 4, 4);
        let req = RequestBuilder::new(RequestKind::Poll, AddrSlot::main_bus(0x60))
            .poll_interval_hz(10)
            .build();
        assert!(acc.add_request(req.clone()));
        assert!(acc.add_request(req));
        assert_eq!(acc.poll_count(), 1);
    }

    #[test]
    fn low_load_bus_has_a_much_smaller_poll_capacity() {
        let acc = Accessor::new(true, 4, 4);
        for i in 0..MAX_POLL_LIST_LOW_LOAD {
            let req = RequestBuilder::new(RequestKind::Poll, AddrSlot::main_bus(0x10 + i as u8))
                .poll_interval_hz(1)
                .build();
            assert!(acc.add_request(req));
        }
        let overflow = RequestBuilder::new(RequestKind::Poll, AddrSlot::main_bus(0xEE))
            .poll_interval_hz(1)
            .build();
        assert!(!acc.add_request(overflow));
        assert_eq!(acc.req_buffer_full.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn pause_blocks_ordinary_requests_but_not_send_even_if_paused() {
        let acc = Accessor::new(false, 4, 4);
        acc.pause(true);
        acc.add_request(std_req(0x10));
        let urgent = RequestBuilder::new(RequestKind::SendEvenIfPaused, AddrSlot::main_bus(0x11))
            .build();
        acc.add_request(urgent);

        let drained = acc.next_request().unwrap();
        assert_eq!(drained.address, AddrSlot::main_bus(0x11));
        assert!(acc.next_request().is_none());

        acc.pause(false);
        let drained = acc.next_request().unwrap();
        assert_eq!(drained.address, AddrSlot::main_bus(0x10));
    }

    #[test]
    fn hiatus_blocks_activity_until_it_elapses() {
        let acc = Accessor::new(false, 4, 4);
        acc.hiatus(1000, 500);
        assert!(acc.is_in_hiatus(1200));
        assert!(!acc.is_in_hiatus(1600));
    }

    #[test]
    fn clear_drops_queued_requests_and_optionally_polls() {
        let acc = Accessor::new(false, 4, 4);
        acc.add_request(std_req(0x10));
        let poll = RequestBuilder::new(RequestKind::Poll, AddrSlot::main_bus(0x60))
            .poll_interval_hz(5)
            .build();
        acc.add_request(poll);

        acc.clear(false);
        assert!(acc.next_request().is_none());
        assert_eq!(acc.poll_count(), 1);

        acc.clear(true);
        assert_eq!(acc.poll_count(), 0);
    }
}
