// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The address-status table, online/offline debounce, and poll-result
//! ring storage.
//!
//! Keeps a bounded up/down response counter per address (`+2` to mark
//! online, `-3` to mark offline, with a separate "spurious" removal path
//! for addresses that flap before ever reaching online) and a per-device
//! ring of timestamped poll records (`PollDataAggregator`). The whole
//! table is guarded by one `Mutex`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use drv_i2c_api::{AddrSlot, ElemStatusChange};
use log::{debug, error, warn};

use crate::catalog::PollStep;

/// Consecutive no-ACK responses before an online address is marked
/// offline, or a never-online address is removed as spurious.
pub const FAIL_MAX: i8 = 3;
/// Consecutive ACK responses before an address is marked online.
pub const OK_MAX: i8 = 2;

/// Per-device poll schedule state, attached once a device is identified
#[derive(Clone)]
pub struct PollingInfo {
    pub steps: Vec<PollStep>,
    pub interval_ms: u32,
    /// Index of the next poll step to execute; `0` means "starting a
    /// fresh poll, reserve the timestamp prefix".
    pub next_step_idx: usize,
    pub last_poll_us: u64,
    /// Partial buffer accumulated across resumed poll steps.
    pub partial: Vec<u8>,
    /// Earliest time a mid-poll suspension (a step with `bar_after_ms >
    /// 0`) may resume; meaningless while `next_step_idx == 0`.
    pub resume_at_us: u64,
}

impl PollingInfo {
    pub fn new(steps: Vec<PollStep>, interval_ms: u32) -> Self {
        Self {
            steps,
            interval_ms,
            next_step_idx: 0,
            last_poll_us: 0,
            partial: Vec::new(),
            resume_at_us: 0,
        }
    }

    /// A poll in progress (mid-suspension) is due once its bar cooldown
    /// elapses, independent of the overall poll interval; a fresh poll is
    /// due once the interval has elapsed since the last completion.
    pub fn is_due(&self, now_us: u64) -> bool {
        if self.next_step_idx != 0 {
            return now_us >= self.resume_at_us;
        }
        let interval_us = self.interval_ms as u64 * 1000;
        self.last_poll_us + interval_us <= now_us
    }
}

/// A fixed-capacity, fixed-record-size ring of timestamped poll results
#[derive(Clone, Default)]
pub struct PollDataAggregator {
    record_size: usize,
    capacity: usize,
    records: std::collections::VecDeque<Vec<u8>>,
}

impl PollDataAggregator {
    pub fn new(record_size: usize, capacity: usize) -> Self {
        Self {
            record_size,
            capacity,
            records: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    /// Push a record, unconditionally overwriting the oldest one if the
    /// ring is already at capacity.
    pub fn put(&mut self, record: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Pop the oldest record.
    pub fn get(&mut self) -> Option<Vec<u8>> {
        self.records.pop_front()
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Clear and reallocate at a new capacity.
    pub fn resize(&mut self, capacity: usize) {
        self.records.clear();
        self.capacity = capacity;
    }
}

/// Per-(addr, slot) lifecycle and health record.
#[derive(Clone)]
pub struct AddressStatus {
    counter: i8,
    is_online: bool,
    was_ever_online: bool,
    is_change_pending: bool,
    is_newly_identified: bool,
    pub slot_resolved: bool,
    pub device_type_index: Option<u16>,
    bar: Option<(u64, u64)>,
    pub min_report_interval_ms: u32,
    pub polling: Option<PollingInfo>,
    pub ring: PollDataAggregator,
}

impl Default for AddressStatus {
    fn default() -> Self {
        Self {
            counter: 0,
            is_online: false,
            was_ever_online: false,
            is_change_pending: false,
            is_newly_identified: false,
            slot_resolved: false,
            device_type_index: None,
            bar: None,
            min_report_interval_ms: 0,
            polling: None,
            ring: PollDataAggregator::default(),
        }
    }
}

impl AddressStatus {
    pub fn is_online(&self) -> bool {
        self.is_online
    }

    pub fn was_ever_online(&self) -> bool {
        self.was_ever_online
    }
}

/// Result of feeding one probe outcome into the status table: whether the
/// address should be forgotten (spurious removal).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    NoChange,
    BecameOnline,
    BecameOffline,
    RemovedSpurious,
}

struct Table {
    entries: HashMap<AddrSlot, AddressStatus>,
}

/// Owns the address-status table behind a single mutex; the sole mutator
/// of per-address lifecycle state.
pub struct StatusManager {
    table: Mutex<Table>,
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusManager {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
            }),
        }
    }

    /// Feed one probe result for `address` into the debounce counter.
    pub fn observe_probe(&self, address: AddrSlot, acked: bool) -> ProbeOutcome {
        let mut table = self.table.lock().unwrap();
        let entry = table.entries.entry(address).or_default();

        if acked {
            if entry.is_online {
                return ProbeOutcome::NoChange;
            }
            entry.counter = (entry.counter + 1).min(OK_MAX);
            if entry.counter >= OK_MAX {
                entry.is_online = true;
                entry.was_ever_online = true;
                entry.is_change_pending = true;
                entry.counter = 0;
                debug!(target: "i2c_core::status", "{address} transitioned online");
                return ProbeOutcome::BecameOnline;
            }
            ProbeOutcome::NoChange
        } else {
            if !entry.is_online && entry.was_ever_online {
                return ProbeOutcome::NoChange;
            }
            entry.counter = (entry.counter - 1).max(-FAIL_MAX);
            if entry.counter <= -FAIL_MAX {
                if !entry.was_ever_online {
                    table.entries.remove(&address);
                    warn!(target: "i2c_core::status", "{address} removed as spurious");
                    return ProbeOutcome::RemovedSpurious;
                }
                entry.is_online = false;
                entry.is_change_pending = true;
                entry.counter = 0;
                debug!(target: "i2c_core::status", "{address} transitioned offline");
                return ProbeOutcome::BecameOffline;
            }
            ProbeOutcome::NoChange
        }
    }

    pub fn is_online(&self, address: AddrSlot) -> bool {
        self.table
            .lock()
            .unwrap()
            .entries
            .get(&address)
            .map(|e| e.is_online)
            .unwrap_or(false)
    }

    /// Record a newly identified device type. `ring_capacity` comes from the
    /// catalog entry's `samples_to_store`.
    pub fn set_device_type(
        &self,
        address: AddrSlot,
        device_type_index: u16,
        polling: PollingInfo,
        ring_capacity: usize,
    ) {
        let record_size = polling.steps.iter().map(|s| s.read_len).sum::<usize>() + 2;
        let mut table = self.table.lock().unwrap();
        let entry = table.entries.entry(address).or_default();
        entry.device_type_index = Some(device_type_index);
        entry.is_newly_identified = true;
        entry.ring = PollDataAggregator::new(record_size, ring_capacity);
        entry.polling = Some(polling);
    }

    /// Per-device access-bar cooldown.
    pub fn bar_elem_access_set(&self, address: AddrSlot, start_ms: u64, duration_ms: u64) {
        if let Some(entry) = self.table.lock().unwrap().entries.get_mut(&address) {
            entry.bar = Some((start_ms, duration_ms));
        }
    }

    pub fn bar_elem_access_get(&self, address: AddrSlot, now_ms: u64) -> bool {
        self.table
            .lock()
            .unwrap()
            .entries
            .get(&address)
            .and_then(|e| e.bar)
            .map(|(start, dur)| now_ms.saturating_sub(start) < dur)
            .unwrap_or(false)
    }

    /// Mark every address on `slot` offline at once.
    pub fn slot_powering_down(&self, slot: u8) {
        let mut table = self.table.lock().unwrap();
        for (addr, entry) in table.entries.iter_mut() {
            if addr.slot() == slot && entry.is_online {
                entry.is_online = false;
                entry.is_change_pending = true;
            }
        }
    }

    /// Mark every known address offline.
    pub fn inform_bus_stuck(&self) {
        let mut table = self.table.lock().unwrap();
        for entry in table.entries.values_mut() {
            if entry.is_online {
                entry.is_online = false;
                entry.is_change_pending = true;
            }
        }
    }

    /// Append a completed poll buffer to the device's ring.
    pub fn poll_result_store(&self, address: AddrSlot, record: Vec<u8>) {
        if let Some(entry) = self.table.lock().unwrap().entries.get_mut(&address) {
            entry.ring.put(record);
        }
    }

    pub fn ring_count(&self, address: AddrSlot) -> usize {
        self.table
            .lock()
            .unwrap()
            .entries
            .get(&address)
            .map(|e| e.ring.count())
            .unwrap_or(0)
    }

    pub fn ring_pop(&self, address: AddrSlot) -> Option<Vec<u8>> {
        self.table
            .lock()
            .unwrap()
            .entries
            .get_mut(&address)
            .and_then(|e| e.ring.get())
    }

    /// The next identified device whose poll interval has elapsed, if
    /// any. Returns the address and
    /// a snapshot of its polling state; callers update `next_step_idx`
    /// and `last_poll_us` via [`advance_poll`](Self::advance_poll).
    pub fn get_pending_ident_poll(&self, now_us: u64) -> Option<(AddrSlot, PollingInfo)> {
        let table = self.table.lock().unwrap();
        table
            .entries
            .iter()
            .find(|(_, e)| {
                e.polling
                    .as_ref()
                    .map(|p| p.is_due(now_us))
                    .unwrap_or(false)
            })
            .map(|(addr, e)| (*addr, e.polling.clone().unwrap()))
    }

    /// Update polling progress after a (possibly partial) poll step.
    /// `resume_at_us` carries the bar-cooldown deadline when suspending
    /// mid-poll; ignored once the poll completes (`completed_at_us` is
    /// `Some`).
    pub fn advance_poll(
        &self,
        address: AddrSlot,
        next_step_idx: usize,
        partial: Vec<u8>,
        completed_at_us: Option<u64>,
    ) {
        self.advance_poll_with_resume(address, next_step_idx, partial, completed_at_us, 0);
    }

    pub fn advance_poll_with_resume(
        &self,
        address: AddrSlot,
        next_step_idx: usize,
        partial: Vec<u8>,
        completed_at_us: Option<u64>,
        resume_at_us: u64,
    ) {
        if let Some(entry) = self.table.lock().unwrap().entries.get_mut(&address) {
            if let Some(info) = entry.polling.as_mut() {
                info.next_step_idx = next_step_idx;
                info.partial = partial;
                info.resume_at_us = resume_at_us;
                if let Some(now_us) = completed_at_us {
                    info.last_poll_us = now_us;
                }
            }
        }
    }

    /// Build the batch of pending status changes, clear their flags
    /// under the lock, and return the batch for the caller to dispatch
    /// outside the lock.
    pub fn drain_changes(&self) -> Vec<ElemStatusChange> {
        let mut table = self.table.lock().unwrap();
        let mut batch = Vec::new();
        for (addr, entry) in table.entries.iter_mut() {
            if entry.is_change_pending || entry.is_newly_identified {
                batch.push(ElemStatusChange {
                    address: *addr,
                    is_change_to_online: entry.is_change_pending && entry.is_online,
                    is_change_to_offline: entry.is_change_pending && !entry.is_online,
                    is_newly_identified: entry.is_newly_identified,
                    device_type_index: entry.device_type_index,
                });
                entry.is_change_pending = false;
                entry.is_newly_identified = false;
            }
        }
        batch
    }

    /// Invoke `callback` with a just-drained batch, isolating the worker
    /// from a panicking callback.
    pub fn dispatch_changes(&self, callback: &(dyn Fn(&[ElemStatusChange]) + Send + Sync)) {
        let batch = self.drain_changes();
        if batch.is_empty() {
            return;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&batch))) {
            error!(
                target: "i2c_core::status",
                "status-change callback panicked: {panic:?}"
            );
        }
    }
}
