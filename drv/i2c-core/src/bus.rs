// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public `Bus` handle assembling every component into one running
//! I2C bus.
//!
//! A small public handle that owns the worker thread and exposes a
//! synchronous request API plus callback registration, while every piece
//! of actual bus logic lives in the components it wires together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use drv_i2c_api::{
    AddrSlot, BusOperationStatus, ElemStatusChange, Request, RequestBuilder, RequestKind,
    RequestOutcome, ResponseCode,
};
use drv_i2c_types::{HardwareInit, I2cHardware};
use log::info;

use crate::accessor::Accessor;
use crate::catalog::DeviceTypeCatalog;
use crate::central::I2CCentral;
use crate::config::BusConfig;
use crate::ioexpander::IOExpanderSet;
use crate::mux::MultiplexerTree;
use crate::power::PowerController;
use crate::scanner::Scanner;
use crate::status::StatusManager;
use crate::worker::{self, WorkerContext};

/// Operation-status callback.
pub type OperationStatusCallback = Arc<dyn Fn(BusOperationStatus) + Send + Sync>;
/// Element-status callback.
pub type ElemStatusCallback = Arc<dyn Fn(&[ElemStatusChange]) + Send + Sync>;

struct LockupTracker {
    watch_addr: Option<u8>,
    last_status: Mutex<BusOperationStatus>,
}

impl LockupTracker {
    fn new(watch_addr: Option<u8>) -> Self {
        Self {
            watch_addr,
            last_status: Mutex::new(BusOperationStatus::Unknown),
        }
    }

    /// Fold a batch of element-status changes into the bus-wide operation
    /// status.
    fn observe(&self, changes: &[ElemStatusChange], operating_ok: bool) -> Option<BusOperationStatus> {
        let new_status = match self.watch_addr {
            Some(addr) => {
                let relevant = changes
                    .iter()
                    .find(|c| c.address == AddrSlot::main_bus(addr));
                match relevant {
                    Some(c) if c.is_change_to_offline => BusOperationStatus::Failing,
                    Some(c) if c.is_change_to_online => BusOperationStatus::Ok,
                    _ => return None,
                }
            }
            None => {
                if operating_ok {
                    BusOperationStatus::Ok
                } else {
                    BusOperationStatus::Failing
                }
            }
        };

        let mut last = self.last_status.lock().unwrap();
        if *last == new_status {
            None
        } else {
            *last = new_status;
            Some(new_status)
        }
    }
}

/// One running I2C bus: owns the worker thread and every component it
/// drives, and is the sole public entry point a host application talks to
pub struct Bus {
    accessor: Arc<Accessor>,
    status: Arc<StatusManager>,
    power: Arc<Mutex<PowerController>>,
    stop: Arc<AtomicBool>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
    elem_callback: Arc<Mutex<Option<ElemStatusCallback>>>,
    op_callback: Arc<Mutex<Option<OperationStatusCallback>>>,
    lockup: Arc<LockupTracker>,
    response_wait: Duration,
}

impl Bus {
    /// Build and start a bus: assembles every component per `cfg` and
    /// `catalog`, then spawns its dedicated worker thread.
    pub fn start<H>(bus_name: &str, cfg: BusConfig, catalog: Arc<DeviceTypeCatalog>, hw: H) -> Result<Self, ResponseCode>
    where
        H: I2cHardware + 'static,
    {
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit {
            port: cfg.port,
            sda_pin: cfg.sda_pin,
            scl_pin: cfg.scl_pin,
            freq_hz: cfg.freq_hz,
            filter_level: cfg.filter_level,
        })?;

        let mux = MultiplexerTree::new(cfg.mux.enable, cfg.mux.min_addr, cfg.mux.max_addr);

        let now = Instant::now();
        let power = Arc::new(Mutex::new(PowerController::new(
            cfg.power.slot_groups.clone(),
            now,
        )));

        let mut ioexp = IOExpanderSet::new();
        for exp_cfg in &cfg.io_expanders {
            ioexp.add(exp_cfg);
        }

        let status = Arc::new(StatusManager::new());
        let accessor = Arc::new(Accessor::new(cfg.low_load, 16, 16));
        let scanner = Scanner::new(cfg.scan_boost.clone(), Vec::new());

        let mut ctx = WorkerContext::new(
            central,
            Arc::clone(&power),
            mux,
            Arc::clone(&catalog),
            Arc::clone(&status),
            scanner,
            Arc::clone(&accessor),
        );
        ctx.ioexp = ioexp;

        let elem_callback: Arc<Mutex<Option<ElemStatusCallback>>> = Arc::new(Mutex::new(None));
        let op_callback: Arc<Mutex<Option<OperationStatusCallback>>> = Arc::new(Mutex::new(None));
        let lockup = Arc::new(LockupTracker::new(cfg.lockup_detect));

        let elem_cb_for_worker = Arc::clone(&elem_callback);
        let op_cb_for_worker = Arc::clone(&op_callback);
        let lockup_for_worker = Arc::clone(&lockup);
        let operating_ok = Arc::clone(&ctx.operating_ok);
        ctx.status_callback = Some(Arc::new(move |changes: &[ElemStatusChange]| {
            if let Some(cb) = elem_cb_for_worker.lock().unwrap().as_ref() {
                cb(changes);
            }
            let ok = operating_ok.load(Ordering::Relaxed);
            if let Some(new_status) = lockup_for_worker.observe(changes, ok) {
                if let Some(cb) = op_cb_for_worker.lock().unwrap().as_ref() {
                    cb(new_status);
                }
            }
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let builder = std::thread::Builder::new()
            .name(format!("i2c-worker-{bus_name}"))
            .stack_size(cfg.task_stack_bytes);
        let handle = worker::spawn(builder, ctx, Arc::clone(&stop)).map_err(|_| ResponseCode::Invalid)?;

        info!(target: "i2c_core::bus", "bus {bus_name} started");

        Ok(Self {
            accessor,
            status,
            power,
            stop,
            worker_handle: Some(handle),
            elem_callback,
            op_callback,
            lockup,
            response_wait: Duration::from_millis(500),
        })
    }

    /// Register the element-status fan-out callback.
    pub fn set_elem_status_callback(&self, cb: ElemStatusCallback) {
        *self.elem_callback.lock().unwrap() = Some(cb);
    }

    /// Register the bus-operation-status callback.
    pub fn set_operation_status_callback(&self, cb: OperationStatusCallback) {
        *self.op_callback.lock().unwrap() = Some(cb);
    }

    pub fn operation_status(&self) -> BusOperationStatus {
        *self.lockup.last_status.lock().unwrap()
    }

    /// Queue a one-shot or periodic request.
    pub fn add_request(&self, req: Request) -> bool {
        self.accessor.add_request(req)
    }

    pub fn remove_poll(&self, address: AddrSlot) -> bool {
        self.accessor.remove_poll(address)
    }

    /// Synchronous convenience wrapper: queue a transaction and block the
    /// calling thread until its response arrives or the wait budget
    /// expires.
    pub fn access(&self, address: AddrSlot, write: Vec<u8>, read_length: usize) -> Result<RequestOutcome, ResponseCode> {
        let req = RequestBuilder::new(RequestKind::Std, address)
            .write(write)
            .read_length(read_length)
            .build();
        if !self.add_request(req) {
            return Err(ResponseCode::Incomplete);
        }
        let deadline = Instant::now() + self.response_wait;
        loop {
            if let Some(outcome) = self.accessor.next_response() {
                return Ok(outcome);
            }
            if Instant::now() >= deadline {
                return Err(ResponseCode::SwTimeOut);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn is_online(&self, address: AddrSlot) -> bool {
        self.status.is_online(address)
    }

    /// Number of poll records currently buffered for `address`.
    pub fn poll_ring_count(&self, address: AddrSlot) -> usize {
        self.status.ring_count(address)
    }

    /// Pop the oldest buffered poll record for `address`, if any. Each
    /// record is `[drv_i2c_api::PollRecordHeader]` bytes followed by the
    /// device type's decoded payload;
    /// feed successive pops through one [`drv_i2c_api::PollTimestampDecoder`]
    /// per device to recover monotonic absolute timestamps.
    pub fn poll_ring_pop(&self, address: AddrSlot) -> Option<Vec<u8>> {
        self.status.ring_pop(address)
    }

    /// Force an immediate re-cycle of `slot`'s power group at its current
    /// level. The worker's power state machine drives the
    /// slot back through `OffDuringCycle` / `OnWaitStable` on its next
    /// ticks; `is_slot_power_stable` reflects the outcome.
    pub fn power_cycle_slot(&self, slot: u8) -> Result<(), ResponseCode> {
        self.power
            .lock()
            .unwrap()
            .power_cycle_slot(slot, Instant::now())
    }

    /// Whether `slot`'s power group is currently at its required level.
    pub fn is_slot_power_stable(&self, slot: u8) -> bool {
        self.power.lock().unwrap().is_stable(slot)
    }

    pub fn pause(&self, paused: bool) {
        self.accessor.pause(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.accessor.is_paused()
    }

    /// Stop the worker thread and tear down.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.stop();
    }
}
