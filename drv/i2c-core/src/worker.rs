// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-bus cooperative worker loop.
//!
//! One dedicated `std::thread` per peripheral bus, the sole owner of its
//! controller after `init`. Each iteration runs the same seven steps in
//! order: service power/recovery state machines, dispatch due polls,
//! drain one queued request, step the scanner, then flush buffered
//! IO-expander writes.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use drv_i2c_api::{ElemStatusChange, RequestOutcome, ResponseCode};
use drv_i2c_types::I2cHardware;
use log::{error, trace, warn};

use crate::accessor::Accessor;
use crate::catalog::DeviceTypeCatalog;
use crate::central::I2CCentral;
use crate::identity::{IdentifyOutcome, IdentityManager};
use crate::ioexpander::IOExpanderSet;
use crate::mux::MultiplexerTree;
use crate::polling::PollingManager;
use crate::power::PowerController;
use crate::scanner::Scanner;
use crate::status::StatusManager;
use crate::stuck::BusStuckHandler;

/// Number of loop iterations run back-to-back before yielding the
/// thread, so a busy bus still lets the scheduler run other work.
pub const LOOPS_BEFORE_YIELD: u32 = 50;
/// How long to yield for every `LOOPS_BEFORE_YIELD` iterations.
pub const I2C_LOOP_YIELD_MS: u64 = 1;
/// Settle time after escalating to a slot power cycle before re-clocking
/// the bus.
pub const STUCK_POWER_CYCLE_WAIT_MS: u64 = 200;

pub type StatusCallback = Arc<dyn Fn(&[ElemStatusChange]) + Send + Sync>;

/// Every sub-component a `BusWorker` drives, in dependency order (leaf
/// components first).
pub struct WorkerContext<H: I2cHardware> {
    pub central: I2CCentral<H>,
    pub stuck: BusStuckHandler,
    pub ioexp: IOExpanderSet,
    pub power: Arc<Mutex<PowerController>>,
    pub mux: MultiplexerTree,
    pub catalog: Arc<DeviceTypeCatalog>,
    pub status: Arc<StatusManager>,
    pub scanner: Scanner,
    pub accessor: Arc<Accessor>,
    pub status_callback: Option<StatusCallback>,
    /// Mirrors `I2CCentral::is_operating_ok()` after each tick's health
    /// check, so `Bus` can read live controller health from outside the
    /// worker thread without locking the controller itself.
    pub operating_ok: Arc<AtomicBool>,
    started_at: Instant,
    initialized: bool,
}

impl<H: I2cHardware> WorkerContext<H> {
    pub fn new(
        central: I2CCentral<H>,
        power: Arc<Mutex<PowerController>>,
        mux: MultiplexerTree,
        catalog: Arc<DeviceTypeCatalog>,
        status: Arc<StatusManager>,
        scanner: Scanner,
        accessor: Arc<Accessor>,
    ) -> Self {
        Self {
            central,
            stuck: BusStuckHandler::new(),
            ioexp: IOExpanderSet::new(),
            power,
            mux,
            catalog,
            status,
            scanner,
            accessor,
            status_callback: None,
            operating_ok: Arc::new(AtomicBool::new(true)),
            started_at: Instant::now(),
            initialized: true,
        }
    }

    fn now_us(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Run one iteration of the seven-step loop. Returns `false`
    /// if the worker should stop (deinitialized).
    pub fn tick(&mut self) -> bool {
        if !self.initialized {
            return false;
        }
        let now = Instant::now();
        let now_ms = self.now_ms();
        let now_us = self.now_us();

        // 1. Early-exit during hiatus.
        if self.accessor.is_in_hiatus(now_ms) {
            return true;
        }

        // 2. Pause state is read live from the accessor by every step
        //    below; nothing to cache here.

        if !self.central.is_operating_ok() {
            if self.stuck.clear(self.central.hardware_mut()).is_err() {
                self.status.inform_bus_stuck();
            }
            self.operating_ok
                .store(self.central.is_operating_ok(), Ordering::Relaxed);
            if self.central.ensure_ready().is_err() {
                return true;
            }
        } else {
            self.operating_ok.store(true, Ordering::Relaxed);
        }

        // 3. Tick power/mux state machines.
        if let Err(e) = self
            .power
            .lock()
            .unwrap()
            .poll(&mut self.ioexp, &mut self.mux, &mut self.central, now)
        {
            trace!(target: "i2c_core::worker", "power service error: {e:?}");
        }

        // 4. Scanner step (only while not paused).
        if !self.accessor.is_paused() {
            self.run_scan_cycle(now_us);
        }

        // 5. Drain one queued request.
        self.run_one_request();

        // 6. Due-poll dispatch.
        let _ = PollingManager::service(&self.status, &mut self.mux, &mut self.central, now_us);

        // 7. Flush IO-expander shadow state.
        if let Err(e) = self.ioexp.flush(&mut self.mux, &mut self.central) {
            trace!(target: "i2c_core::worker", "ioexpander sync error: {e:?}");
        }

        self.dispatch_status_changes();
        true
    }

    fn run_scan_cycle(&mut self, _now_us: u64) {
        let status = Arc::clone(&self.status);
        let known_slots = self.mux.known_slots();
        let targets = self
            .scanner
            .targets_for_cycle(&known_slots, |addr| {
                status.is_online(drv_i2c_api::AddrSlot::main_bus(addr))
            });

        let mut topology_changed = false;
        for target in targets {
            if self.mux.in_mux_range(target.addr()) {
                if let Some(known_slot) = self.mux.online_conn_slot(target.addr()) {
                    if known_slot != target.slot() {
                        // Never probe a mux address at a slot
                        // inconsistent with its recorded conn_slot once
                        // it has been confirmed online somewhere.
                        continue;
                    }
                }
            }
            if self.slot_power_unstable(target.slot()) {
                continue;
            }
            if self.enable_slot_with_recovery(target.slot()).is_err() {
                break;
            }
            let acked = self.central.access(target.addr(), &[], &mut []).is_ok();

            if self.mux.in_mux_range(target.addr()) {
                match self.mux.elem_state_change(target.addr(), target.slot(), acked) {
                    Ok(Some(change)) => {
                        if change.is_change_to_online {
                            topology_changed = true;
                        }
                    }
                    Ok(None) => {}
                    Err(_) => self.status.inform_bus_stuck(),
                }
                continue;
            }

            let outcome = self.status.observe_probe(target, acked);
            if outcome == crate::status::ProbeOutcome::BecameOnline {
                self.run_identification(target);
            }
        }
        let _ = self.mux.disable_all_slots(&mut self.central);
        if topology_changed {
            trace!(target: "i2c_core::worker", "mux topology changed, restarting mux-only scan");
            self.scanner.reset_to_mux_only();
        }
        self.scanner.tick_state();
    }

    fn run_identification(&mut self, address: drv_i2c_api::AddrSlot) {
        let identity = IdentityManager::new(&self.catalog);
        match identity.identify(&mut self.central, address) {
            IdentifyOutcome::Identified {
                device_type_index,
                polling,
                ring_capacity,
            } => {
                self.status
                    .set_device_type(address, device_type_index, polling, ring_capacity);
            }
            IdentifyOutcome::NoMatch | IdentifyOutcome::Aborted(_) => {}
        }
    }

    /// True if `slot` belongs to a configured power group that is not yet
    /// at its required level. A slot with no power control at all is always
    /// stable.
    fn slot_power_unstable(&self, slot: u8) -> bool {
        !self.power.lock().unwrap().is_stable(slot)
    }

    /// The hot-path slot enable, wrapping the raw
    /// channel-select with the escalating bus-stuck recovery loop steps 1
    /// and 6 describe: a proactive stuck check before touching the mux,
    /// and a re-check after, since selecting a channel can itself wedge a
    /// marginal bus.
    fn enable_slot_with_recovery(&mut self, slot: u8) -> Result<(), ResponseCode> {
        self.recover_stuck_bus(slot)?;
        let result = self.mux.enable_one_slot(&mut self.central, slot);
        if result.is_ok() && self.stuck.is_stuck(self.central.hardware_mut()) {
            self.recover_stuck_bus(slot)?;
        }
        result
    }

    /// Escalating bus-stuck recovery: up to
    /// [`crate::stuck::BUS_CLEAR_ATTEMPTS`] rounds of clock-pulse, then
    /// disable-all, then power-cycling the affected slot (or slot 0) and
    /// waiting 200ms before re-clocking. Returns `Ok(())` immediately if
    /// the bus was never stuck to begin with.
    fn recover_stuck_bus(&mut self, slot: u8) -> Result<(), ResponseCode> {
        if !self.stuck.is_stuck(self.central.hardware_mut()) {
            return Ok(());
        }
        for attempt in 1..=crate::stuck::BUS_CLEAR_ATTEMPTS {
            self.central.hardware_mut().clock_pulse();
            if !self.stuck.is_stuck(self.central.hardware_mut()) {
                self.stuck.recoveries += 1;
                return Ok(());
            }

            let _ = self.mux.disable_all_slots(&mut self.central);
            if !self.stuck.is_stuck(self.central.hardware_mut()) {
                self.stuck.recoveries += 1;
                return Ok(());
            }

            warn!(
                target: "i2c_core::worker",
                "bus still stuck after clocking and disable-all (attempt {attempt}), power-cycling"
            );
            let cycle_slot = if slot == 0 { 0 } else { slot };
            let _ = self
                .power
                .lock()
                .unwrap()
                .power_cycle_slot(cycle_slot, Instant::now());
            thread::sleep(Duration::from_millis(STUCK_POWER_CYCLE_WAIT_MS));
            self.central.hardware_mut().clock_pulse();
            if !self.stuck.is_stuck(self.central.hardware_mut()) {
                self.stuck.recoveries += 1;
                return Ok(());
            }
        }

        self.stuck.recovery_failures += 1;
        self.status.inform_bus_stuck();
        error!(target: "i2c_core::worker", "bus-stuck recovery exhausted for slot {slot}");
        Err(ResponseCode::BusStuck)
    }

    fn respond_unstable(&mut self, req: &drv_i2c_api::Request) {
        let outcome = RequestOutcome {
            address: req.address,
            cmd_id: req.cmd_id,
            read_bytes: Vec::new(),
            code: ResponseCode::SlotPowerUnstable,
        };
        if let Some(cb) = &req.callback {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(&outcome))) {
                error!(target: "i2c_core::worker", "request callback panicked: {panic:?}");
            }
        } else {
            self.accessor.push_response(outcome);
        }
    }

    fn run_one_request(&mut self) {
        let Some(req) = self.accessor.next_request() else {
            return;
        };
        if self.slot_power_unstable(req.address.slot()) {
            self.respond_unstable(&req);
            return;
        }
        if self.enable_slot_with_recovery(req.address.slot()).is_err() {
            return;
        }

        let mut read_buf = vec![0u8; req.read_length];
        let result = self
            .central
            .access(req.address.addr(), &req.write_bytes, &mut read_buf);
        let _ = self.mux.disable_all_slots(&mut self.central);

        let outcome = RequestOutcome {
            address: req.address,
            cmd_id: req.cmd_id,
            read_bytes: read_buf,
            code: result.err().unwrap_or(ResponseCode::Ok),
        };

        if req.bar_after_ms > 0 {
            self.status
                .bar_elem_access_set(req.address, self.now_ms(), req.bar_after_ms as u64);
        }

        if let Some(cb) = &req.callback {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(&outcome))) {
                error!(target: "i2c_core::worker", "request callback panicked: {panic:?}");
            }
        } else {
            self.accessor.push_response(outcome);
        }
    }

    fn dispatch_status_changes(&self) {
        if let Some(cb) = &self.status_callback {
            self.status.dispatch_changes(cb.as_ref());
        } else {
            // No callback registered: still clear pending flags so they
            // don't accumulate unbounded.
            let _ = self.status.drain_changes();
        }
    }
}

/// Spawns the dedicated OS thread that owns `ctx` for the lifetime of
/// the bus, using `builder` for the thread's name and stack size.
pub fn spawn<H: I2cHardware + 'static>(
    builder: thread::Builder,
    mut ctx: WorkerContext<H>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    builder.spawn(move || {
        let mut loops = 0u32;
        while !stop.load(Ordering::Relaxed) {
            if !ctx.tick() {
                break;
            }
            loops += 1;
            if loops >= LOOPS_BEFORE_YIELD {
                loops = 0;
                thread::sleep(Duration::from_millis(I2C_LOOP_YIELD_MS));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AddressSet, DeviceTypeBuilder, DeviceTypeCatalog};
    use drv_i2c_api::RequestBuilder;
    use drv_i2c_types::mock::MockI2cHardware;
    use drv_i2c_types::HardwareInit;

    fn vcnl4040() -> crate::catalog::DeviceTypeRecord {
        DeviceTypeBuilder::new("vcnl4040", AddressSet::List(vec![0x60]))
            .detection("0x0c=0b00001001")
            .unwrap()
            .init("0x0011")
            .unwrap()
            .poll("0x08=r2", 1, 8)
            .unwrap()
            .build(Arc::new(|_raw: &[u8]| Vec::new()))
    }

    fn new_ctx(hw: MockI2cHardware) -> WorkerContext<MockI2cHardware> {
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        let power = Arc::new(Mutex::new(PowerController::new(vec![], Instant::now())));
        let mux = MultiplexerTree::new(false, 0x70, 0x77);
        let catalog = Arc::new(DeviceTypeCatalog::new(vec![vcnl4040()]));
        let status = Arc::new(StatusManager::new());
        let scanner = Scanner::new(vec![0x60], vec![]);
        let accessor = Arc::new(Accessor::new(false, 8, 8));
        WorkerContext::new(central, power, mux, catalog, status, scanner, accessor)
    }

    #[test]
    fn scanning_brings_a_present_device_online_and_identifies_it() {
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x60);
        hw.set_register(0x60, 0x0c, 0x09);
        let mut ctx = new_ctx(hw);

        for _ in 0..10 {
            ctx.tick();
        }

        assert!(ctx.status.is_online(drv_i2c_api::AddrSlot::main_bus(0x60)));
    }

    #[test]
    fn queued_request_is_drained_and_its_callback_invoked() {
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x29);
        hw.set_register(0x29, 0x00, 0x42);
        let mut ctx = new_ctx(hw);

        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let req = RequestBuilder::new(
            drv_i2c_api::RequestKind::Std,
            drv_i2c_api::AddrSlot::main_bus(0x29),
        )
        .write(vec![0x00])
        .read_length(1)
        .callback(Arc::new(move |outcome: &RequestOutcome| {
            *seen2.lock().unwrap() = Some(outcome.read_bytes.clone());
        }))
        .build();
        ctx.accessor.add_request(req);

        ctx.tick();

        assert_eq!(*seen.lock().unwrap(), Some(vec![0x42]));
    }

    #[test]
    fn hiatus_skips_the_entire_loop_body() {
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x60);
        let mut ctx = new_ctx(hw);
        ctx.accessor.hiatus(0, 10_000_000);

        let before = ctx.central.hardware().transaction_count;
        ctx.tick();
        assert_eq!(ctx.central.hardware().transaction_count, before);
    }

    #[test]
    fn status_changes_are_dispatched_through_the_registered_callback() {
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x60);
        let mut ctx = new_ctx(hw);

        let batches = Arc::new(Mutex::new(Vec::new()));
        let batches2 = Arc::clone(&batches);
        ctx.status_callback = Some(Arc::new(move |batch: &[ElemStatusChange]| {
            batches2.lock().unwrap().push(batch.to_vec());
        }));

        for _ in 0..10 {
            ctx.tick();
        }

        let batches = batches.lock().unwrap();
        assert!(batches.iter().any(|b| !b.is_empty()));
    }

    #[test]
    fn recover_stuck_bus_is_a_no_op_when_the_bus_was_never_stuck() {
        let mut ctx = new_ctx(MockI2cHardware::new());
        assert_eq!(ctx.recover_stuck_bus(0), Ok(()));
        assert_eq!(ctx.stuck.recoveries, 0);
    }

    #[test]
    fn recover_stuck_bus_escalates_to_a_power_cycle_before_clearing() {
        // scenario 3: clocking and disable-all alone don't free the
        // bus within the first sub-step, so recovery escalates to a slot
        // power cycle and one more clock pulse before it clears.
        let mut hw = MockI2cHardware::new();
        hw.simulate_stuck(2);
        let mut ctx = new_ctx(hw);

        assert_eq!(ctx.recover_stuck_bus(3), Ok(()));
        assert_eq!(ctx.stuck.recoveries, 1);
        assert_eq!(ctx.stuck.recovery_failures, 0);
    }

    #[test]
    fn recover_stuck_bus_gives_up_after_bus_clear_attempts_and_marks_everything_offline() {
        let mut hw = MockI2cHardware::new();
        hw.add_device(0x60);
        hw.simulate_stuck(1_000);
        let mut ctx = new_ctx(hw);
        ctx.status.observe_probe(drv_i2c_api::AddrSlot::main_bus(0x60), true);
        ctx.status.observe_probe(drv_i2c_api::AddrSlot::main_bus(0x60), true);
        assert!(ctx.status.is_online(drv_i2c_api::AddrSlot::main_bus(0x60)));

        assert_eq!(ctx.recover_stuck_bus(0), Err(ResponseCode::BusStuck));
        assert_eq!(ctx.stuck.recovery_failures, 1);
        assert!(!ctx.status.is_online(drv_i2c_api::AddrSlot::main_bus(0x60)));
    }

    #[test]
    fn enable_slot_with_recovery_clears_a_stuck_bus_before_selecting_the_channel() {
        let mut hw = MockI2cHardware::new();
        hw.simulate_stuck(1);
        let mut ctx = new_ctx(hw);
        assert_eq!(ctx.enable_slot_with_recovery(0), Ok(()));
        assert_eq!(ctx.stuck.recoveries, 1);
    }
}
