// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executes due polls and stores timestamped results.
//!
//! Each poll result carries a little-endian timestamp prefix, with wrap
//! handled at decode time. The worker drains one due poll per iteration
//! rather than batching, so no single device's schedule can starve the
//! rest of the loop.

use drv_i2c_api::{AddrSlot, PollRecordHeader, ResponseCode, TIMESTAMP_UNIT_US};
use drv_i2c_types::I2cHardware;
use log::{debug, warn};
use zerocopy::IntoBytes;

use crate::central::I2CCentral;
use crate::mux::MultiplexerTree;
use crate::status::{PollingInfo, StatusManager};

/// Result of attempting one worker-cycle's worth of poll work.
#[derive(Debug, Eq, PartialEq)]
pub enum PollStepOutcome {
    /// Nothing was due this cycle.
    Idle,
    /// A poll ran to completion and its record was stored.
    Completed(AddrSlot),
    /// A poll step declared a bar cooldown; the remainder resumes next
    /// cycle.
    Suspended(AddrSlot),
    /// Enabling the device's slot, or one of its steps, failed.
    Failed(AddrSlot, ResponseCode),
}

/// Internal outcome of [`PollingManager::run_steps`].
enum StepRunResult {
    Completed,
    Suspended { resume_at_us: u64 },
}

/// Drives the due-poll dispatcher.
pub struct PollingManager;

impl PollingManager {
    /// Run at most one device's due poll work this cycle.
    pub fn service<H: I2cHardware>(
        status: &StatusManager,
        mux: &mut MultiplexerTree,
        central: &mut I2CCentral<H>,
        now_us: u64,
    ) -> PollStepOutcome {
        let Some((address, mut info)) = status.get_pending_ident_poll(now_us) else {
            return PollStepOutcome::Idle;
        };

        if let Err(e) = mux.enable_one_slot(central, address.slot()) {
            warn!(
                target: "i2c_core::polling",
                "poll of {address} could not select its slot: {e:?}"
            );
            return PollStepOutcome::Failed(address, e);
        }

        let mut buffer = std::mem::take(&mut info.partial);
        if info.next_step_idx == 0 {
            let ticks = (now_us / TIMESTAMP_UNIT_US) as u16;
            buffer.clear();
            buffer.extend_from_slice(PollRecordHeader::new(ticks).as_bytes());
        }

        let outcome = Self::run_steps(&mut info, &mut buffer, address, central, now_us);
        let _ = mux.disable_all_slots(central);

        match outcome {
            Ok(StepRunResult::Completed) => {
                status.poll_result_store(address, buffer);
                status.advance_poll(address, 0, Vec::new(), Some(now_us));
                debug!(target: "i2c_core::polling", "{address} poll completed");
                PollStepOutcome::Completed(address)
            }
            Ok(StepRunResult::Suspended { resume_at_us }) => {
                status.advance_poll_with_resume(
                    address,
                    info.next_step_idx,
                    buffer,
                    None,
                    resume_at_us,
                );
                debug!(
                    target: "i2c_core::polling",
                    "{address} poll suspended at step {}, resuming after {resume_at_us}us",
                    info.next_step_idx
                );
                PollStepOutcome::Suspended(address)
            }
            Err(e) => {
                status.advance_poll(address, 0, Vec::new(), Some(now_us));
                PollStepOutcome::Failed(address, e)
            }
        }
    }

    /// Runs steps from `info.next_step_idx` onward, appending read bytes
    /// to `buffer`. Stops early (without consuming the step that declared
    /// it) once a non-final step's `bar_after_ms` has been satisfied, so
    /// the remainder resumes on a later cycle.
    fn run_steps<H: I2cHardware>(
        info: &mut PollingInfo,
        buffer: &mut Vec<u8>,
        address: AddrSlot,
        central: &mut I2CCentral<H>,
        now_us: u64,
    ) -> Result<StepRunResult, ResponseCode> {
        let total_steps = info.steps.len();
        while info.next_step_idx < total_steps {
            let step = info.steps[info.next_step_idx].clone();
            let mut read_buf = vec![0u8; step.read_len];
            central.access(address.addr(), &step.write, &mut read_buf)?;
            buffer.extend_from_slice(&read_buf);
            info.next_step_idx += 1;

            let is_last = info.next_step_idx >= total_steps;
            if step.bar_after_ms > 0 && !is_last {
                let resume_at_us = now_us + step.bar_after_ms as u64 * 1000;
                return Ok(StepRunResult::Suspended { resume_at_us });
            }
        }
        Ok(StepRunResult::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PollStep;
    use drv_i2c_types::mock::MockI2cHardware;
    use drv_i2c_types::HardwareInit;

    fn central_with(addr: u8) -> I2CCentral<MockI2cHardware> {
        let mut hw = MockI2cHardware::new();
        hw.add_device(addr);
        let mut central = I2CCentral::new(hw);
        central.init(HardwareInit::default()).unwrap();
        central
    }

    #[test]
    fn idle_when_nothing_is_due() {
        let status = StatusManager::new();
        let mut mux = MultiplexerTree::new(false, 0x70, 0x77);
        let mut central = central_with(0x60);
        assert_eq!(
            PollingManager::service(&status, &mut mux, &mut central, 0),
            PollStepOutcome::Idle
        );
    }

    #[test]
    fn completed_poll_prepends_timestamp_and_concatenates_step_reads() {
        let status = StatusManager::new();
        let address = AddrSlot::main_bus(0x60);
        status.observe_probe(address, true);
        status.observe_probe(address, true);

        let mut central = central_with(0x60);
        central.hardware_mut().set_registers(0x60, 0x08, &[0x10, 0x00]);
        central.hardware_mut().set_registers(0x60, 0x09, &[0x64, 0x00]);

        let steps = vec![
            PollStep { write: vec![0x08], read_len: 2, bar_after_ms: 0 },
            PollStep { write: vec![0x09], read_len: 2, bar_after_ms: 0 },
        ];
        status.set_device_type(address, 0, PollingInfo::new(steps, 100), 8);

        let mut mux = MultiplexerTree::new(false, 0x70, 0x77);
        let outcome = PollingManager::service(&status, &mut mux, &mut central, 1_000_000);
        assert_eq!(outcome, PollStepOutcome::Completed(address));
        assert_eq!(status.ring_count(address), 1);

        let record = status.ring_pop(address).unwrap();
        assert_eq!(record.len(), 2 + 4);
        assert_eq!(&record[2..], &[0x10, 0x00, 0x64, 0x00]);
    }

    #[test]
    fn poll_is_not_due_again_until_its_interval_elapses() {
        let status = StatusManager::new();
        let address = AddrSlot::main_bus(0x60);
        status.observe_probe(address, true);
        status.observe_probe(address, true);
        let steps = vec![PollStep { write: vec![0x08], read_len: 1, bar_after_ms: 0 }];
        status.set_device_type(address, 0, PollingInfo::new(steps, 1000), 4);

        let mut central = central_with(0x60);
        let mut mux = MultiplexerTree::new(false, 0x70, 0x77);
        assert_eq!(
            PollingManager::service(&status, &mut mux, &mut central, 0),
            PollStepOutcome::Completed(address)
        );
        assert_eq!(
            PollingManager::service(&status, &mut mux, &mut central, 500_000),
            PollStepOutcome::Idle
        );
        assert_eq!(
            PollingManager::service(&status, &mut mux, &mut central, 1_000_001),
            PollStepOutcome::Completed(address)
        );
    }

    #[test]
    fn a_bar_after_a_non_final_step_suspends_until_the_cooldown_elapses() {
        let status = StatusManager::new();
        let address = AddrSlot::main_bus(0x60);
        status.observe_probe(address, true);
        status.observe_probe(address, true);

        let mut central = central_with(0x60);
        central.hardware_mut().set_registers(0x60, 0x08, &[0xaa]);
        central.hardware_mut().set_registers(0x60, 0x09, &[0xbb]);

        let steps = vec![
            PollStep { write: vec![0x08], read_len: 1, bar_after_ms: 50 },
            PollStep { write: vec![0x09], read_len: 1, bar_after_ms: 0 },
        ];
        status.set_device_type(address, 0, PollingInfo::new(steps, 1000), 4);
        let mut mux = MultiplexerTree::new(false, 0x70, 0x77);

        assert_eq!(
            PollingManager::service(&status, &mut mux, &mut central, 0),
            PollStepOutcome::Suspended(address)
        );
        assert_eq!(status.ring_count(address), 0);

        // Too soon: the bar hasn't elapsed yet.
        assert_eq!(
            PollingManager::service(&status, &mut mux, &mut central, 10_000),
            PollStepOutcome::Idle
        );

        // 50ms = 50_000us have now passed; the second step runs and the
        // record completes with both steps' bytes, no extra timestamp.
        let outcome = PollingManager::service(&status, &mut mux, &mut central, 51_000);
        assert_eq!(outcome, PollStepOutcome::Completed(address));
        let record = status.ring_pop(address).unwrap();
        assert_eq!(&record[2..], &[0xaa, 0xbb]);
    }

    #[test]
    fn failed_step_reports_failure_and_resets_for_next_attempt() {
        let status = StatusManager::new();
        let address = AddrSlot::main_bus(0x60);
        status.observe_probe(address, true);
        status.observe_probe(address, true);
        let steps = vec![PollStep { write: vec![0x08], read_len: 1, bar_after_ms: 0 }];
        status.set_device_type(address, 0, PollingInfo::new(steps, 100), 4);

        let mut central = central_with(0x60);
        central.hardware_mut().inject_error(0x60, ResponseCode::AckError);
        let mut mux = MultiplexerTree::new(false, 0x70, 0x77);
        match PollingManager::service(&status, &mut mux, &mut central, 0) {
            PollStepOutcome::Failed(addr, ResponseCode::AckError) => assert_eq!(addr, address),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(status.ring_count(address), 0);
    }
}
