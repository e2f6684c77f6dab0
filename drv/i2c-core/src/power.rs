// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-slot power-group state machine.
//!
//! An explicit off period before re-energizing a slot, then a settle
//! period before the bus trusts anything on it, driven by wall-clock
//! timestamps rather than blocking delays, since the timing runs inside
//! `BusWorker`'s cooperative loop instead of a dedicated task.

use std::time::{Duration, Instant};

use drv_i2c_api::ResponseCode;
use drv_i2c_types::I2cHardware;
use log::{debug, info};

use crate::central::I2CCentral;
use crate::config::SlotGroupConfig;
use crate::ioexpander::IOExpanderSet;
use crate::mux::MultiplexerTree;

/// Delay before a slot group is first energized after startup.
pub const STARTUP_OFF_MS: u64 = 100;
/// Off-phase duration of a power cycle.
pub const CYCLE_OFF_MS: u64 = 500;
/// Settle time after power is applied before the slot is trusted.
pub const STABILIZE_MS: u64 = 100;

/// Power state of one slot group.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// Held off indefinitely, e.g. after a fault; only a fresh
    /// `set_level` escapes this state.
    OffPermanent,
    /// Startup grace period before the group is first energized.
    OffPreInit,
    /// Off phase of an explicit power cycle, timing out into
    /// `OnWaitStable` at the new level.
    OffDuringCycle,
    /// Energized, waiting for rails to settle before being trusted.
    OnWaitStable,
    /// Steady state: powered at `target_level` and stable.
    AtRequiredLevel,
}

struct SlotGroup {
    cfg: SlotGroupConfig,
    state: PowerState,
    target_level: u8,
    /// When the current state was entered; transitions are computed
    /// relative to this.
    since: Instant,
}

impl SlotGroup {
    fn level_pins(&self, level_idx: u8) -> Option<&crate::config::LevelPins> {
        if level_idx == 0 {
            None // level 0 is always OFF, no pins to drive
        } else {
            self.cfg.levels_excl_off.get(level_idx as usize - 1)
        }
    }
}

/// Drives every configured slot group's power state machine.
pub struct PowerController {
    groups: Vec<SlotGroup>,
}

impl PowerController {
    pub fn new(configs: Vec<SlotGroupConfig>, now: Instant) -> Self {
        let groups = configs
            .into_iter()
            .map(|cfg| {
                let target_level = cfg.default_level_idx;
                SlotGroup {
                    cfg,
                    state: PowerState::OffPreInit,
                    target_level,
                    since: now,
                }
            })
            .collect();
        Self { groups }
    }

    fn group_for_slot(&self, slot: u8) -> Option<usize> {
        self.groups.iter().position(|g| {
            slot >= g.cfg.start_slot && slot < g.cfg.start_slot + g.cfg.num_slots
        })
    }

    pub fn state_of(&self, slot: u8) -> Option<PowerState> {
        self.group_for_slot(slot).map(|i| self.groups[i].state)
    }

    /// `is_slot_power_stable(s) ⇔ power_state[s] == AT_REQUIRED_LEVEL` for a
    /// slot with a configured power group; a slot with no power control at
    /// all cannot be unstable, so it reads as stable. Slot 0 falls
    /// out of this same rule when it has no controller of its own, which is
    /// the behavior an unconfigured slot should have rather than a
    /// special case.
    pub fn is_stable(&self, slot: u8) -> bool {
        match self.group_for_slot(slot) {
            Some(i) => matches!(self.groups[i].state, PowerState::AtRequiredLevel),
            None => true,
        }
    }

    /// Request a voltage level for every slot in `slot`'s group. Changing
    /// away from OFF toward a level, or between two non-OFF levels,
    /// always routes through an off phase so rails fully discharge before
    /// the new level is applied.
    pub fn set_level(&mut self, slot: u8, level_idx: u8, now: Instant) -> Result<(), ResponseCode> {
        let Some(i) = self.group_for_slot(slot) else {
            return Err(ResponseCode::Invalid);
        };
        let group = &mut self.groups[i];
        if level_idx as usize > group.cfg.levels_excl_off.len() {
            return Err(ResponseCode::Invalid);
        }

        info!(
            target: "i2c_core::power",
            "slot group {} requested level {level_idx}", group.cfg.name
        );
        group.target_level = level_idx;
        group.state = PowerState::OffDuringCycle;
        group.since = now;
        Ok(())
    }

    /// Re-cycle a slot group at its current level, e.g. to recover a device
    /// that has wedged without changing which level it runs at.
    pub fn power_cycle_slot(&mut self, slot: u8, now: Instant) -> Result<(), ResponseCode> {
        let level = self
            .group_for_slot(slot)
            .map(|i| self.groups[i].target_level)
            .ok_or(ResponseCode::Invalid)?;
        self.set_level(slot, level, now)
    }

    /// Force a slot group permanently off, e.g. after a persistent fault.
    /// Only a subsequent `set_level` call clears this.
    pub fn lock_off(&mut self, slot: u8) -> Result<(), ResponseCode> {
        let Some(i) = self.group_for_slot(slot) else {
            return Err(ResponseCode::Invalid);
        };
        self.groups[i].state = PowerState::OffPermanent;
        self.groups[i].target_level = 0;
        Ok(())
    }

    /// Advance every slot group's timers, driving IO-expander pins as
    /// states transition. Should be called once per `BusWorker` loop
    /// iteration.
    pub fn poll<H: I2cHardware>(
        &mut self,
        ioexp: &mut IOExpanderSet,
        mux: &mut MultiplexerTree,
        central: &mut I2CCentral<H>,
        now: Instant,
    ) -> Result<(), ResponseCode> {
        for group in &mut self.groups {
            let elapsed = now.saturating_duration_since(group.since);
            match group.state {
                PowerState::OffPermanent => {}
                PowerState::OffPreInit => {
                    if elapsed >= Duration::from_millis(STARTUP_OFF_MS) {
                        group.state = PowerState::OffDuringCycle;
                        group.since = now;
                    }
                }
                PowerState::OffDuringCycle => {
                    if elapsed >= Duration::from_millis(CYCLE_OFF_MS) {
                        Self::drive_level(group, ioexp)?;
                        group.state = PowerState::OnWaitStable;
                        group.since = now;
                    }
                }
                PowerState::OnWaitStable => {
                    if elapsed >= Duration::from_millis(STABILIZE_MS) {
                        debug!(
                            target: "i2c_core::power",
                            "slot group {} reached level {}",
                            group.cfg.name, group.target_level
                        );
                        group.state = PowerState::AtRequiredLevel;
                        group.since = now;
                    }
                }
                PowerState::AtRequiredLevel => {}
            }
        }
        ioexp.flush(mux, central)
    }

    fn drive_level(group: &SlotGroup, ioexp: &mut IOExpanderSet) -> Result<(), ResponseCode> {
        // Drive every pin this group controls, across every level, so a
        // switch to a new level also de-asserts the previous level's pins
        // (mutually exclusive rails).
        for (idx, level) in group.cfg.levels_excl_off.iter().enumerate() {
            let active = idx as u8 + 1 == group.target_level;
            for pin in &level.vpins {
                let high = active == pin.active_high;
                ioexp.set_pin(pin.vpin, high)?;
            }
        }
        Ok(())
    }
}
