// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-tiered address scanning.
//!
//! Settles the mux topology first, then falls back to a steady low-rate
//! sweep. The exact tier-count table is caller-supplied configuration
//! rather than a hardcoded table, since it depends on the shape of a
//! particular device population.

use drv_i2c_api::AddrSlot;

/// Number of `MainBusMuxOnly`/`MainBus` cycles run at startup before the
/// scanner settles into steady-state scanning, chosen so a two-level mux
/// tree has time to fully surface.
pub const FAST_SCAN_REPEATS: u32 = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScannerState {
    Idle,
    MainBusMuxOnly,
    MainBus,
    ScanFast,
    ScanSlow,
}

/// One priority tier: a pool of addresses and how often (in tier-0
/// cycles) it additionally gets a probe alongside tier 0's own.
struct Tier {
    addresses: Vec<u8>,
    /// Tier 0's count is unused (it is stepped every cycle); for other
    /// tiers, this tier is additionally stepped once every `count`
    /// cycles.
    count: u32,
    cursor: usize,
}

impl Tier {
    fn next_address(&mut self) -> Option<u8> {
        if self.addresses.is_empty() {
            return None;
        }
        let addr = self.addresses[self.cursor % self.addresses.len()];
        self.cursor = (self.cursor + 1) % self.addresses.len();
        Some(addr)
    }
}

/// Drives the scan-state progression and priority-weighted address
/// selection for one bus.
pub struct Scanner {
    state: ScannerState,
    repeats_remaining: u32,
    tiers: Vec<Tier>,
    global_step: u64,
    fast_requested: bool,
}

impl Scanner {
    /// `tier0` is the highest-priority pool (known-common peripherals
    /// plus `scan_boost`); `other_tiers` is `(addresses, count)` for each
    /// progressively lower-priority tier, stepped once every `count`
    /// tier-0 cycles.
    pub fn new(tier0: Vec<u8>, other_tiers: Vec<(Vec<u8>, u32)>) -> Self {
        let mut tiers = vec![Tier {
            addresses: tier0,
            count: 1,
            cursor: 0,
        }];
        tiers.extend(other_tiers.into_iter().map(|(addresses, count)| Tier {
            addresses,
            count: count.max(1),
            cursor: 0,
        }));
        Self {
            state: ScannerState::Idle,
            repeats_remaining: FAST_SCAN_REPEATS,
            tiers,
            global_step: 0,
            fast_requested: false,
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Force a rescan pass, used both at startup and whenever mux
    /// topology changes.
    pub fn reset_to_mux_only(&mut self) {
        self.state = ScannerState::MainBusMuxOnly;
        self.repeats_remaining = FAST_SCAN_REPEATS;
    }

    /// Caller requests an explicit fast sweep (e.g. a `ScanFast` request
    /// arrived through the accessor).
    pub fn request_fast(&mut self) {
        self.fast_requested = true;
    }

    /// Advance the state machine by one cycle's worth of bookkeeping.
    /// Call once per worker iteration before pulling scan targets.
    pub fn tick_state(&mut self) {
        match self.state {
            ScannerState::Idle => self.reset_to_mux_only(),
            ScannerState::MainBusMuxOnly | ScannerState::MainBus => {
                if self.repeats_remaining > 0 {
                    self.repeats_remaining -= 1;
                } else if self.state == ScannerState::MainBusMuxOnly {
                    self.state = ScannerState::MainBus;
                    self.repeats_remaining = FAST_SCAN_REPEATS;
                } else {
                    self.state = ScannerState::ScanSlow;
                }
            }
            ScannerState::ScanFast => {
                if !self.fast_requested {
                    self.state = ScannerState::ScanSlow;
                }
                self.fast_requested = false;
            }
            ScannerState::ScanSlow => {
                if self.fast_requested {
                    self.state = ScannerState::ScanFast;
                    self.fast_requested = false;
                }
            }
        }
    }

    /// One priority-weighted selection of addresses for this cycle: tier
    /// 0's next address always, plus any lower tier whose count divides
    /// the running step counter.
    pub fn step_addresses(&mut self) -> Vec<u8> {
        self.global_step += 1;
        let mut out = Vec::new();
        if let Some(addr) = self.tiers[0].next_address() {
            out.push(addr);
        }
        for tier in self.tiers.iter_mut().skip(1) {
            if self.global_step % tier.count as u64 == 0 {
                if let Some(addr) = tier.next_address() {
                    out.push(addr);
                }
            }
        }
        out
    }

    /// Expand this cycle's addresses into full scan targets across the
    /// known slots, applying the duplicate-prevention rule: never probe
    /// an address on a non-main-bus slot if that exact address is
    /// already known online on the main bus.
    pub fn targets_for_cycle(
        &mut self,
        known_slots: &[u8],
        already_on_main_bus: impl Fn(u8) -> bool,
    ) -> Vec<AddrSlot> {
        let mut targets = Vec::new();
        for addr in self.step_addresses() {
            targets.push(AddrSlot::main_bus(addr));
            if !already_on_main_bus(addr) {
                for &slot in known_slots {
                    if slot != 0 {
                        targets.push(AddrSlot::new(addr, slot));
                    }
                }
            }
        }
        targets
    }
}
