// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration descriptors.
//!
//! The host application owns config storage and format (JSON config
//! loading and non-volatile storage are explicitly out of scope); this
//! module only defines the structured descriptor the CORE consumes and two
//! convenience parsers (`toml` and `serde_json`) for callers who would
//! rather hand the CORE a string than build the struct themselves.

use serde::{Deserialize, Serialize};

fn default_freq_hz() -> u32 {
    100_000
}

/// Per-bus configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    pub port: u8,
    pub sda_pin: u8,
    pub scl_pin: u8,
    #[serde(default = "default_freq_hz")]
    pub freq_hz: u32,
    #[serde(default)]
    pub filter_level: u8,
    #[serde(default)]
    pub task_core: u8,
    #[serde(default)]
    pub task_priority: u8,
    #[serde(default = "default_task_stack_bytes")]
    pub task_stack_bytes: usize,
    #[serde(default)]
    pub low_load: bool,
    #[serde(default)]
    pub scan_boost: Vec<u8>,
    /// An address whose online/offline transitions gate
    /// `BusOperationStatus`.
    #[serde(default)]
    pub lockup_detect: Option<u8>,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub io_expanders: Vec<IoExpanderConfig>,
}

fn default_task_stack_bytes() -> usize {
    8192
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: 0,
            sda_pin: 0,
            scl_pin: 0,
            freq_hz: default_freq_hz(),
            filter_level: 0,
            task_core: 0,
            task_priority: 0,
            task_stack_bytes: default_task_stack_bytes(),
            low_load: false,
            scan_boost: Vec::new(),
            lockup_detect: None,
            mux: MuxConfig::default(),
            power: PowerConfig::default(),
            io_expanders: Vec::new(),
        }
    }
}

impl BusConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Multiplexer-tree configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MuxConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_min_addr")]
    pub min_addr: u8,
    #[serde(default = "default_max_addr")]
    pub max_addr: u8,
    #[serde(default)]
    pub reset_pins: Vec<u8>,
}

fn default_min_addr() -> u8 {
    0x70
}

fn default_max_addr() -> u8 {
    0x77
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enable: false,
            min_addr: default_min_addr(),
            max_addr: default_max_addr(),
            reset_pins: Vec::new(),
        }
    }
}

/// One (virtual-pin, active-level) pair used to compose a voltage-level
/// bitmap.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LevelPin {
    pub vpin: u16,
    pub active_high: bool,
}

/// The non-OFF voltage levels available to a slot group, each with the
/// pins that must be driven to reach it.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LevelPins {
    pub vpins: Vec<LevelPin>,
}

/// A contiguous range of slots sharing power-control wiring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlotGroupConfig {
    pub name: String,
    pub start_slot: u8,
    pub num_slots: u8,
    #[serde(default)]
    pub default_level_idx: u8,
    /// Pin lists for each non-OFF level, indexed from 0.
    pub levels_excl_off: Vec<LevelPins>,
}

/// Power-control configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Ordered level names; index 0 is always OFF.
    #[serde(default)]
    pub voltage_levels: Vec<String>,
    #[serde(default)]
    pub slot_groups: Vec<SlotGroupConfig>,
}

/// One IO-expander chip.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoExpanderConfig {
    pub dev: String,
    pub addr: u8,
    #[serde(default)]
    pub mux_addr: Option<u8>,
    #[serde(default)]
    pub mux_chan_idx: Option<u8>,
    #[serde(default)]
    pub mux_rst_pin: Option<u8>,
    pub v_pin_base: u16,
    pub num_pins: u16,
}
