// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-protocol definitions for I2C channel-multiplexer chips.
//!
//! The protocol (one status/control byte is the channel mask) is kept
//! separate from any particular transport, so `drv-i2c-core::mux` can
//! drive any [`I2cMuxChip`] over whatever `I2cHardware` the owning bus
//! was built with.
//!
//! PCA954x-family chips (PCA9545, PCA9546, PCA9548) all speak the same
//! single-byte protocol: writing a byte sets the channel-enable bitmask
//! (bit *n* enables channel *n*), and reading back the same address
//! returns the currently active mask. They differ only in channel count
//! and default address range.

#![no_std]

/// A channel-mux chip's wire protocol: how to turn a channel-enable
/// bitmask into bytes to write, and bytes read back into a bitmask.
pub trait I2cMuxChip {
    /// Number of channels this chip exposes.
    const CHANNEL_COUNT: u8;

    /// Typical factory-strap base address for this chip family, used as a
    /// scan default when no catalog entry overrides it.
    const DEFAULT_BASE_ADDR: u8;

    /// Bytes to write to set the channel-enable mask. `mask == 0` disables
    /// every channel.
    fn encode_channel_mask(mask: u8) -> [u8; 1] {
        [mask]
    }

    /// Decode a channel-enable mask from a status read. Returns `None` if
    /// the reply is too short to contain one.
    fn decode_channel_mask(read: &[u8]) -> Option<u8> {
        read.first().copied()
    }
}

/// PCA9545: 4-channel I2C bus switch.
pub struct Pca9545;

impl I2cMuxChip for Pca9545 {
    const CHANNEL_COUNT: u8 = 4;
    const DEFAULT_BASE_ADDR: u8 = 0x70;
}

/// PCA9548: 8-channel I2C bus switch — the chip this subsystem's
/// `MUX_MAX` channel-per-mux assumption
/// is sized around.
pub struct Pca9548;

impl I2cMuxChip for Pca9548 {
    const CHANNEL_COUNT: u8 = 8;
    const DEFAULT_BASE_ADDR: u8 = 0x70;
}

/// A single channel bit, validated against a chip's channel count.
pub fn channel_bit<C: I2cMuxChip>(channel: u8) -> Option<u8> {
    if channel < C::CHANNEL_COUNT {
        Some(1 << channel)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pca9548_has_eight_channels() {
        assert_eq!(Pca9548::CHANNEL_COUNT, 8);
        assert_eq!(channel_bit::<Pca9548>(7), Some(0x80));
        assert_eq!(channel_bit::<Pca9548>(8), None);
    }

    #[test]
    fn encode_decode_round_trips() {
        let bytes = Pca9548::encode_channel_mask(0x10);
        assert_eq!(Pca9548::decode_channel_mask(&bytes), Some(0x10));
    }

    #[test]
    fn all_zero_mask_is_the_reset_state() {
        let bytes = Pca9548::encode_channel_mask(0);
        assert_eq!(bytes, [0]);
    }
}
