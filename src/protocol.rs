//! Wire format of the CCD firmware.
//!
//! The firmware waits for exactly 12 bytes before doing anything:
//!
//! | bytes | content |
//! |---|---|
//! | 0-1 | `'E' 'R'`, where the firmware starts reading its circular buffer |
//! | 2-5 | SH period, big-endian |
//! | 6-9 | ICG period, big-endian |
//! | 10 | mode flag (0 one-shot, 1 continuous) |
//! | 11 | hardware average count (1..=15) |
//!
//! Each acquisition answers with 7388 bytes: 3694 little-endian `u16` samples.

use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::averaging::AveragingPlan;
use crate::config::{AcquisitionConfig, Mode};
use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Physical pixels on the TCD1304, dummy pixels included.
pub const PIXEL_COUNT: usize = 3694;

/// Bytes returned by one hardware acquisition.
pub const RAW_FRAME_LEN: usize = PIXEL_COUNT * 2;

/// Bytes in a command frame.
pub const COMMAND_LEN: usize = 12;

/// Start-of-command marker.
pub const MARKER: [u8; 2] = *b"ER";

/// Firmware limit on exposures averaged in hardware.
pub const MAX_HARDWARE_AVERAGE: u8 = 15;

const MODE_OFFSET: usize = 10;
const AVERAGE_OFFSET: usize = 11;

// ============================================================================
// Command Encoder
// ============================================================================

/// The 12-byte command sent to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandFrame([u8; COMMAND_LEN]);

impl CommandFrame {
    /// Build the command for `config` using the hardware count from `plan`.
    ///
    /// # Panics
    /// If `plan.hardware_average` exceeds [`MAX_HARDWARE_AVERAGE`]; plans from
    /// [`crate::averaging::plan_averaging`] never do.
    pub fn encode(config: &AcquisitionConfig, plan: &AveragingPlan) -> Self {
        assert!(
            plan.hardware_average <= MAX_HARDWARE_AVERAGE,
            "hardware average {} exceeds firmware limit",
            plan.hardware_average
        );

        let mut bytes = [0u8; COMMAND_LEN];
        bytes[0..2].copy_from_slice(&MARKER);
        bytes[2..6].copy_from_slice(&config.sh_period.to_be_bytes());
        bytes[6..10].copy_from_slice(&config.icg_period.to_be_bytes());
        bytes[MODE_OFFSET] = config.mode.to_byte();
        bytes[AVERAGE_OFFSET] = plan.hardware_average;
        Self(bytes)
    }

    /// Same command with the mode flag replaced.
    ///
    /// `with_mode(Mode::OneShot)` on a continuous command is the stop frame.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.0[MODE_OFFSET] = mode.to_byte();
        self
    }

    pub fn as_bytes(&self) -> &[u8; COMMAND_LEN] {
        &self.0
    }

    pub fn sh_period(&self) -> u32 {
        u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]])
    }

    pub fn icg_period(&self) -> u32 {
        u32::from_be_bytes([self.0[6], self.0[7], self.0[8], self.0[9]])
    }

    pub fn mode_byte(&self) -> u8 {
        self.0[MODE_OFFSET]
    }

    pub fn hardware_average(&self) -> u8 {
        self.0[AVERAGE_OFFSET]
    }

    /// Timing as it is on the wire, for labelling results.
    pub fn sent_timing(&self) -> SentTiming {
        SentTiming {
            sh_period: self.sh_period(),
            icg_period: self.icg_period(),
        }
    }
}

impl AsRef<[u8]> for CommandFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SH/ICG periods that were actually transmitted for a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentTiming {
    pub sh_period: u32,
    pub icg_period: u32,
}

// ============================================================================
// Sample Buffer
// ============================================================================

/// One spectrum: a sample per physical pixel, in readout order.
///
/// Pixels 1-32 and 3679-3694 are optically shielded; interpreting them is left
/// to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBuffer(Vec<u16>);

impl SampleBuffer {
    pub fn into_vec(self) -> Vec<u16> {
        self.0
    }

    pub(crate) fn from_vec_unchecked(samples: Vec<u16>) -> Self {
        debug_assert_eq!(samples.len(), PIXEL_COUNT);
        Self(samples)
    }
}

impl Deref for SampleBuffer {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        &self.0
    }
}

impl TryFrom<Vec<u16>> for SampleBuffer {
    type Error = DriverError;

    fn try_from(samples: Vec<u16>) -> Result<Self> {
        if samples.len() != PIXEL_COUNT {
            return Err(DriverError::Truncated {
                expected: PIXEL_COUNT,
                received: samples.len(),
            });
        }
        Ok(Self(samples))
    }
}

/// Decode a raw frame into pixel samples (`low | high << 8` per pixel).
///
/// # Errors
/// [`DriverError::Truncated`] when `raw` is not exactly [`RAW_FRAME_LEN`] bytes.
pub fn decode_raw_frame(raw: &[u8]) -> Result<SampleBuffer> {
    if raw.len() != RAW_FRAME_LEN {
        return Err(DriverError::Truncated {
            expected: RAW_FRAME_LEN,
            received: raw.len(),
        });
    }
    let samples = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(SampleBuffer(samples))
}
