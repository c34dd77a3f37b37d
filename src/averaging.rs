//! Hardware/software averaging split.
//!
//! The firmware averages at most [`MAX_HARDWARE_AVERAGE`] exposures itself.
//! Larger requests are served by repeating full hardware acquisitions and
//! averaging them on the host.
//!
//! Host-side averages are rounded half-to-even, then clamped to the `u16`
//! range.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::protocol::{SampleBuffer, MAX_HARDWARE_AVERAGE, PIXEL_COUNT};

/// How a requested average is split between firmware and host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AveragingPlan {
    /// Exposures averaged by the firmware per acquisition (1..=15).
    pub hardware_average: u8,
    /// Full hardware acquisitions averaged on the host.
    pub software_iterations: u32,
}

impl AveragingPlan {
    /// Total exposures that will be combined, at least the requested count.
    pub fn total_exposures(&self) -> u32 {
        self.hardware_average as u32 * self.software_iterations
    }
}

/// Split `requested_average` into hardware and software parts.
///
/// A request of 0 is treated as 1: the firmware always integrates at least once.
pub fn plan_averaging(requested_average: u8) -> AveragingPlan {
    let requested = if requested_average == 0 {
        warn!("requested average of 0 treated as 1");
        1
    } else {
        requested_average
    };

    if requested <= MAX_HARDWARE_AVERAGE {
        AveragingPlan {
            hardware_average: requested,
            software_iterations: 1,
        }
    } else {
        AveragingPlan {
            hardware_average: MAX_HARDWARE_AVERAGE,
            software_iterations: (requested as u32).div_ceil(MAX_HARDWARE_AVERAGE as u32),
        }
    }
}

/// Running per-pixel sums of hardware acquisitions.
///
/// `u32` sums cannot overflow: at most 17 frames of `u16::MAX` are folded.
#[derive(Debug, Clone)]
pub struct Accumulator {
    sums: Vec<u32>,
    folded: u32,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            sums: vec![0; PIXEL_COUNT],
            folded: 0,
        }
    }

    /// Add one decoded frame.
    pub fn fold(mut self, raw: &[u16]) -> Self {
        debug_assert_eq!(raw.len(), PIXEL_COUNT);
        for (sum, &sample) in self.sums.iter_mut().zip(raw) {
            *sum += sample as u32;
        }
        self.folded += 1;
        self
    }

    /// Frames folded so far.
    pub fn folded(&self) -> u32 {
        self.folded
    }

    /// Divide by the number of folded frames and narrow to `u16`.
    ///
    /// `software_iterations` is the count the plan called for; it must match
    /// what was folded.
    pub fn finish(self, software_iterations: u32) -> SampleBuffer {
        debug_assert_eq!(
            self.folded, software_iterations,
            "folded frame count does not match the averaging plan"
        );
        let divisor = self.folded.max(1);
        let samples = if divisor == 1 {
            self.sums
                .into_iter()
                .map(|sum| sum.min(u16::MAX as u32) as u16)
                .collect()
        } else {
            self.sums
                .into_iter()
                .map(|sum| round_half_even(sum, divisor).min(u16::MAX as u32) as u16)
                .collect()
        };
        SampleBuffer::from_vec_unchecked(samples)
    }
}

/// `sum / divisor` rounded to nearest, ties to even.
fn round_half_even(sum: u32, divisor: u32) -> u32 {
    let quotient = sum / divisor;
    let twice_remainder = 2 * (sum % divisor);
    if twice_remainder > divisor || (twice_remainder == divisor && quotient % 2 == 1) {
        quotient + 1
    } else {
        quotient
    }
}
