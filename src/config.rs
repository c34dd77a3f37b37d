//! Acquisition parameters and CCD timing rules.
//!
//! Everything here is a plain value: the session takes an [`AcquisitionConfig`]
//! by copy when it starts, so edits made by the caller afterwards never reach
//! the worker thread.
//!
//! # TCD1304 timing
//!
//! The firmware drives the sensor with two periods expressed in master clock
//! ticks:
//! - **SH period** sets the integration (exposure) time: `t_int = SH / f_M`.
//! - **ICG period** is the readout cycle and must be a whole multiple of SH and
//!   long enough to clock out every pixel (at least 14776 ticks).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Shortest ICG period that still reads out all 3694 pixels.
pub const MIN_ICG_PERIOD: u32 = 14_776;

/// Default serial baud rate of the CCD firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

const DEFAULT_SH_PERIOD: u32 = 200;
const DEFAULT_ICG_PERIOD: u32 = 100_000;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_FLUSH_POLL: Duration = Duration::from_millis(10);
const DEFAULT_FLUSH_ATTEMPTS: u32 = 100;
const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(10);
const DEFAULT_DRAIN_ATTEMPTS: u32 = 500;
const DEFAULT_FRAME_SLACK: Duration = Duration::from_secs(2);

// ============================================================================
// Data Types
// ============================================================================

/// Acquisition mode, sent as byte 10 of the command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One (possibly software-averaged) acquisition that terminates by itself.
    #[default]
    OneShot,
    /// The firmware streams one frame per integration until told to stop.
    Continuous,
}

impl Mode {
    /// Wire value of the mode flag.
    pub fn to_byte(self) -> u8 {
        match self {
            Mode::OneShot => 0,
            Mode::Continuous => 1,
        }
    }
}

/// Microcontroller boards the firmware runs on.
///
/// The board fixes the master clock and the range of SH periods the firmware
/// accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    /// STM32F401 Nucleo, 2 MHz master clock, 32-bit SH.
    #[default]
    Stm32F401,
    /// STM32F103 "blue pill", 800 kHz master clock, 16-bit SH.
    Stm32F103,
}

impl Firmware {
    pub fn clock_hz(self) -> u32 {
        match self {
            Firmware::Stm32F401 => 2_000_000,
            Firmware::Stm32F103 => 800_000,
        }
    }

    pub fn min_sh(self) -> u32 {
        match self {
            Firmware::Stm32F401 => 20,
            Firmware::Stm32F103 => 8,
        }
    }

    pub fn max_sh(self) -> u32 {
        match self {
            Firmware::Stm32F401 => u32::MAX,
            Firmware::Stm32F103 => u16::MAX as u32,
        }
    }
}

/// Immutable snapshot of everything one acquisition needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// SH period in master clock ticks.
    pub sh_period: u32,
    /// ICG period in master clock ticks, a multiple of `sh_period`.
    pub icg_period: u32,
    /// Master clock frequency, used only for duration estimates.
    pub clock_hz: u32,
    /// Smallest SH period the firmware accepts.
    pub min_sh: u32,
    /// Largest SH period the firmware accepts.
    pub max_sh: u32,
    pub mode: Mode,
    /// Total number of exposures combined into one output spectrum (1..=255).
    pub requested_average: u8,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self::for_firmware(Firmware::default())
    }
}

impl AcquisitionConfig {
    /// Default timing with the clock and SH limits of `firmware`.
    pub fn for_firmware(firmware: Firmware) -> Self {
        Self {
            sh_period: DEFAULT_SH_PERIOD,
            icg_period: DEFAULT_ICG_PERIOD,
            clock_hz: firmware.clock_hz(),
            min_sh: firmware.min_sh(),
            max_sh: firmware.max_sh(),
            mode: Mode::OneShot,
            requested_average: 1,
        }
    }

    pub fn with_timing(mut self, sh_period: u32, icg_period: u32) -> Self {
        self.sh_period = sh_period;
        self.icg_period = icg_period;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_average(mut self, requested_average: u8) -> Self {
        self.requested_average = requested_average;
        self
    }

    /// Derive SH/ICG from an exposure time.
    ///
    /// SH is the exposure in clock ticks, clamped to the firmware limits. ICG
    /// is the smallest multiple of SH that is at least [`MIN_ICG_PERIOD`].
    pub fn with_exposure(mut self, exposure: Duration) -> Self {
        let ticks = (exposure.as_secs_f64() * self.clock_hz as f64).round();
        let sh = if ticks >= self.max_sh as f64 {
            self.max_sh
        } else {
            (ticks as u32).max(self.min_sh).max(1)
        };
        // n * sh < sh + MIN_ICG_PERIOD, so this cannot overflow
        let n = MIN_ICG_PERIOD.div_ceil(sh).max(1);
        self.sh_period = sh;
        self.icg_period = n * sh;
        self
    }

    /// Integration time implied by the SH period.
    pub fn integration_time(&self) -> Duration {
        if self.clock_hz == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sh_period as f64 / self.clock_hz as f64)
    }

    /// Check the CCD pulse timing rules.
    ///
    /// # Errors
    /// Returns [`DriverError::InvalidTiming`] when SH is zero or outside the
    /// firmware range, ICG is not a multiple of SH, or ICG is shorter than the
    /// pixel readout.
    pub fn validate(&self) -> Result<()> {
        if self.sh_period == 0 {
            return Err(DriverError::InvalidTiming("SH period must be non-zero".into()));
        }
        if self.sh_period < self.min_sh {
            return Err(DriverError::InvalidTiming(format!(
                "SH period {} is below the firmware minimum {}",
                self.sh_period, self.min_sh
            )));
        }
        if self.sh_period > self.max_sh {
            return Err(DriverError::InvalidTiming(format!(
                "SH period {} exceeds the firmware maximum {}",
                self.sh_period, self.max_sh
            )));
        }
        if self.icg_period % self.sh_period != 0 {
            return Err(DriverError::InvalidTiming(format!(
                "ICG period {} is not a multiple of SH period {}",
                self.icg_period, self.sh_period
            )));
        }
        if self.icg_period < MIN_ICG_PERIOD {
            return Err(DriverError::InvalidTiming(format!(
                "ICG period {} is shorter than {MIN_ICG_PERIOD}",
                self.icg_period
            )));
        }
        Ok(())
    }
}

/// How to reach the firmware and how long the transport may wait on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// OS name of the port (e.g. `/dev/ttyACM0`, `COM5`).
    pub name: String,
    pub baud_rate: u32,
    /// Timeout of a single underlying read; also the cancellation latency.
    pub read_timeout: Duration,
    pub flush_poll: Duration,
    pub flush_attempts: u32,
    pub drain_poll: Duration,
    pub drain_attempts: u32,
    /// Added to the estimated frame duration to bound one `read_exact`.
    pub frame_slack: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            flush_poll: DEFAULT_FLUSH_POLL,
            flush_attempts: DEFAULT_FLUSH_ATTEMPTS,
            drain_poll: DEFAULT_DRAIN_POLL,
            drain_attempts: DEFAULT_DRAIN_ATTEMPTS,
            frame_slack: DEFAULT_FRAME_SLACK,
        }
    }
}

impl PortSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_firmware_startup_values() {
        let cfg = AcquisitionConfig::default();
        assert_eq!(cfg.sh_period, 200);
        assert_eq!(cfg.icg_period, 100_000);
        assert_eq!(cfg.clock_hz, 2_000_000);
        assert_eq!(cfg.mode, Mode::OneShot);
        assert_eq!(cfg.requested_average, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_icg_not_multiple_of_sh() {
        let cfg = AcquisitionConfig::default().with_timing(200, 100_001);
        assert!(matches!(cfg.validate(), Err(DriverError::InvalidTiming(_))));
    }

    #[test]
    fn rejects_short_icg_and_small_sh() {
        let short = AcquisitionConfig::default().with_timing(20, 14_760);
        assert!(matches!(short.validate(), Err(DriverError::InvalidTiming(_))));

        let small = AcquisitionConfig::default().with_timing(10, 15_000);
        assert!(matches!(small.validate(), Err(DriverError::InvalidTiming(_))));

        let zero = AcquisitionConfig::default().with_timing(0, 15_000);
        assert!(matches!(zero.validate(), Err(DriverError::InvalidTiming(_))));
    }

    #[test]
    fn f103_limits_sh_to_16_bits() {
        let cfg = AcquisitionConfig::for_firmware(Firmware::Stm32F103).with_timing(70_000, 70_000);
        assert!(matches!(cfg.validate(), Err(DriverError::InvalidTiming(_))));
        assert_eq!(cfg.clock_hz, 800_000);
    }

    #[test]
    fn exposure_picks_smallest_valid_icg() {
        // 10 ms at 2 MHz is 20000 ticks, already longer than the readout.
        let cfg = AcquisitionConfig::default().with_exposure(Duration::from_millis(10));
        assert_eq!(cfg.sh_period, 20_000);
        assert_eq!(cfg.icg_period, 20_000);
        assert!(cfg.validate().is_ok());

        // 100 us is 200 ticks, so ICG needs ceil(14776 / 200) = 74 periods.
        let cfg = AcquisitionConfig::default().with_exposure(Duration::from_micros(100));
        assert_eq!(cfg.sh_period, 200);
        assert_eq!(cfg.icg_period, 74 * 200);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn exposure_clamps_to_firmware_minimum() {
        let cfg = AcquisitionConfig::default().with_exposure(Duration::from_nanos(1));
        assert_eq!(cfg.sh_period, 20);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn exposure_clamps_to_firmware_maximum() {
        let cfg = AcquisitionConfig::for_firmware(Firmware::Stm32F103)
            .with_exposure(Duration::from_secs(10));
        assert_eq!(cfg.sh_period, 65_535);
        assert_eq!(cfg.icg_period, 65_535);
        assert!(cfg.validate().is_ok());

        let cfg = AcquisitionConfig::default().with_exposure(Duration::from_secs(3_600));
        assert_eq!(cfg.sh_period, u32::MAX);
        assert_eq!(cfg.icg_period, u32::MAX);
    }

    #[test]
    fn integration_time_uses_clock() {
        let cfg = AcquisitionConfig::default().with_timing(2_000, 20_000);
        assert_eq!(cfg.integration_time(), Duration::from_millis(1));
    }

    #[test]
    fn config_loads_from_toml() {
        let cfg: AcquisitionConfig =
            toml::from_str("sh_period = 400\nicg_period = 40000\nmode = \"continuous\"\n")
                .unwrap();
        assert_eq!(cfg.sh_period, 400);
        assert_eq!(cfg.icg_period, 40_000);
        assert_eq!(cfg.mode, Mode::Continuous);
        assert_eq!(cfg.clock_hz, 2_000_000);
    }
}
