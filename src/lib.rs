//! TCD1304 linear CCD driver with optional Python bindings.
//!
//! The sensor is read through a microcontroller running the open CCD
//! firmware over a serial link. This crate implements the host side of that
//! protocol: it frames the 12-byte command, splits large averages between the
//! firmware and the host, runs acquisitions on a worker thread and supports
//! safe cancellation in one-shot and continuous modes.
//!
//! # Example
//! ```ignore
//! use tcd1304_rs::{AcquisitionConfig, PortSettings, Spectrometer};
//!
//! let ccd = Spectrometer::new(PortSettings::new("/dev/ttyACM0"));
//! let handle = ccd.acquire(AcquisitionConfig::default().with_average(40))?;
//! let outcome = handle.wait()?;
//! ```
//!
//! # Timing labels
//!
//! Results carry the SH/ICG periods decoded from the command that was
//! actually written, never the caller's current settings.

mod averaging;
mod config;
mod errors;
pub mod logging;
#[cfg(test)]
mod mock;
mod progress;
mod protocol;
mod session;
pub mod transport;

pub use averaging::{plan_averaging, Accumulator, AveragingPlan};
pub use config::{
    AcquisitionConfig, Firmware, Mode, PortSettings, DEFAULT_BAUD_RATE, MIN_ICG_PERIOD,
};
pub use errors::*;
pub use progress::{estimate_duration, estimate_plan, Progress, ProgressTicker, PROGRESS_TICKS};
pub use protocol::{
    decode_raw_frame, CommandFrame, SampleBuffer, SentTiming, COMMAND_LEN, MARKER,
    MAX_HARDWARE_AVERAGE, PIXEL_COUNT, RAW_FRAME_LEN,
};
pub use session::{
    Acquisition, AcquisitionEvent, AcquisitionHandle, AcquisitionSession, SessionOutcome,
    SessionState, Spectrometer,
};
pub use transport::{CancelToken, SerialLink, Transport};

#[cfg(feature = "python")]
mod python;
