//! Advisory progress for one-shot acquisitions.
//!
//! The firmware sends nothing until an acquisition is complete, so progress
//! is predicted from the timing parameters rather than measured. Ticks run on
//! their own thread and never gate or signal completion of the I/O.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::averaging::AveragingPlan;
use crate::transport::CancelToken;

/// Ticks in a full one-shot progress bar.
pub const PROGRESS_TICKS: u8 = 10;

const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// A progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Progress {
    /// Elapsed tenths of the predicted one-shot duration (0..=10).
    Tick(u8),
    /// Continuous mode: running, with no end to measure against.
    Indeterminate,
}

/// Predicted duration: `icg * hardware_average * software_iterations / clock`.
pub fn estimate_duration(
    icg_period: u32,
    hardware_average: u8,
    software_iterations: u32,
    clock_hz: u32,
) -> Duration {
    if clock_hz == 0 {
        return Duration::ZERO;
    }
    let ticks = icg_period as f64 * hardware_average as f64 * software_iterations as f64;
    Duration::from_secs_f64(ticks / clock_hz as f64)
}

/// Predicted duration of a whole acquisition following `plan`.
pub fn estimate_plan(icg_period: u32, plan: &AveragingPlan, clock_hz: u32) -> Duration {
    estimate_duration(
        icg_period,
        plan.hardware_average,
        plan.software_iterations,
        clock_hz,
    )
}

/// Background thread emitting [`Progress::Tick`] values.
pub struct ProgressTicker {
    stop: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTicker {
    /// Emit tick 0, then one tick per `total / 10` up to tick 10.
    pub fn spawn<F>(total: Duration, mut sink: F) -> io::Result<Self>
    where
        F: FnMut(Progress) + Send + 'static,
    {
        let stop = CancelToken::new();
        let observed = stop.clone();
        let step = total / PROGRESS_TICKS as u32;

        let handle = thread::Builder::new()
            .name("tcd1304-progress".into())
            .spawn(move || {
                sink(Progress::Tick(0));
                for tick in 1..=PROGRESS_TICKS {
                    if !sleep_unless_stopped(step, &observed) {
                        return;
                    }
                    sink(Progress::Tick(tick));
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop ticking and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Returns false if `stop` fired before `duration` elapsed.
fn sleep_unless_stopped(duration: Duration, stop: &CancelToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::averaging::plan_averaging;
    use std::sync::mpsc;

    #[test]
    fn duration_scales_with_averages() {
        // 100000 ticks at 2 MHz is 50 ms per exposure.
        assert_eq!(
            estimate_duration(100_000, 1, 1, 2_000_000),
            Duration::from_millis(50)
        );
        assert_eq!(
            estimate_plan(100_000, &plan_averaging(40), 2_000_000),
            Duration::from_millis(50 * 45)
        );
    }

    #[test]
    fn zero_clock_estimates_nothing() {
        assert_eq!(estimate_duration(100_000, 15, 3, 0), Duration::ZERO);
    }

    #[test]
    fn ticker_emits_all_ticks_in_order() {
        let (tx, rx) = mpsc::channel();
        let ticker = ProgressTicker::spawn(Duration::from_millis(20), move |p| {
            let _ = tx.send(p);
        })
        .unwrap();

        let ticks: Vec<Progress> = rx.iter().take(11).collect();
        ticker.stop();
        let expected: Vec<Progress> = (0..=PROGRESS_TICKS).map(Progress::Tick).collect();
        assert_eq!(ticks, expected);
    }

    #[test]
    fn stopped_ticker_goes_quiet() {
        let (tx, rx) = mpsc::channel();
        let ticker = ProgressTicker::spawn(Duration::from_secs(60), move |p| {
            let _ = tx.send(p);
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), Progress::Tick(0));
        ticker.stop();
        assert!(rx.iter().next().is_none());
    }
}
