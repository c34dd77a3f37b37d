//! Acquisition sessions.
//!
//! A session owns the transport for its whole life and runs one acquisition
//! through an explicit state machine:
//!
//! ```text
//! Idle -> Sending -> Reading -(software iterations)-> Averaging -> Completed
//!            |          |
//!            +----------+--> Cancelled / Failed
//! ```
//!
//! Sessions normally run on their own worker thread ([`AcquisitionSession::spawn`]).
//! The caller keeps an [`AcquisitionHandle`] to receive events and request
//! cancellation; the worker never reads caller state after it starts.
//!
//! # Cancellation
//!
//! - **One-shot**: the in-flight read is aborted, partial sums are discarded
//!   and no buffer is produced.
//! - **Continuous**: the current read is allowed to finish, then a stop frame
//!   (the same command with the mode flag cleared) is written so the firmware
//!   stops streaming before the port closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::averaging::{plan_averaging, Accumulator, AveragingPlan};
use crate::config::{AcquisitionConfig, Mode, PortSettings};
use crate::errors::{DriverError, Result};
use crate::progress::{estimate_duration, estimate_plan, Progress, ProgressTicker};
use crate::protocol::{decode_raw_frame, CommandFrame, SampleBuffer, SentTiming, RAW_FRAME_LEN};
use crate::transport::{CancelToken, Transport};

// ============================================================================
// Data Types
// ============================================================================

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    /// Flushing and writing the command for software iteration `iteration`.
    Sending { iteration: u32 },
    /// Waiting for the raw frame of `iteration`.
    Reading { iteration: u32 },
    Averaging,
    Completed,
    Cancelled,
    Failed,
}

/// A finished spectrum, labelled with what was actually sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acquisition {
    pub samples: SampleBuffer,
    pub sent: SentTiming,
    pub plan: AveragingPlan,
    pub mode: Mode,
}

/// Non-failure end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed(Acquisition),
    Cancelled,
}

impl SessionOutcome {
    pub fn into_acquisition(self) -> Option<Acquisition> {
        match self {
            SessionOutcome::Completed(acq) => Some(acq),
            SessionOutcome::Cancelled => None,
        }
    }
}

/// Published by the worker while a session runs.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquisitionEvent {
    StateChanged(SessionState),
    Progress(Progress),
    /// One continuous-mode spectrum.
    Frame(Acquisition),
}

// ============================================================================
// Session
// ============================================================================

pub struct AcquisitionSession {
    config: AcquisitionConfig,
    plan: AveragingPlan,
    transport: Transport,
    cancel: CancelToken,
    events: Option<Sender<AcquisitionEvent>>,
    state: SessionState,
}

impl AcquisitionSession {
    /// Prepare a session on an open transport.
    ///
    /// # Errors
    /// [`DriverError::InvalidTiming`] if `config` breaks the CCD timing rules.
    /// Nothing is written in that case and the transport is closed.
    pub fn new(config: AcquisitionConfig, transport: Transport) -> Result<Self> {
        config.validate()?;

        let mut plan = plan_averaging(config.requested_average);
        if config.mode == Mode::Continuous && plan.software_iterations > 1 {
            warn!(
                "continuous mode only averages in hardware: requested={}, used={}",
                config.requested_average, plan.hardware_average
            );
            plan.software_iterations = 1;
        }

        Ok(Self {
            config,
            plan,
            transport,
            cancel: CancelToken::new(),
            events: None,
            state: SessionState::Idle,
        })
    }

    pub fn plan(&self) -> AveragingPlan {
        self.plan
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Receive this session's events. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> Receiver<AcquisitionEvent> {
        let (tx, rx) = mpsc::channel();
        self.events = Some(tx);
        rx
    }

    /// Run to the end on the current thread. The port is closed on return.
    pub fn run(mut self) -> Result<SessionOutcome> {
        info!(
            "acquisition started: mode={:?}, sh={}, icg={}, hw_avg={}, sw_iter={}",
            self.config.mode,
            self.config.sh_period,
            self.config.icg_period,
            self.plan.hardware_average,
            self.plan.software_iterations
        );

        let frame = CommandFrame::encode(&self.config, &self.plan);
        let result = match self.config.mode {
            Mode::OneShot => self.run_one_shot(frame),
            Mode::Continuous => self.run_continuous(frame),
        };

        let AcquisitionSession {
            transport,
            events,
            state,
            ..
        } = self;
        transport.close();

        let (terminal, result) = match result {
            Ok(acq) => (SessionState::Completed, Ok(SessionOutcome::Completed(acq))),
            Err(DriverError::Cancelled) => (SessionState::Cancelled, Ok(SessionOutcome::Cancelled)),
            Err(e) => (SessionState::Failed, Err(e)),
        };
        debug!("session state: {:?} -> {:?}", state, terminal);
        if let Some(tx) = events {
            let _ = tx.send(AcquisitionEvent::StateChanged(terminal));
        }

        match &result {
            Ok(SessionOutcome::Completed(_)) => info!("acquisition completed"),
            Ok(SessionOutcome::Cancelled) => info!("acquisition cancelled"),
            Err(e) => warn!("acquisition failed: {e}"),
        }
        result
    }

    /// Run on a dedicated worker thread.
    pub fn spawn(self) -> Result<AcquisitionHandle> {
        self.spawn_guarded(None)
    }

    fn spawn_guarded(mut self, guard: Option<ActiveGuard>) -> Result<AcquisitionHandle> {
        let events = self.subscribe();
        let cancel = self.cancel_token();
        let worker = thread::Builder::new()
            .name("tcd1304-acq".into())
            .spawn(move || {
                let _guard = guard;
                self.run()
            })?;
        Ok(AcquisitionHandle {
            cancel,
            events,
            worker: Some(worker),
        })
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    fn run_one_shot(&mut self, frame: CommandFrame) -> Result<Acquisition> {
        let deadline = self.read_deadline();
        let _ticker = self.spawn_ticker();

        let mut acc = Accumulator::new();
        for iteration in 0..self.plan.software_iterations {
            self.check_cancelled()?;

            // each iteration is a full exchange: flush, write, read
            self.transition(SessionState::Sending { iteration });
            self.transport.flush_stale_buffers()?;
            self.transport.write(&frame)?;

            self.transition(SessionState::Reading { iteration });
            let raw = self
                .transport
                .read_exact(RAW_FRAME_LEN, Some(&self.cancel), deadline)?;
            acc = acc.fold(&decode_raw_frame(&raw)?);
        }
        self.check_cancelled()?;

        self.transition(SessionState::Averaging);
        let samples = acc.finish(self.plan.software_iterations);

        Ok(Acquisition {
            samples,
            sent: frame.sent_timing(),
            plan: self.plan,
            mode: Mode::OneShot,
        })
    }

    fn run_continuous(&mut self, frame: CommandFrame) -> Result<Acquisition> {
        let deadline = self.read_deadline();
        self.emit(AcquisitionEvent::Progress(Progress::Indeterminate));

        self.transition(SessionState::Sending { iteration: 0 });
        self.transport.flush_stale_buffers()?;
        self.transport.write(&frame)?;

        let stop = frame.with_mode(Mode::OneShot);
        if let Err(e) = self.stream(&frame, deadline) {
            warn!("stream aborted, sending stop frame: {e}");
            if let Err(stop_err) = self.transport.write(&stop) {
                warn!("stop frame not sent, firmware may still be streaming: {stop_err}");
            }
            return Err(e);
        }

        self.transition(SessionState::Sending { iteration: 0 });
        self.transport.write(&stop)?;
        self.transport.wait_for_drain()?;
        Err(DriverError::Cancelled)
    }

    /// Publish frames until cancelled. Never aborts a read half-way.
    fn stream(&mut self, frame: &CommandFrame, deadline: Duration) -> Result<()> {
        let mut iteration = 0u32;
        while !self.cancel.is_cancelled() {
            self.transition(SessionState::Reading { iteration });
            let raw = self.transport.read_exact(RAW_FRAME_LEN, None, deadline)?;
            if self.cancel.is_cancelled() {
                break;
            }
            let samples = decode_raw_frame(&raw)?;
            self.emit(AcquisitionEvent::Frame(Acquisition {
                samples,
                sent: frame.sent_timing(),
                plan: self.plan,
                mode: Mode::Continuous,
            }));
            iteration = iteration.wrapping_add(1);
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        Ok(())
    }

    /// Bound on one raw frame: twice its predicted duration plus slack.
    fn read_deadline(&self) -> Duration {
        let frame = estimate_duration(
            self.config.icg_period,
            self.plan.hardware_average,
            1,
            self.config.clock_hz,
        );
        frame * 2 + self.transport.settings().frame_slack
    }

    fn spawn_ticker(&self) -> Option<ProgressTicker> {
        let tx = self.events.clone()?;
        let total = estimate_plan(self.config.icg_period, &self.plan, self.config.clock_hz);
        match ProgressTicker::spawn(total, move |p| {
            let _ = tx.send(AcquisitionEvent::Progress(p));
        }) {
            Ok(ticker) => Some(ticker),
            Err(e) => {
                warn!("progress ticker unavailable: {e}");
                None
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session state: {:?} -> {:?}", self.state, next);
        self.state = next;
        self.emit(AcquisitionEvent::StateChanged(next));
    }

    fn emit(&self, event: AcquisitionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Caller side of a session running on its worker thread.
///
/// Dropping the handle cancels the session and waits for the worker.
pub struct AcquisitionHandle {
    cancel: CancelToken,
    events: Receiver<AcquisitionEvent>,
    worker: Option<JoinHandle<Result<SessionOutcome>>>,
}

impl AcquisitionHandle {
    /// Request cancellation; returns immediately.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &Receiver<AcquisitionEvent> {
        &self.events
    }

    /// Next event if one is queued.
    pub fn try_event(&self) -> Option<AcquisitionEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next event. `None` on timeout or once the
    /// worker has exited and every event was consumed.
    pub fn next_event(&self, timeout: Duration) -> Option<AcquisitionEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Block until the session ends.
    pub fn wait(mut self) -> Result<SessionOutcome> {
        self.join()
    }

    fn join(&mut self) -> Result<SessionOutcome> {
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| DriverError::WorkerPanicked)?,
            None => Ok(SessionOutcome::Cancelled),
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel();
            let _ = self.join();
        }
    }
}

// ============================================================================
// Spectrometer
// ============================================================================

/// Marks the single active session; released when the worker exits.
struct ActiveGuard(Arc<AtomicBool>);

impl ActiveGuard {
    fn claim(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DriverError::Busy)?;
        Ok(Self(Arc::clone(flag)))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Entry point for one CCD device: opens the port per acquisition and allows
/// at most one session at a time.
///
/// # Example
/// ```ignore
/// let ccd = Spectrometer::new(PortSettings::new("/dev/ttyACM0"));
/// let config = AcquisitionConfig::default().with_average(40);
/// if let Some(acq) = ccd.collect(config)?.into_acquisition() {
///     println!("{} pixels, SH={}", acq.samples.len(), acq.sent.sh_period);
/// }
/// ```
pub struct Spectrometer {
    port: PortSettings,
    active: Arc<AtomicBool>,
}

impl Spectrometer {
    pub fn new(port: PortSettings) -> Self {
        Self {
            port,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn port(&self) -> &PortSettings {
        &self.port
    }

    /// Whether a session started here is still running.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Validate `config`, open the port and start a session in the background.
    ///
    /// # Errors
    /// - [`DriverError::InvalidTiming`] before the port is touched.
    /// - [`DriverError::Busy`] if another session is active.
    /// - [`DriverError::PortUnavailable`] if the port cannot be opened.
    pub fn acquire(&self, config: AcquisitionConfig) -> Result<AcquisitionHandle> {
        config.validate()?;
        let guard = ActiveGuard::claim(&self.active)?;
        let transport = Transport::open(&self.port)?;
        AcquisitionSession::new(config, transport)?.spawn_guarded(Some(guard))
    }

    /// Like [`Spectrometer::acquire`] on an already-open transport.
    pub fn acquire_on(
        &self,
        config: AcquisitionConfig,
        transport: Transport,
    ) -> Result<AcquisitionHandle> {
        config.validate()?;
        let guard = ActiveGuard::claim(&self.active)?;
        AcquisitionSession::new(config, transport)?.spawn_guarded(Some(guard))
    }

    /// One-shot acquisition, blocking until it ends.
    pub fn collect(&self, config: AcquisitionConfig) -> Result<SessionOutcome> {
        self.acquire(config.with_mode(Mode::OneShot))?.wait()
    }
}
