// ============================================================================
// Python Bindings
// ============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use pyo3::exceptions::{PyConnectionError, PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::logging;
use crate::{
    transport, Acquisition, AcquisitionConfig, AcquisitionEvent, AcquisitionHandle, DriverError,
    Firmware, Mode, PortSettings, Progress, SessionOutcome, Spectrometer, DEFAULT_BAUD_RATE,
    MAX_HARDWARE_AVERAGE, PIXEL_COUNT,
};

fn to_py_err(e: DriverError) -> PyErr {
    match e {
        DriverError::InvalidTiming(msg) => PyValueError::new_err(msg),
        e @ DriverError::PortUnavailable { .. } => PyConnectionError::new_err(e.to_string()),
        e @ (DriverError::Truncated { .. } | DriverError::Io(_) | DriverError::Serial(_)) => {
            PyIOError::new_err(e.to_string())
        }
        e => PyRuntimeError::new_err(e.to_string()),
    }
}

fn parse_firmware(name: &str) -> PyResult<Firmware> {
    match name.to_ascii_lowercase().as_str() {
        "stm32f401" => Ok(Firmware::Stm32F401),
        "stm32f103" => Ok(Firmware::Stm32F103),
        other => Err(PyValueError::new_err(format!(
            "Unknown firmware '{other}'. Supported: stm32f401, stm32f103."
        ))),
    }
}

/// One spectrum with the timing it was acquired with.
///
/// Attributes:
///     samples: 3694 pixel values in readout order.
///     sh_period: SH period actually sent to the firmware.
///     icg_period: ICG period actually sent to the firmware.
///     hardware_average: Exposures averaged by the firmware.
///     software_iterations: Hardware acquisitions averaged on the host.
#[pyclass(name = "Spectrum", frozen)]
#[derive(Clone)]
struct PySpectrum {
    #[pyo3(get)]
    samples: Vec<u16>,
    #[pyo3(get)]
    sh_period: u32,
    #[pyo3(get)]
    icg_period: u32,
    #[pyo3(get)]
    hardware_average: u8,
    #[pyo3(get)]
    software_iterations: u32,
}

#[pymethods]
impl PySpectrum {
    fn __repr__(&self) -> String {
        format!(
            "Spectrum(sh={}, icg={}, avg={}x{})",
            self.sh_period, self.icg_period, self.hardware_average, self.software_iterations
        )
    }

    fn __len__(&self) -> usize {
        self.samples.len()
    }

    /// Convert to dictionary for easy serialization.
    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        dict.set_item("samples", self.samples.clone())?;
        dict.set_item("sh_period", self.sh_period)?;
        dict.set_item("icg_period", self.icg_period)?;
        dict.set_item("hardware_average", self.hardware_average)?;
        dict.set_item("software_iterations", self.software_iterations)?;
        Ok(dict)
    }
}

impl From<Acquisition> for PySpectrum {
    fn from(acq: Acquisition) -> Self {
        PySpectrum {
            samples: acq.samples.into_vec(),
            sh_period: acq.sent.sh_period,
            icg_period: acq.sent.icg_period,
            hardware_average: acq.plan.hardware_average,
            software_iterations: acq.plan.software_iterations,
        }
    }
}

/// TCD1304 spectrometer on a serial port.
///
/// Example:
///     >>> ccd = Spectrometer("/dev/ttyACM0")
///     >>> spectrum = ccd.collect(sh_period=200, icg_period=100000, average=40)
///     >>> ccd.start(200, 100000, continuous=True)
///     >>> frame = ccd.next_frame(timeout=1.0)
///     >>> ccd.stop()
#[pyclass(name = "Spectrometer", unsendable)]
struct PySpectrometer {
    inner: Spectrometer,
    firmware: Firmware,
    handle: Option<AcquisitionHandle>,
    frames: VecDeque<PySpectrum>,
    progress: Option<u8>,
}

impl PySpectrometer {
    fn config(&self, sh_period: u32, icg_period: u32, average: u8, mode: Mode) -> AcquisitionConfig {
        AcquisitionConfig::for_firmware(self.firmware)
            .with_timing(sh_period, icg_period)
            .with_average(average)
            .with_mode(mode)
    }

    /// Drop a handle with the GIL released; the worker may need it to log.
    fn release(py: Python<'_>, handle: AcquisitionHandle) {
        py.detach(move || drop(handle));
    }

    fn absorb(&mut self, event: AcquisitionEvent) {
        match event {
            AcquisitionEvent::Progress(Progress::Tick(t)) => self.progress = Some(t),
            AcquisitionEvent::Progress(Progress::Indeterminate) => self.progress = None,
            AcquisitionEvent::Frame(acq) => self.frames.push_back(acq.into()),
            AcquisitionEvent::StateChanged(_) => {}
        }
    }
}

#[pymethods]
impl PySpectrometer {
    /// Args:
    ///     port: Serial port name (e.g., "/dev/ttyACM0" or "COM5").
    ///     baudrate: Serial baud rate. Default: 115200.
    ///     firmware: "stm32f401" (2 MHz clock) or "stm32f103" (800 kHz clock).
    #[new]
    #[pyo3(signature = (port, baudrate=DEFAULT_BAUD_RATE, firmware="stm32f401"))]
    fn new(port: &str, baudrate: u32, firmware: &str) -> PyResult<Self> {
        Ok(PySpectrometer {
            inner: Spectrometer::new(PortSettings::new(port).with_baud_rate(baudrate)),
            firmware: parse_firmware(firmware)?,
            handle: None,
            frames: VecDeque::new(),
            progress: None,
        })
    }

    /// List serial ports present on this machine.
    #[staticmethod]
    fn list_ports() -> PyResult<Vec<String>> {
        transport::available_ports().map_err(to_py_err)
    }

    /// Check that the port can be opened.
    fn probe(&self) -> PyResult<()> {
        transport::probe(self.inner.port()).map_err(to_py_err)
    }

    /// Acquire one spectrum, blocking until it is complete.
    ///
    /// Averages above 15 are split into several hardware acquisitions.
    ///
    /// Returns:
    ///     Spectrum, or None if the acquisition was cancelled.
    #[pyo3(signature = (sh_period, icg_period, average=1))]
    fn collect(
        &mut self,
        py: Python<'_>,
        sh_period: u32,
        icg_period: u32,
        average: u8,
    ) -> PyResult<Option<PySpectrum>> {
        let config = self.config(sh_period, icg_period, average, Mode::OneShot);
        let inner = &self.inner;
        let outcome = py.detach(|| inner.collect(config)).map_err(to_py_err)?;
        Ok(outcome.into_acquisition().map(PySpectrum::from))
    }

    /// Start an acquisition in the background.
    ///
    /// Use `poll()` for progress, `wait()` for a one-shot result and
    /// `next_frame()` for continuous frames.
    #[pyo3(signature = (sh_period, icg_period, average=1, continuous=false))]
    fn start(
        &mut self,
        py: Python<'_>,
        sh_period: u32,
        icg_period: u32,
        average: u8,
        continuous: bool,
    ) -> PyResult<()> {
        let mode = if continuous { Mode::Continuous } else { Mode::OneShot };
        let config = self.config(sh_period, icg_period, average, mode);
        let handle = self.inner.acquire(config).map_err(to_py_err)?;
        if let Some(finished) = self.handle.take() {
            Self::release(py, finished);
        }
        self.frames.clear();
        self.progress = Some(0);
        self.handle = Some(handle);
        Ok(())
    }

    /// Process pending events and return progress (0-10), or None in continuous mode.
    fn poll(&mut self) -> Option<u8> {
        let events: Vec<AcquisitionEvent> = match &self.handle {
            Some(handle) => std::iter::from_fn(|| handle.try_event()).collect(),
            None => Vec::new(),
        };
        for event in events {
            self.absorb(event);
        }
        self.progress
    }

    /// Next continuous-mode spectrum, or None after `timeout` seconds.
    #[pyo3(signature = (timeout=1.0))]
    fn next_frame(&mut self, py: Python<'_>, timeout: f64) -> Option<PySpectrum> {
        let deadline = Instant::now() + Duration::from_secs_f64(timeout.max(0.0));
        loop {
            if let Some(frame) = self.frames.pop_front() {
                return Some(frame);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let handle = self.handle.take()?;
            let (handle, event) = py.detach(move || {
                let event = handle.next_event(remaining);
                (handle, event)
            });
            self.handle = Some(handle);
            self.absorb(event?);
        }
    }

    /// Wait for the running acquisition to end.
    ///
    /// Returns:
    ///     Spectrum for a completed one-shot acquisition, None otherwise.
    fn wait(&mut self, py: Python<'_>) -> PyResult<Option<PySpectrum>> {
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        match py.detach(move || handle.wait()).map_err(to_py_err)? {
            SessionOutcome::Completed(acq) => Ok(Some(acq.into())),
            SessionOutcome::Cancelled => Ok(None),
        }
    }

    /// Cancel the running acquisition and wait for the port to close.
    fn stop(&mut self, py: Python<'_>) -> PyResult<()> {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
        self.wait(py).map(|_| ())
    }

    /// True while an acquisition is running.
    #[getter]
    fn busy(&self) -> bool {
        self.inner.is_busy()
    }

    fn __repr__(&self) -> String {
        format!(
            "Spectrometer(port={}, baud={})",
            self.inner.port().name,
            self.inner.port().baud_rate
        )
    }
}

impl Drop for PySpectrometer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
            Python::attach(|py| Self::release(py, handle));
        }
    }
}

/// Route Rust log records to Python's `logging` module.
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<&str>) -> PyResult<()> {
    match level {
        Some(name) => {
            let level = name
                .parse::<log::LevelFilter>()
                .map_err(|_| PyValueError::new_err(format!("Invalid log level '{name}'")))?;
            logging::set_python_log_level(level);
        }
        None => logging::init_python_logging(),
    }
    Ok(())
}

/// The Python module definition
#[pymodule]
#[pyo3(name = "_core")]
fn core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PySpectrometer>()?;
    m.add_class::<PySpectrum>()?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;

    m.add("PIXEL_COUNT", PIXEL_COUNT)?;
    m.add("MAX_HARDWARE_AVERAGE", MAX_HARDWARE_AVERAGE)?;
    m.add("DEFAULT_BAUD_RATE", DEFAULT_BAUD_RATE)?;

    Ok(())
}
