//! Serial transport to the CCD firmware.
//!
//! The firmware protocol has no resynchronisation beyond the `ER` prefix, so
//! any stale byte left in a queue from an aborted exchange shifts every later
//! frame. [`Transport::flush_stale_buffers`] must run before each command.
//!
//! Blocking calls are bounded: reads poll the port with a short timeout so a
//! [`CancelToken`] is observed within one `read_timeout`, and every read
//! carries a deadline after which it fails as [`DriverError::Truncated`].

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serialport::{ClearBuffer, SerialPort};

use crate::config::PortSettings;
use crate::errors::{DriverError, Result};
use crate::protocol::CommandFrame;

// ============================================================================
// Link Abstraction
// ============================================================================

/// Byte link to the firmware: a serial port, or a test double.
pub trait SerialLink: Read + Write + Send {
    /// Bytes waiting in the input queue.
    fn bytes_to_read(&self) -> Result<u32>;
    /// Bytes not yet sent from the output queue.
    fn bytes_to_write(&self) -> Result<u32>;
    /// Discard both queues.
    fn clear_buffers(&self) -> Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> Result<u32> {
        Ok((**self).bytes_to_read()?)
    }

    fn bytes_to_write(&self) -> Result<u32> {
        Ok((**self).bytes_to_write()?)
    }

    fn clear_buffers(&self) -> Result<()> {
        Ok((**self).clear(ClearBuffer::All)?)
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cancel flag, the only state crossed between caller and worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Exclusive owner of one open link. Dropping it closes the port.
pub struct Transport {
    link: Box<dyn SerialLink>,
    settings: PortSettings,
}

impl Transport {
    /// Open the serial port named in `settings`.
    ///
    /// # Errors
    /// [`DriverError::PortUnavailable`] if the port is missing, not permitted
    /// or already in use.
    pub fn open(settings: &PortSettings) -> Result<Self> {
        let port = serialport::new(&settings.name, settings.baud_rate)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| DriverError::PortUnavailable {
                port: settings.name.clone(),
                reason: e.to_string(),
            })?;
        debug!(
            "opened serial port: name={}, baud={}",
            settings.name, settings.baud_rate
        );
        Ok(Self::from_link(Box::new(port), settings.clone()))
    }

    /// Wrap an already-open link.
    pub fn from_link(link: Box<dyn SerialLink>, settings: PortSettings) -> Self {
        Self { link, settings }
    }

    pub fn settings(&self) -> &PortSettings {
        &self.settings
    }

    /// Discard stale bytes until the input queue stays empty.
    ///
    /// # Errors
    /// [`DriverError::PortUnavailable`] if the queue is still not empty after
    /// `flush_attempts` clears.
    pub fn flush_stale_buffers(&mut self) -> Result<()> {
        for attempt in 0..self.settings.flush_attempts {
            let pending = self.link.bytes_to_read()?;
            if pending == 0 {
                return Ok(());
            }
            debug!("flushing stale bytes: pending={}, attempt={}", pending, attempt);
            self.link.clear_buffers()?;
            thread::sleep(self.settings.flush_poll);
        }
        if self.link.bytes_to_read()? == 0 {
            return Ok(());
        }
        Err(DriverError::PortUnavailable {
            port: self.settings.name.clone(),
            reason: format!(
                "input queue not empty after {} flush attempts",
                self.settings.flush_attempts
            ),
        })
    }

    /// Send a command frame in one write.
    ///
    /// The firmware misbehaves if the 12 bytes arrive in separate writes.
    pub fn write(&mut self, frame: &CommandFrame) -> Result<()> {
        debug!("tx command: {:02X?}", frame.as_bytes());
        self.link.write_all(frame.as_bytes())?;
        self.link.flush()?;
        Ok(())
    }

    /// Block until exactly `n` bytes are read.
    ///
    /// With `cancel` set, the token is checked between underlying reads and a
    /// cancel request aborts the read. Without it, the read always runs to
    /// completion or failure.
    ///
    /// # Errors
    /// - [`DriverError::Cancelled`] if `cancel` fired.
    /// - [`DriverError::Truncated`] if the link closed or `deadline` passed
    ///   before `n` bytes arrived.
    pub fn read_exact(
        &mut self,
        n: usize,
        cancel: Option<&CancelToken>,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        let started = Instant::now();
        let mut buf = vec![0u8; n];
        let mut filled = 0usize;

        while filled < n {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                debug!("read cancelled: received={}/{}", filled, n);
                return Err(DriverError::Cancelled);
            }

            match self.link.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(DriverError::Truncated {
                        expected: n,
                        received: filled,
                    })
                }
                Ok(k) => filled += k,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }

            if filled < n && started.elapsed() > deadline {
                warn!(
                    "read deadline of {:?} passed: received={}/{}",
                    deadline, filled, n
                );
                return Err(DriverError::Truncated {
                    expected: n,
                    received: filled,
                });
            }
        }

        Ok(buf)
    }

    /// Wait until the output queue has been sent.
    pub fn wait_for_drain(&mut self) -> Result<()> {
        for _ in 0..self.settings.drain_attempts {
            if self.link.bytes_to_write()? == 0 {
                return Ok(());
            }
            thread::sleep(self.settings.drain_poll);
        }
        if self.link.bytes_to_write()? == 0 {
            return Ok(());
        }
        Err(DriverError::PortUnavailable {
            port: self.settings.name.clone(),
            reason: "output queue did not drain".into(),
        })
    }

    /// Close the port.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        debug!("closing serial port: name={}", self.settings.name);
    }
}

// ============================================================================
// Port discovery
// ============================================================================

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

/// Check that a port can be opened, then close it again.
pub fn probe(settings: &PortSettings) -> Result<()> {
    Transport::open(settings).map(Transport::close)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::averaging::plan_averaging;
    use crate::config::AcquisitionConfig;
    use crate::mock::{MockFirmware, Silence};

    fn transport(firmware: &MockFirmware) -> Transport {
        Transport::from_link(Box::new(firmware.link()), MockFirmware::settings())
    }

    #[test]
    fn flush_discards_stale_bytes() {
        let firmware = MockFirmware::new();
        firmware.push_stale(&[1, 2, 3]);
        let mut t = transport(&firmware);
        t.flush_stale_buffers().unwrap();
        assert_eq!(firmware.pending(), 0);
        assert!(firmware.clears() >= 1);
    }

    #[test]
    fn last_flush_attempt_counts() {
        let firmware = MockFirmware::new();
        firmware.push_stale(&[1, 2, 3]);
        let mut settings = MockFirmware::settings();
        settings.flush_attempts = 1;
        let mut t = Transport::from_link(Box::new(firmware.link()), settings);
        t.flush_stale_buffers().unwrap();
        assert_eq!(firmware.pending(), 0);
        assert_eq!(firmware.clears(), 1);
    }

    #[test]
    fn no_flush_attempts_only_checks_the_queue() {
        let firmware = MockFirmware::new();
        let mut settings = MockFirmware::settings();
        settings.flush_attempts = 0;
        let mut t = Transport::from_link(Box::new(firmware.link()), settings);
        t.flush_stale_buffers().unwrap();

        firmware.push_stale(&[1, 2, 3]);
        let err = t.flush_stale_buffers().unwrap_err();
        assert!(matches!(err, DriverError::PortUnavailable { .. }));
        assert_eq!(firmware.clears(), 0);
    }

    #[test]
    fn flush_gives_up_when_queue_keeps_filling() {
        let firmware = MockFirmware::new();
        firmware.refill_on_clear(true);
        firmware.push_stale(&[0xAA]);
        let mut t = transport(&firmware);
        let err = t.flush_stale_buffers().unwrap_err();
        assert!(matches!(err, DriverError::PortUnavailable { .. }));
    }

    #[test]
    fn write_sends_whole_frame_at_once() {
        let firmware = MockFirmware::new();
        let mut t = transport(&firmware);
        let frame = CommandFrame::encode(&AcquisitionConfig::default(), &plan_averaging(1));
        t.write(&frame).unwrap();
        assert_eq!(firmware.writes(), vec![frame.as_bytes().to_vec()]);
    }

    #[test]
    fn drain_returns_once_output_is_empty() {
        let firmware = MockFirmware::new();
        let mut t = transport(&firmware);
        t.wait_for_drain().unwrap();
    }

    #[test]
    fn probe_reports_missing_port() {
        let settings = PortSettings::new("/dev/tcd1304-does-not-exist");
        let err = probe(&settings).unwrap_err();
        assert!(matches!(err, DriverError::PortUnavailable { .. }));
    }

    #[test]
    fn read_exact_collects_partial_reads() {
        let firmware = MockFirmware::new().with_chunk(1000);
        firmware.push_stale(&[7u8; 2500]);
        let mut t = transport(&firmware);
        let bytes = t.read_exact(2500, None, Duration::from_secs(1)).unwrap();
        assert_eq!(bytes.len(), 2500);
        assert!(bytes.iter().all(|&b| b == 7));
    }

    #[test]
    fn read_exact_reports_truncation_on_close() {
        let firmware = MockFirmware::new().with_silence(Silence::Eof);
        firmware.push_stale(&[1u8; 10]);
        let mut t = transport(&firmware);
        let err = t.read_exact(20, None, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(
            err,
            DriverError::Truncated {
                expected: 20,
                received: 10
            }
        ));
    }

    #[test]
    fn read_exact_is_bounded_by_deadline() {
        let firmware = MockFirmware::new();
        let mut t = transport(&firmware);
        let err = t
            .read_exact(4, None, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, DriverError::Truncated { received: 0, .. }));
    }

    #[test]
    fn read_exact_observes_cancel() {
        let firmware = MockFirmware::new();
        let mut t = transport(&firmware);
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let err = t
            .read_exact(4, Some(&token), Duration::from_secs(5))
            .unwrap_err();
        canceller.join().unwrap();
        assert!(err.is_cancelled());
    }

    #[test]
    fn dropping_transport_closes_link() {
        let firmware = MockFirmware::new();
        let t = transport(&firmware);
        assert!(!firmware.closed());
        t.close();
        assert!(firmware.closed());
    }
}
