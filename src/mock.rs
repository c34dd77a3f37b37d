//! Scripted firmware double for tests.
//!
//! Answers one-shot commands with one frame, streams frames while in
//! continuous mode and records everything written to it.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::config::PortSettings;
use crate::errors::Result;
use crate::protocol::{COMMAND_LEN, MARKER, PIXEL_COUNT};
use crate::transport::SerialLink;

/// What a read returns when no byte is queued.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Silence {
    /// Port timeout, as a live but idle device.
    TimedOut,
    /// Zero-length read, as a vanished device.
    Eof,
}

struct State {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    respond: bool,
    streaming: bool,
    frame_values: Vec<u16>,
    frames_served: usize,
    truncate_to: Option<usize>,
    frame_limit: Option<usize>,
    write_limit: Option<usize>,
    chunk: usize,
    silence: Silence,
    clears: usize,
    refill_on_clear: bool,
    closed: bool,
}

impl State {
    fn serve_frame(&mut self) {
        if self.frame_limit.is_some_and(|limit| self.frames_served >= limit) {
            return;
        }
        let value = self.frame_values[self.frames_served % self.frame_values.len()];
        self.frames_served += 1;
        let len = self.truncate_to.unwrap_or(PIXEL_COUNT * 2);
        let bytes = value.to_le_bytes();
        self.rx
            .extend((0..PIXEL_COUNT).flat_map(|_| bytes).take(len));
    }

    fn on_command(&mut self, cmd: &[u8]) {
        if !self.respond || cmd.len() != COMMAND_LEN || cmd[..2] != MARKER {
            return;
        }
        match cmd[10] {
            1 => {
                self.streaming = true;
                self.serve_frame();
            }
            _ if self.streaming => self.streaming = false,
            _ => self.serve_frame(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct MockFirmware {
    state: Arc<Mutex<State>>,
}

impl MockFirmware {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rx: VecDeque::new(),
                writes: Vec::new(),
                respond: false,
                streaming: false,
                frame_values: vec![1000],
                frames_served: 0,
                truncate_to: None,
                frame_limit: None,
                write_limit: None,
                chunk: usize::MAX,
                silence: Silence::TimedOut,
                clears: 0,
                refill_on_clear: false,
                closed: false,
            })),
        }
    }

    /// Answer commands with frames whose pixels all equal the next value.
    pub(crate) fn responding(values: &[u16]) -> Self {
        let firmware = Self::new();
        {
            let mut s = firmware.lock();
            s.respond = true;
            s.frame_values = values.to_vec();
        }
        firmware
    }

    pub(crate) fn with_chunk(self, chunk: usize) -> Self {
        self.lock().chunk = chunk;
        self
    }

    pub(crate) fn with_silence(self, silence: Silence) -> Self {
        self.lock().silence = silence;
        self
    }

    /// Serve only the first `len` bytes of every frame.
    pub(crate) fn with_truncated_frames(self, len: usize) -> Self {
        self.lock().truncate_to = Some(len);
        self
    }

    /// Stop answering after `limit` frames, as a device that went away.
    pub(crate) fn with_frame_limit(self, limit: usize) -> Self {
        self.lock().frame_limit = Some(limit);
        self
    }

    /// Accept `limit` writes, then fail every later one.
    pub(crate) fn with_write_limit(self, limit: usize) -> Self {
        self.lock().write_limit = Some(limit);
        self
    }

    pub(crate) fn settings() -> PortSettings {
        PortSettings {
            name: "mock".into(),
            read_timeout: Duration::from_millis(2),
            flush_poll: Duration::from_millis(1),
            flush_attempts: 5,
            drain_poll: Duration::from_millis(1),
            drain_attempts: 5,
            frame_slack: Duration::from_secs(2),
            ..PortSettings::default()
        }
    }

    pub(crate) fn link(&self) -> MockLink {
        MockLink {
            state: Arc::clone(&self.state),
        }
    }

    pub(crate) fn push_stale(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    pub(crate) fn refill_on_clear(&self, refill: bool) {
        self.lock().refill_on_clear = refill;
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().rx.len()
    }

    pub(crate) fn clears(&self) -> usize {
        self.lock().clears
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub(crate) fn frames_served(&self) -> usize {
        self.lock().frames_served
    }

    pub(crate) fn streaming(&self) -> bool {
        self.lock().streaming
    }

    pub(crate) fn closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

pub(crate) struct MockLink {
    state: Arc<Mutex<State>>,
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let silence = {
            let mut s = self.state.lock().unwrap();
            if s.rx.is_empty() && s.streaming {
                // one frame per integration period
                drop(s);
                thread::sleep(Duration::from_millis(1));
                s = self.state.lock().unwrap();
                if s.streaming {
                    s.serve_frame();
                }
            }
            if !s.rx.is_empty() {
                let n = buf.len().min(s.chunk).min(s.rx.len());
                for (dst, src) in buf.iter_mut().zip(s.rx.drain(..n)) {
                    *dst = src;
                }
                return Ok(n);
            }
            s.silence
        };
        match silence {
            Silence::Eof => Ok(0),
            Silence::TimedOut => {
                thread::sleep(Duration::from_millis(2));
                Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"))
            }
        }
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = self.state.lock().unwrap();
        if s.write_limit.is_some_and(|limit| s.writes.len() >= limit) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock port gone"));
        }
        s.writes.push(buf.to_vec());
        s.on_command(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialLink for MockLink {
    fn bytes_to_read(&self) -> Result<u32> {
        Ok(self.state.lock().unwrap().rx.len() as u32)
    }

    fn bytes_to_write(&self) -> Result<u32> {
        Ok(0)
    }

    fn clear_buffers(&self) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.rx.clear();
        s.clears += 1;
        if s.refill_on_clear {
            s.rx.push_back(0xAA);
        }
        Ok(())
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        if let Ok(mut s) = self.state.lock() {
            s.closed = true;
        }
    }
}
