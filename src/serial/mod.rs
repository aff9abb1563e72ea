//! # Serial Bus Ownership
//!
//! The pump controller hangs off a local RS-232/RS-485 bus. Exactly one
//! worker (the ingestion loop) owns the bus at runtime, so no locking is
//! needed; everything else that wants bus access sends the ingestion worker a
//! control message instead.
//!
//! [`SerialBus`] is the seam: production uses [`SerialLink`] over the
//! `serialport` crate, tests and the smoketest harness use [`MemoryBus`].
//! The bus is trusted and local; there is no authentication layer here.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::logutil::hex_snippet;

/// Byte-level access to the controller link.
///
/// Reads are non-blocking at the poll level: callers check
/// [`SerialBus::bytes_available`] first and only then pull bytes, so a silent
/// controller never stalls the poll loop.
pub trait SerialBus: Send {
    /// Bytes currently buffered by the driver.
    fn bytes_available(&mut self) -> Result<usize>;

    /// Read whatever is buffered into `buf`; returns the byte count.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write a whole command frame to the controller.
    fn write_frame(&mut self, frame: &[u8]) -> Result<()>;
}

/// Production serial link over `serialport`.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialLink {
    /// Open the device with an 8N1 framing and a short driver timeout; the
    /// poll loop supplies its own pacing.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()
            .with_context(|| format!("cannot open serial port {}", path))?;
        info!("Serial link open on {} @ {} baud", path, baud_rate);
        Ok(Self { port })
    }
}

impl SerialBus for SerialLink {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pending = self.bytes_available()?.min(buf.len());
        if pending == 0 {
            return Ok(0);
        }
        let n = self.port.read(&mut buf[..pending])?;
        debug!("serial rx {} bytes: {}", n, hex_snippet(&buf[..n], 48));
        Ok(n)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        debug!("serial tx {} bytes: {}", frame.len(), hex_snippet(frame, 48));
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }
}

/// In-memory bus used by tests and the smoketest harness.
///
/// Bytes queued with [`MemoryBus::feed`] are served to reads; written frames
/// are captured for inspection. An optional responder maps each written
/// frame to bytes that appear on the read side, simulating the controller.
#[derive(Default)]
pub struct MemoryBus {
    rx: VecDeque<u8>,
    pub written: Vec<Vec<u8>>,
    responder: Option<Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes that subsequent reads will observe.
    pub fn feed(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    /// Install a controller simulation: every written frame is mapped to
    /// response bytes placed on the read side.
    pub fn with_responder(
        mut self,
        responder: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }
}

impl SerialBus for MemoryBus {
    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.rx.len())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.rx.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(frame);
            self.rx.extend(reply);
        }
        self.written.push(frame.to_vec());
        Ok(())
    }
}
