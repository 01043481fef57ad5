//! Line Transport (§4.1): owns one serial handle, exposes byte-level I/O and
//! a terminator-aware line read with an explicit deadline.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use crate::error::CoreError;

/// Poll granularity for `read_until`'s internal deadline loop. Short enough
/// that a caller's 100 ms identification-probe deadline is still honored
/// reasonably precisely, long enough not to busy-spin the reader thread.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Outcome of a deadline-bounded line read.
pub enum ReadOutcome {
    Line(String),
    TimedOut,
}

/// Owns exactly one serial handle, configured `{baud, 8N1, read_timeout}`
/// the way `TargetPoint3::connect` configures its port, generalized to an
/// arbitrary path/baud pair and to accept an injected `Box<dyn SerialPort>`
/// for tests.
pub struct LineTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl LineTransport {
    /// Opens `path` at `baud` with 8 data bits, 1 stop bit, no parity, and
    /// the given base read timeout.
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> Result<Self, CoreError> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(read_timeout)
            .open()?;
        Ok(Self { port: Some(port) })
    }

    /// Wraps an already-open port (or a test double), mirroring
    /// `TargetPoint3::new`.
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self { port: Some(port) }
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Releases the port. Idempotent; safe to call on every exit path.
    pub fn close(&mut self) {
        self.port = None;
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, CoreError> {
        self.port
            .as_mut()
            .ok_or_else(|| CoreError::Transport("port is closed".to_string()))
    }

    /// Writes `bytes` atomically: either the whole frame goes out or the
    /// transport transitions to closed on I/O error.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        let port = self.port_mut()?;
        if let Err(e) = port.write_all(bytes) {
            self.close();
            return Err(CoreError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Drains any bytes currently buffered by the OS/driver without parsing
    /// them. Used before every command send to guard against stale
    /// responses from a prior aborted command.
    pub fn discard_input(&mut self) -> Result<(), CoreError> {
        let port = self.port_mut()?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| CoreError::Transport(e.to_string()))
    }

    /// Reads one line terminated by CR, LF, or CRLF (terminator stripped),
    /// never returning a partial line as success. Returns `TimedOut` if no
    /// complete line arrives before `deadline`.
    pub fn read_until_deadline(&mut self, deadline: Instant) -> Result<ReadOutcome, CoreError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadOutcome::TimedOut);
            }
            let slice = POLL_SLICE.min(deadline - now);
            let port = self.port_mut()?;
            if let Err(e) = port.set_timeout(slice) {
                self.close();
                return Err(CoreError::Transport(e.to_string()));
            }

            match port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        return Ok(ReadOutcome::Line(
                            String::from_utf8_lossy(&buf).into_owned(),
                        ));
                    }
                    if byte[0] == b'\r' {
                        // Tentatively terminate on CR; a following LF (CRLF)
                        // is absorbed by the bare-CR branch above on the
                        // next iteration via the buf.last() check, but a
                        // lone CR is itself a valid terminator.
                        return Ok(ReadOutcome::Line(
                            String::from_utf8_lossy(&buf).into_owned(),
                        ));
                    }
                    buf.push(byte[0]);
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) => {
                    self.close();
                    return Err(CoreError::Transport(e.to_string()));
                }
            }
        }
    }
}
