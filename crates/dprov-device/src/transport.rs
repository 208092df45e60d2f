//! # Line Transport
//!
//! The command channel speaks text lines. [`Transport`] is the byte-stream
//! seam underneath it: a real serial port in production, an in-process
//! simulation in tests.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// A line-oriented, exclusively owned byte stream.
pub trait Transport: Send {
    /// Write `line` followed by `\n`.
    fn send_line(&mut self, line: &str) -> io::Result<()>;

    /// Receive one line without its terminator.
    ///
    /// Returns `Ok(None)` when no complete line arrived within `timeout`.
    fn recv_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Release the underlying handle. Further calls may fail.
    fn close(&mut self);
}

/// Opens a [`Transport`] to a named port.
pub trait TransportOpener: Send + Sync {
    /// Open `port` at `baud`.
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn Transport>>;
}

/// Splits buffered bytes into lines, tolerating `\r\n`.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

/// A physical serial port.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    lines: LineBuffer,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.name)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    /// Open `name` at `baud`, 8N1, no flow control.
    pub fn open(name: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(name, baud)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(io::Error::other)?;
        tracing::debug!(port = name, baud, "serial port opened");
        Ok(Self {
            port: Some(port),
            name: name.to_string(),
            lines: LineBuffer::default(),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()
    }

    fn recv_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.lines.next_line() {
            return Ok(Some(line));
        }
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let port = self.port()?;
            port.set_timeout(remaining).map_err(io::Error::other)?;
            match port.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port returned end of stream",
                    ))
                }
                Ok(n) => {
                    self.lines.push(&chunk[..n]);
                    if let Some(line) = self.lines.next_line() {
                        return Ok(Some(line));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!(port = %self.name, "serial port closed");
        }
    }
}

/// Opens [`SerialTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialOpener;

impl TransportOpener for SerialOpener {
    fn open(&self, port: &str, baud: u32) -> io::Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(port, baud)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_and_strips_cr() {
        let mut lb = LineBuffer::default();
        lb.push(b"Status: ok\r\n>");
        assert_eq!(lb.next_line().as_deref(), Some("Status: ok"));
        assert_eq!(lb.next_line(), None);
        lb.push(b">\n");
        assert_eq!(lb.next_line().as_deref(), Some(">>"));
    }

    #[test]
    fn line_buffer_keeps_empty_lines() {
        let mut lb = LineBuffer::default();
        lb.push(b"\n\nx\n");
        assert_eq!(lb.next_line().as_deref(), Some(""));
        assert_eq!(lb.next_line().as_deref(), Some(""));
        assert_eq!(lb.next_line().as_deref(), Some("x"));
    }

    #[test]
    fn opening_a_missing_port_fails() {
        assert!(SerialTransport::open("/dev/does-not-exist-dprov", 115_200).is_err());
    }
}
