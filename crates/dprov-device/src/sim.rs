//! # Simulated Secure Element
//!
//! An in-process stand-in for a microcontroller running the manufacturing
//! stub with a secure element attached. It implements both [`StubLoader`]
//! and [`TransportOpener`] and speaks the same line protocol as the real
//! firmware, so pipelines can be exercised end to end without hardware.
//!
//! Clones share state; tests keep one handle to inspect what the device saw.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{CommandChannel, PROMPT};
use crate::commands::{GET_DEVICE_CERT, PRINT_CHIP_INFO};
use crate::error::LoaderError;
use crate::loader::{DeviceEndpoint, StubLoader};
use crate::transport::{Transport, TransportOpener};

/// Injected misbehaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The stub upload fails.
    StubLoadFails,
    /// The port cannot be opened.
    OpenFails,
    /// The stub prints its banner but never the prompt.
    NoPrompt,
    /// `init` answers with an error status.
    InitError,
    /// The named command is accepted but never answered.
    Unresponsive(&'static str),
}

#[derive(Debug)]
struct DeviceState {
    serial_bytes: Vec<u8>,
    certificate_pem: String,
    faults: Vec<Fault>,
    commands: Vec<String>,
    stub_loads: usize,
    port_open: bool,
}

/// A simulated device. See the module docs.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// A device whose secure element reports `serial_hex` and holds
    /// `certificate_pem`.
    ///
    /// # Panics
    ///
    /// Panics if `serial_hex` is not valid hex; this is a test double.
    #[allow(clippy::expect_used)]
    pub fn new(serial_hex: &str, certificate_pem: impl Into<String>) -> Self {
        let serial_bytes = decode_hex(serial_hex).expect("simulated serial must be hex");
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                serial_bytes,
                certificate_pem: certificate_pem.into(),
                faults: Vec::new(),
                commands: Vec::new(),
                stub_loads: 0,
                port_open: false,
            })),
        }
    }

    /// Add an injected fault.
    pub fn with_fault(self, fault: Fault) -> Self {
        self.state.lock().faults.push(fault);
        self
    }

    /// A disconnected channel to this device on `port`.
    pub fn channel(&self, port: &str) -> CommandChannel {
        CommandChannel::new(
            DeviceEndpoint::new(port, "sim/secure_cert_mfg.bin"),
            Box::new(self.clone()),
            Box::new(self.clone()),
        )
    }

    /// Commands received over the wire, in order.
    pub fn commands_received(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Whether a transport to the device is currently open.
    pub fn port_open(&self) -> bool {
        self.state.lock().port_open
    }

    /// Number of stub uploads.
    pub fn stub_loads(&self) -> usize {
        self.state.lock().stub_loads
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.state.lock().faults.contains(&fault)
    }
}

impl StubLoader for SimulatedDevice {
    fn load(&self, endpoint: &DeviceEndpoint) -> Result<(), LoaderError> {
        if self.has_fault(Fault::StubLoadFails) {
            return Err(LoaderError::Failed {
                program: "sim-loader".to_string(),
                status: "exit status: 2".to_string(),
                stderr: format!("Failed to connect to ESP32 on {}", endpoint.port),
            });
        }
        self.state.lock().stub_loads += 1;
        Ok(())
    }
}

impl TransportOpener for SimulatedDevice {
    fn open(&self, port: &str, _baud: u32) -> io::Result<Box<dyn Transport>> {
        let mut state = self.state.lock();
        if state.faults.contains(&Fault::OpenFails) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{port}: no such device"),
            ));
        }
        if state.port_open {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{port}: port busy"),
            ));
        }
        state.port_open = true;

        let mut pending: VecDeque<String> = [
            "ESP-ROM:esp32-20160606",
            "Secure cert manufacturing firmware",
            "Initializing command console",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        if !state.faults.contains(&Fault::NoPrompt) {
            pending.push_back(PROMPT.to_string());
        }
        Ok(Box::new(SimTransport {
            device: self.clone(),
            pending,
            initialized: false,
            open: true,
        }))
    }
}

struct SimTransport {
    device: SimulatedDevice,
    pending: VecDeque<String>,
    initialized: bool,
    open: bool,
}

impl SimTransport {
    fn respond(&mut self, command: &str) {
        let state = self.device.state.lock();
        let silent = state
            .faults
            .iter()
            .any(|f| matches!(f, Fault::Unresponsive(c) if *c == command));
        if silent {
            return;
        }
        let mut out: Vec<String> = Vec::new();
        match command {
            "init" if state.faults.contains(&Fault::InitError) => {
                out.push("Status: error ATECC608 not detected".to_string());
            }
            "init" => {
                self.initialized = true;
                out.push("Initialising ATECC608 on I2C".to_string());
                out.push("Status: ok".to_string());
            }
            PRINT_CHIP_INFO | GET_DEVICE_CERT if !self.initialized => {
                out.push("Status: error device not initialized".to_string());
            }
            PRINT_CHIP_INFO => {
                out.push("Chip Model: ATECC608".to_string());
                let serial: Vec<String> =
                    state.serial_bytes.iter().map(|b| format!("{b:02X}")).collect();
                out.push(format!("Serial Number: {}", serial.join(" ")));
                out.push("Status: ok".to_string());
            }
            GET_DEVICE_CERT => {
                out.extend(state.certificate_pem.lines().map(str::to_string));
                out.push("Status: ok".to_string());
            }
            other => out.push(format!("Status: error unknown command {other}")),
        }
        out.push(PROMPT.to_string());
        drop(state);
        self.pending.extend(out);
    }
}

impl Transport for SimTransport {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        self.device.state.lock().commands.push(line.to_string());
        self.respond(line.trim());
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        match self.pending.pop_front() {
            Some(line) => Ok(Some(line)),
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.device.state.lock().port_open = false;
        }
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = s
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            u8::try_from(hi * 16 + lo).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_port_cannot_be_opened_twice() {
        let dev = SimulatedDevice::new("0A0B", "");
        let first = dev.open("COM7", 115_200).unwrap();
        assert!(dev.open("COM7", 115_200).is_err());
        drop(first);
        assert!(dev.open("COM7", 115_200).is_ok());
    }

    #[test]
    fn decode_hex_accepts_separators() {
        assert_eq!(decode_hex("01:ab CD"), Some(vec![0x01, 0xAB, 0xCD]));
        assert_eq!(decode_hex("0"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}
