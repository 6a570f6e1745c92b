//! Serial port communication implementation
//!
//! Provides the line transport used against real hardware: a USB serial
//! link to the Smoothieware board.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Per-command acknowledgement timeouts
//! - Blocking port I/O moved off the async runtime

use super::LineTransport;
use async_trait::async_trait;
use motionkit_core::{ConnectionError, Error, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Appended to every command line. The doubled line ending makes the
/// controller answer with two `ok`s, which is the acknowledgement.
pub const COMMAND_TERMINATOR: &str = "\r\n\r\n";

/// Acknowledgement the controller sends after each command
pub const ACK: &str = "ok\r\nok\r\n";

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            vid: None,
            pid: None,
        }
    }

    /// Set manufacturer
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that could be a motion controller
///
/// Filters to the USB serial patterns the board enumerates as:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*, /dev/ttyAMA*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => Ok(ports
            .iter()
            .filter(|port| is_controller_port(&port.port_name))
            .map(|port| {
                let info = SerialPortInfo::new(&port.port_name, port_description(port));
                match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb_info) => {
                        let info = info.with_usb_ids(usb_info.vid, usb_info.pid);
                        match usb_info.manufacturer {
                            Some(ref mfg) => info.with_manufacturer(mfg),
                            None => info,
                        }
                    }
                    _ => info,
                }
            })
            .collect()),
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(Error::other(format!("Failed to enumerate ports: {}", e)))
        }
    }
}

fn is_controller_port(port_name: &str) -> bool {
    if let Some(suffix) = port_name.strip_prefix("COM") {
        return !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit());
    }

    ["/dev/ttyUSB", "/dev/ttyACM", "/dev/ttyAMA", "/dev/cu.usbserial-", "/dev/cu.usbmodem"]
        .iter()
        .any(|prefix| port_name.starts_with(prefix))
}

fn port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => format!(
            "USB {} {}",
            usb_info.manufacturer.as_deref().unwrap_or("Device"),
            usb_info.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Split a controller reply at the acknowledgement.
///
/// Returns the text that preceded the acknowledgement, trimmed, or `None`
/// when the acknowledgement has not arrived yet.
pub fn strip_ack(raw: &str) -> Option<String> {
    raw.find(ACK).map(|idx| raw[..idx].trim().to_string())
}

fn has_failure_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("error") || lower.contains("alarm")
}

/// Line transport over a real serial port
pub struct SerialLineTransport {
    port_name: String,
    port: Arc<Mutex<Box<dyn serialport::SerialPort>>>,
}

impl SerialLineTransport {
    /// Open a serial port at the given baud rate
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let builder = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(10)) // short reads, the deadline lives in exchange()
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(port) => {
                tracing::info!("Opened {} at {} baud", port_name, baud_rate);
                Ok(Self {
                    port_name: port_name.to_string(),
                    port: Arc::new(Mutex::new(port)),
                })
            }
            Err(e) if e.kind() == serialport::ErrorKind::NoDevice => {
                Err(ConnectionError::PortNotFound {
                    port: port_name.to_string(),
                }
                .into())
            }
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", port_name, e);
                Err(ConnectionError::FailedToOpen {
                    port: port_name.to_string(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Open the first port that looks like a controller
    pub fn open_first(baud_rate: u32) -> Result<Self> {
        let ports = list_ports()?;
        let first = ports.first().ok_or_else(|| ConnectionError::PortNotFound {
            port: "<any>".to_string(),
        })?;
        Self::open(&first.port_name, baud_rate)
    }
}

#[async_trait]
impl LineTransport for SerialLineTransport {
    async fn send_line(&mut self, line: &str, timeout: Duration) -> Result<String> {
        let port = Arc::clone(&self.port);
        let command = line.to_string();
        tracing::debug!("-> {}", command);

        let response = tokio::task::spawn_blocking(move || exchange(&port, &command, timeout))
            .await
            .map_err(|e| ConnectionError::Io {
                reason: e.to_string(),
            })??;

        tracing::debug!("<- {}", response);
        Ok(response)
    }

    fn port_name(&self) -> Option<String> {
        Some(self.port_name.clone())
    }
}

fn exchange(
    port: &Mutex<Box<dyn serialport::SerialPort>>,
    command: &str,
    timeout: Duration,
) -> Result<String> {
    let mut port = port.lock();
    let io_err = |e: io::Error| ConnectionError::Io {
        reason: e.to_string(),
    };

    // anything left over belongs to an earlier, abandoned exchange
    if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
        tracing::debug!("Could not clear input buffer: {}", e);
    }

    let payload = format!("{}{}", command, COMMAND_TERMINATOR);
    port.write_all(payload.as_bytes()).map_err(io_err)?;
    port.flush().map_err(io_err)?;

    let deadline = Instant::now() + timeout;
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        let text = String::from_utf8_lossy(&buffer).into_owned();
        if let Some(response) = strip_ack(&text) {
            return Ok(response);
        }

        if Instant::now() >= deadline {
            let text = text.trim().to_string();
            // an alarm may never be followed by the acknowledgement
            if has_failure_marker(&text) {
                return Ok(text);
            }
            if text.is_empty() {
                return Err(ConnectionError::NoResponse {
                    command: command.to_string(),
                }
                .into());
            }
            return Err(ConnectionError::Timeout {
                command: command.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        }

        match port.read(&mut chunk) {
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(io_err(e).into()),
        }
    }
}
