//! Serial port transport
//!
//! Provides low-level serial port operations for direct hardware
//! connection to 3D printer control boards via USB or RS-232.
//!
//! Supports:
//! - Port enumeration and discovery, filtered to printer-like devices
//! - Baud rate configuration (8N1 framing)
//! - Timeout-aware line reads with lossy UTF-8 decoding

use crate::transport::{ConnectionParams, Transport};
use printkit_core::{ConnectionError, Error, Result};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
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

/// List available serial ports on the system
///
/// Returns the ports a printer control board is plausibly attached to:
/// - Windows: COM* (e.g., COM1, COM3)
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        Error::Connection(ConnectionError::SerialError {
            reason: e.to_string(),
        })
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_printer_port(&port.port_name))
        .map(|port| {
            let mut info = SerialPortInfo {
                port_name: port.port_name.clone(),
                description: describe_port(port),
                manufacturer: None,
                vid: None,
                pid: None,
            };
            if let serialport::SerialPortType::UsbPort(usb) = &port.port_type {
                info.manufacturer = usb.manufacturer.clone();
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
            }
            info
        })
        .collect())
}

/// Check if a port name matches printer controller patterns
pub(crate) fn is_printer_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }

    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }

    false
}

/// Get a user-friendly description for a port
fn describe_port(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {} {}",
            usb.manufacturer.as_deref().unwrap_or("Device"),
            usb.product.as_deref().unwrap_or("Serial Port")
        ),
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// How long one blocking read on the underlying port may take. Kept short
/// so the monitor loop stays responsive; [`SerialTransport::read_line`]
/// accumulates reads up to the configured line timeout.
const READ_SLICE_MS: u64 = 50;

/// Real serial transport on top of the `serialport` crate
pub struct SerialTransport {
    params: ConnectionParams,
    port: Option<Box<dyn serialport::SerialPort>>,
    /// Bytes read past the last complete line
    buffer: Vec<u8>,
}

impl SerialTransport {
    /// Open a serial port with the given parameters (8N1 framing)
    pub fn open(params: ConnectionParams) -> Result<Self> {
        let builder = serialport::new(&params.port, params.baud_rate)
            .timeout(Duration::from_millis(READ_SLICE_MS))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(port) => {
                tracing::info!("Opened {} at {} baud", params.port, params.baud_rate);
                Ok(Self {
                    params,
                    port: Some(port),
                    buffer: Vec::new(),
                })
            }
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                Err(ConnectionError::FailedToOpen {
                    port: params.port.clone(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Pop one complete line off the receive buffer, if any
    fn take_buffered_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> String {
        self.params.port.clone()
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        let port = self.port.as_mut().ok_or(ConnectionError::ConnectionLost {
            reason: "port closed".to_string(),
        })?;

        port.write_all(line.as_bytes())
            .and_then(|_| port.write_all(b"\n"))
            .and_then(|_| port.flush())
            .map_err(|e| {
                Error::Connection(ConnectionError::SerialError {
                    reason: e.to_string(),
                })
            })
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.take_buffered_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + Duration::from_millis(self.params.timeout_ms);
        let mut chunk = [0u8; 256];

        loop {
            let port = self.port.as_mut().ok_or(ConnectionError::ConnectionLost {
                reason: "port closed".to_string(),
            })?;

            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    self.buffer.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_buffered_line() {
                        return Ok(Some(line));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(ConnectionError::SerialError {
                        reason: e.to_string(),
                    }
                    .into())
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Closed {}", self.params.port);
        }
        self.buffer.clear();
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}
