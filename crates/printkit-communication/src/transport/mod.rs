//! Line-oriented transport abstraction
//!
//! The engine talks to the printer through the [`Transport`] trait so the
//! monitor loop can be driven by a real serial port or by a scripted mock
//! in tests. Messages are `\n`-delimited; reads are timeout-aware and
//! return `Ok(None)` when no complete line arrived in time.

pub mod detect;
pub mod serial;

use printkit_core::Result;

/// Connection parameters for a serial link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Device path (`/dev/ttyUSB0`, `COM3`, ...)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout for one [`Transport::read_line`] call, in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115200,
            timeout_ms: 1000,
        }
    }
}

/// A connected, line-oriented, timeout-aware link to the printer
///
/// The monitor thread is the sole user of a transport once the engine owns
/// it; implementations only need to be `Send`.
pub trait Transport: Send {
    /// Human-readable name for logs (device path for serial ports)
    fn name(&self) -> String;

    /// Whether the link is open
    fn is_connected(&self) -> bool;

    /// Append `\n` and write the line out, flushing synchronously
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Read until `\n` or timeout
    ///
    /// Returns `Ok(None)` on timeout. The returned line has trailing
    /// whitespace trimmed and is decoded as UTF-8 with lossy replacement.
    fn read_line(&mut self) -> Result<Option<String>>;

    /// Close the link; idempotent, interrupts any pending read
    fn close(&mut self);
}
