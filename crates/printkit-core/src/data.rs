//! Shared data model for the printer host
//!
//! Provides:
//! - The engine state machine states
//! - Position and temperature types used by both the analyzer and the
//!   streaming engine
//! - Tagged console log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Engine lifecycle states
///
/// The states are mutually exclusive and transitions follow the print
/// protocol state machine:
///
/// ```text
/// Disconnected -> Connecting -> Operational <-> Printing <-> Paused
///                                    |              |
///                                 (error)        Closing
///                                    v              v
///                                  Error          Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PrinterState {
    /// Not connected to any printer
    #[default]
    Disconnected,
    /// Port opened, waiting for the firmware greeting or first reply
    Connecting,
    /// Connected and idle, ready for commands or a print job
    Operational,
    /// Streaming a loaded program
    Printing,
    /// Print suspended, unsolicited output still serviced
    Paused,
    /// Disconnect requested, monitor winding down
    Closing,
    /// Port released after a disconnect
    Closed,
    /// A protocol or firmware fault latched; requires disconnect/connect
    Error,
}

impl PrinterState {
    /// Check if this state indicates an open serial connection
    pub fn is_connected(&self) -> bool {
        !matches!(
            self,
            PrinterState::Disconnected | PrinterState::Closed | PrinterState::Closing
        )
    }

    /// Check if a print job is in progress (streaming or suspended)
    pub fn is_busy(&self) -> bool {
        matches!(self, PrinterState::Printing | PrinterState::Paused)
    }

    /// Check if the engine accepts a new print job in this state
    pub fn is_ready(&self) -> bool {
        matches!(self, PrinterState::Operational)
    }
}

impl fmt::Display for PrinterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Operational => write!(f, "Operational"),
            Self::Printing => write!(f, "Printing"),
            Self::Paused => write!(f, "Paused"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// A 4-axis position (X, Y, Z, extruder) in millimeters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate in mm
    pub x: f64,
    /// Y coordinate in mm
    pub y: f64,
    /// Z coordinate in mm
    pub z: f64,
    /// Extruder filament position in mm
    pub e: f64,
}

impl Position {
    /// Create a position from X/Y/Z with E at zero
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, e: 0.0 }
    }

    /// XY-plane distance to another position
    ///
    /// Z and E deliberately do not contribute; print move duration is
    /// dominated by table travel.
    pub fn xy_distance(&self, other: &Position) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "X{:.3} Y{:.3} Z{:.3} E{:.3}",
            self.x, self.y, self.z, self.e
        )
    }
}

/// Identifies a heater on the printer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HeaterKey {
    /// Hotend of the i-th extruder (`T0:`, `T1:`, ...)
    Tool(u8),
    /// Heated bed (`B:`)
    Bed,
}

impl HeaterKey {
    /// Parse a heater key from a report token (`B`, `T`, `T0`, `T1`, ...)
    ///
    /// A bare `T` has no tool index; the firmware flavor decides which tool
    /// it belongs to, so it is not representable here and returns `None`.
    pub fn parse(token: &str) -> Option<Self> {
        if token == "B" {
            return Some(HeaterKey::Bed);
        }
        let index = token.strip_prefix('T')?;
        if index.is_empty() {
            return None;
        }
        index.parse::<u8>().ok().map(HeaterKey::Tool)
    }
}

impl fmt::Display for HeaterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tool(i) => write!(f, "T{}", i),
            Self::Bed => write!(f, "B"),
        }
    }
}

/// A single heater reading: actual and (optional) target temperature in celsius
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Measured temperature
    pub actual: f64,
    /// Setpoint, if the report carried one
    pub target: Option<f64>,
}

impl TemperatureReading {
    /// Create a reading with both actual and target
    pub fn new(actual: f64, target: f64) -> Self {
        Self {
            actual,
            target: Some(target),
        }
    }

    /// Create a reading with only the measured value
    pub fn actual_only(actual: f64) -> Self {
        Self {
            actual,
            target: None,
        }
    }
}

/// A complete temperature report
///
/// The snapshot is fully replaced on every parse; there is no accumulation
/// across reports. An empty snapshot means "not a temperature line".
pub type TemperatureSnapshot = BTreeMap<HeaterKey, TemperatureReading>;

/// A temperature snapshot with the wall-clock instant it was observed
///
/// The engine keeps a bounded rolling history of these for trend displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureSample {
    /// When the report was read from the wire
    pub at: DateTime<Utc>,
    /// The parsed snapshot
    pub readings: TemperatureSnapshot,
}

impl TemperatureSample {
    /// Capture a snapshot at the current instant
    pub fn now(readings: TemperatureSnapshot) -> Self {
        Self {
            at: Utc::now(),
            readings,
        }
    }
}

/// Direction of a console log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogDirection {
    /// Sent to the printer
    Outgoing,
    /// Received from the printer
    Incoming,
}

impl fmt::Display for LogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outgoing => write!(f, ">>>"),
            Self::Incoming => write!(f, "<<<"),
        }
    }
}

/// One line of serial traffic, tagged with its direction and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line crossed the wire
    pub at: DateTime<Utc>,
    /// Sent or received
    pub direction: LogDirection,
    /// The line, without trailing newline
    pub line: String,
}

impl LogEntry {
    /// Create an outgoing entry stamped now
    pub fn outgoing(line: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            direction: LogDirection::Outgoing,
            line: line.into(),
        }
    }

    /// Create an incoming entry stamped now
    pub fn incoming(line: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            direction: LogDirection::Incoming,
            line: line.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.direction, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(PrinterState::Printing.is_connected());
        assert!(PrinterState::Printing.is_busy());
        assert!(!PrinterState::Printing.is_ready());
        assert!(PrinterState::Operational.is_ready());
        assert!(!PrinterState::Closed.is_connected());
        assert!(PrinterState::Error.is_connected());
    }

    #[test]
    fn heater_key_parsing() {
        assert_eq!(HeaterKey::parse("B"), Some(HeaterKey::Bed));
        assert_eq!(HeaterKey::parse("T0"), Some(HeaterKey::Tool(0)));
        assert_eq!(HeaterKey::parse("T12"), Some(HeaterKey::Tool(12)));
        // Bare T is flavor-dependent and not representable here
        assert_eq!(HeaterKey::parse("T"), None);
        assert_eq!(HeaterKey::parse("X"), None);
    }

    #[test]
    fn xy_distance_ignores_z_and_e() {
        let a = Position::new(0.0, 0.0, 0.0);
        let b = Position {
            x: 3.0,
            y: 4.0,
            z: 100.0,
            e: 50.0,
        };
        assert!((a.xy_distance(&b) - 5.0).abs() < 1e-9);
    }
}
