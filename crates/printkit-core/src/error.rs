//! Error handling for printkit
//!
//! Provides error types for all layers of the host core:
//! - Connection errors (serial port, autodetection)
//! - Protocol errors (stream state machine, firmware faults)
//! - G-Code errors (file loading, framing)
//! - Analyzer errors (simulation)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Connection error type
///
/// Represents errors related to communication with the printer over the
/// serial link, including port discovery and autodetection.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// No printer answered the autodetection probe
    #[error("No printer detected on any candidate port")]
    NoPrinterDetected,

    /// Baud rate not supported
    #[error("Baud rate {baud} not supported")]
    UnsupportedBaudRate {
        /// The unsupported baud rate.
        baud: u32,
    },

    /// Connection lost
    #[error("Connection lost: {reason}")]
    ConnectionLost {
        /// The reason the connection was lost.
        reason: String,
    },

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// Generic connection error
    #[error("Connection error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Protocol error type
///
/// Represents errors in the stop-and-wait streaming protocol and the
/// engine state machine that drives it.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Operation not allowed in the current state.
    ///
    /// This is the typed refusal for caller misuse; it never transitions
    /// the engine state.
    #[error("Operation '{operation}' not allowed while {state}")]
    InvalidOperation {
        /// The engine state at the time of the call.
        state: String,
        /// The refused operation.
        operation: String,
    },

    /// No program has been loaded
    #[error("No program loaded")]
    NoProgram,

    /// The printer requested the same line too many times
    #[error("Line {line_number} resent {attempts} times without progress")]
    ResendLoop {
        /// The line number being requested over and over.
        line_number: usize,
        /// How many identical resend requests were seen.
        attempts: u32,
    },

    /// The printer stopped replying
    #[error("No response from printer after {probes} heartbeat probes")]
    HeartbeatTimeout {
        /// Consecutive unanswered probes.
        probes: u32,
    },

    /// Firmware rebooted while a print was streaming
    #[error("Printer reset during print: {banner}")]
    ResetDuringPrint {
        /// The verbatim boot banner.
        banner: String,
    },

    /// The firmware reported a fatal condition
    #[error("Firmware error: {message}")]
    FirmwareFatal {
        /// The verbatim firmware line.
        message: String,
    },

    /// Generic protocol error
    #[error("Protocol error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// G-Code error type
///
/// Represents errors related to loading and framing GCODE programs. Note
/// that *parsing* a single line never fails; malformed lines pass through
/// verbatim and the firmware's resend path deals with them.
#[derive(Error, Debug, Clone)]
pub enum GcodeError {
    /// Program file could not be read
    #[error("Failed to read {path}: {reason}")]
    FileError {
        /// Path of the file that could not be read.
        path: String,
        /// The reason the file could not be read.
        reason: String,
    },

    /// Program is empty after comment stripping
    #[error("Program contains no sendable lines")]
    EmptyProgram,

    /// Line number outside the program
    #[error("Line number {line_number} out of range (program has {len} lines)")]
    LineOutOfRange {
        /// The requested line number.
        line_number: usize,
        /// The program length.
        len: usize,
    },

    /// Generic G-Code error
    #[error("G-Code error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Analyzer error type
#[derive(Error, Debug, Clone)]
pub enum AnalyzerError {
    /// Input file not found or unreadable
    #[error("Cannot analyze {path}: {reason}")]
    Unreadable {
        /// Path of the input file.
        path: String,
        /// The reason it could not be read.
        reason: String,
    },

    /// Generic analyzer error
    #[error("Analyzer error: {message}")]
    Other {
        /// The error message.
        message: String,
    },
}

/// Main error type for printkit
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// G-Code error
    #[error(transparent)]
    Gcode(#[from] GcodeError),

    /// Analyzer error
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Check if this error latches the engine in the ERROR state
    ///
    /// Transient I/O problems are retried via heartbeat and never reach the
    /// caller; anything protocol- or firmware-fatal latches until an
    /// explicit disconnect/connect cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(
                ProtocolError::ResendLoop { .. }
                    | ProtocolError::HeartbeatTimeout { .. }
                    | ProtocolError::ResetDuringPrint { .. }
                    | ProtocolError::FirmwareFatal { .. }
            )
        )
    }

    /// Check if this is the typed refusal for caller misuse
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(ProtocolError::InvalidOperation { .. } | ProtocolError::NoProgram)
        )
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
