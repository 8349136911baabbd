//! # printkit Communication
//!
//! Serial communication and the print protocol for printkit.
//! Provides the timeout-aware line transport, printer autodetection,
//! firmware flavor strategies for the Marlin/Repetier family, and the
//! stop-and-wait streaming engine with its observable snapshot.

pub mod firmware;
pub mod protocol;
pub mod transport;

pub use transport::{
    detect::resolve as resolve_connection,
    serial::{list_ports, SerialPortInfo, SerialTransport},
    ConnectionParams, Transport,
};

pub use firmware::{
    FirmwareDetector, FirmwareFault, FirmwareFlavor, FirmwareKind, MalyanFlavor, MarlinFlavor,
    RepetierFlavor, SmoothiewareFlavor,
};

pub use protocol::{
    CommandPriority, PrintEngine, PrinterSnapshot, Response, SendCursor,
};
