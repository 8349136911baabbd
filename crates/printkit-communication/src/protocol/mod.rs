//! The stop-and-wait print protocol
//!
//! Submodules:
//! - `cursor`: the `(next, sent, acked)` send cursor
//! - `queue`: bounded priority command queue
//! - `response`: received-line classification
//! - `engine`: the state machine and monitor loop

pub mod cursor;
pub mod engine;
pub mod queue;
pub mod response;

pub use cursor::SendCursor;
pub use engine::{PrintEngine, PrinterSnapshot};
pub use queue::{CommandPriority, CommandQueue, QueuedCommand};
pub use response::{classify, Response};
