//! Printer listener interface
//!
//! Defines the listener trait UIs subscribe through. The engine never
//! imports a UI; every observer implements this trait and registers with
//! the engine. Each method is pure notification and must not block.

use crate::data::{LogEntry, PrinterState, TemperatureSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Handle for a registered printer listener.
///
/// Uniquely identifies a listener subscription. Can be used to unsubscribe
/// from engine events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrinterListenerHandle(pub String);

/// Progress of the currently streaming job
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Index of the next program line to send (1-based, slot 0 is `M110 N0`)
    pub current_line: usize,
    /// Total program length including the injected reset line
    pub total_lines: usize,
    /// Fraction complete in 0.0..=1.0
    pub fraction: f64,
    /// Seconds spent printing, pause time excluded
    pub elapsed_secs: f64,
    /// Analyzer-estimated seconds remaining, if a reference analysis is set
    pub remaining_secs: Option<f64>,
}

/// Listener trait for print engine events
///
/// Implement this trait to receive notifications of state changes,
/// temperature reports, progress, console traffic, and faults.
#[async_trait]
pub trait PrinterListener: Send + Sync {
    /// Called when the engine state changes
    async fn on_state(&self, _new_state: PrinterState) {}

    /// Called for every parsed temperature report
    async fn on_temp(&self, _snapshot: &TemperatureSnapshot) {}

    /// Called when the send cursor advances
    async fn on_progress(&self, _progress: JobProgress) {}

    /// Called for every line of serial traffic, both directions
    async fn on_log(&self, _entry: &LogEntry) {}

    /// Called when a protocol or firmware fault latches
    async fn on_error(&self, _message: &str) {}
}
