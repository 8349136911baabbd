//! Firmware flavor strategies
//!
//! The Marlin/Repetier serial family shares one wire protocol with small
//! per-firmware divergences: how resend requests are spelled, what counts
//! as a busy keepalive, and how bare `T:` temperature readings map onto
//! tools. Each divergence is a hook on [`FirmwareFlavor`]; Marlin is the
//! default and `M115` output picks an override.

pub mod malyan;
pub mod marlin;
pub mod repetier;
pub mod smoothieware;
pub mod temperature;

pub use malyan::MalyanFlavor;
pub use marlin::MarlinFlavor;
pub use repetier::RepetierFlavor;
pub use smoothieware::SmoothiewareFlavor;

use printkit_core::TemperatureSnapshot;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Supported firmware families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FirmwareKind {
    /// Marlin (default, most common)
    #[default]
    Marlin,
    /// Repetier-Firmware
    Repetier,
    /// Smoothieware
    Smoothieware,
    /// Malyan (M200/M300 series boards)
    Malyan,
    /// Unknown/generic, treated as Marlin
    Unknown,
}

impl std::fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Marlin => write!(f, "Marlin"),
            Self::Repetier => write!(f, "Repetier"),
            Self::Smoothieware => write!(f, "Smoothieware"),
            Self::Malyan => write!(f, "Malyan"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A firmware fault reported on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareFault {
    /// The verbatim firmware line
    pub message: String,
    /// Whether the fault ends the print (thermal faults, kill)
    pub fatal: bool,
}

fn resend_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:resend|rs)\s*:?\s*N?\s*(\d+)").expect("invalid regex pattern")
    })
}

/// Substrings that mark a firmware error as print-ending
pub(crate) const FATAL_MARKERS: &[&str] = &[
    "mintemp",
    "maxtemp",
    "thermal runaway",
    "heating failed",
    "killed",
    "kill() called",
    "printer halted",
];

/// Per-firmware protocol divergence hooks
///
/// Defaults implement Marlin behavior; flavors override only what differs.
pub trait FirmwareFlavor: Send + Sync {
    /// Which family this flavor speaks for
    fn kind(&self) -> FirmwareKind;

    /// Whether the line acknowledges the in-flight command
    fn is_ack(&self, line: &str) -> bool {
        line == "ok" || line.starts_with("ok ") || line.starts_with("ok\t")
    }

    /// Line number requested by a resend line, if it is one
    fn parse_resend(&self, line: &str) -> Option<usize> {
        resend_regex()
            .captures(line)
            .and_then(|caps| caps[1].parse().ok())
    }

    /// Whether the line is a busy keepalive (resets the heartbeat clock,
    /// never acks)
    fn is_busy(&self, line: &str) -> bool {
        line.starts_with("echo:busy:")
    }

    /// Whether the line is a harmless idle keepalive
    fn is_wait(&self, line: &str) -> bool {
        line == "wait"
    }

    /// Whether the line is the firmware boot banner
    fn is_boot_banner(&self, line: &str) -> bool {
        line == "start" || line.starts_with("start ")
    }

    /// Classify an error line, if it is one
    fn classify_error(&self, line: &str) -> Option<FirmwareFault> {
        let message = if let Some(rest) = line.strip_prefix("Error:") {
            rest.trim()
        } else if let Some(rest) = line.strip_prefix("!!") {
            rest.trim()
        } else {
            return None;
        };

        let lowered = line.to_ascii_lowercase();
        let fatal =
            message.is_empty() || FATAL_MARKERS.iter().any(|marker| lowered.contains(marker));
        Some(FirmwareFault {
            message: line.to_string(),
            fatal,
        })
    }

    /// Fold raw temperature entries into a canonical snapshot
    ///
    /// A bare `T:` reading belongs to the currently selected tool: when a
    /// keyed `T0:` is also present the bare reading wins for the current
    /// tool, and when the report carries only `T:` (single-extruder
    /// heat-wait) it is the current tool's reading.
    fn canonicalize_temperatures(
        &self,
        entries: &[temperature::RawReading],
        current_tool: u8,
    ) -> TemperatureSnapshot {
        temperature::canonicalize(entries, current_tool)
    }
}

/// Pick the flavor for a detected firmware kind
pub fn flavor_for(kind: FirmwareKind) -> Arc<dyn FirmwareFlavor> {
    match kind {
        FirmwareKind::Repetier => Arc::new(RepetierFlavor),
        FirmwareKind::Smoothieware => Arc::new(SmoothiewareFlavor),
        FirmwareKind::Malyan => Arc::new(MalyanFlavor),
        FirmwareKind::Marlin | FirmwareKind::Unknown => Arc::new(MarlinFlavor),
    }
}

/// Detects the firmware family from `M115` output
#[derive(Debug, Default)]
pub struct FirmwareDetector;

impl FirmwareDetector {
    /// Inspect one received line for a firmware identification
    ///
    /// `M115` replies look like
    /// `FIRMWARE_NAME:Marlin 2.1.2 SOURCE_CODE_URL:...`; some firmwares
    /// identify themselves in their boot banner instead.
    pub fn detect(line: &str) -> Option<FirmwareKind> {
        let lowered = line.to_ascii_lowercase();
        if !lowered.contains("firmware_name:") && !lowered.contains("firmware:") {
            return None;
        }

        if lowered.contains("marlin") {
            Some(FirmwareKind::Marlin)
        } else if lowered.contains("repetier") {
            Some(FirmwareKind::Repetier)
        } else if lowered.contains("smoothie") {
            Some(FirmwareKind::Smoothieware)
        } else if lowered.contains("malyan") {
            Some(FirmwareKind::Malyan)
        } else {
            Some(FirmwareKind::Unknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ack_detection() {
        let flavor = MarlinFlavor;
        assert!(flavor.is_ack("ok"));
        assert!(flavor.is_ack("ok T:210.0 /210.0"));
        assert!(!flavor.is_ack("okay"));
        assert!(!flavor.is_ack("kok"));
    }

    #[test]
    fn resend_spellings() {
        let flavor = MarlinFlavor;
        assert_eq!(flavor.parse_resend("Resend: 5"), Some(5));
        assert_eq!(flavor.parse_resend("Resend:12"), Some(12));
        assert_eq!(flavor.parse_resend("rs 7"), Some(7));
        assert_eq!(flavor.parse_resend("rs N3"), Some(3));
        assert_eq!(flavor.parse_resend("ok"), None);
        assert_eq!(flavor.parse_resend("Error:resend"), None);
    }

    #[test]
    fn error_classification() {
        let flavor = MarlinFlavor;
        let fault = flavor
            .classify_error("Error: MINTEMP triggered, system stopped!")
            .unwrap();
        assert!(fault.fatal);
        assert!(fault.message.contains("MINTEMP"));

        let soft = flavor
            .classify_error("Error:checksum mismatch, Last Line: 4")
            .unwrap();
        assert!(!soft.fatal);

        assert!(flavor.classify_error("echo: cold extrusion prevented").is_none());
    }

    #[test]
    fn kill_banner_is_fatal() {
        let flavor = MarlinFlavor;
        let fault = flavor
            .classify_error("!! Printer halted. kill() called!")
            .unwrap();
        assert!(fault.fatal);
    }

    #[test]
    fn m115_detection() {
        assert_eq!(
            FirmwareDetector::detect("FIRMWARE_NAME:Marlin 2.1.2 (Jun 10 2024)"),
            Some(FirmwareKind::Marlin)
        );
        assert_eq!(
            FirmwareDetector::detect("FIRMWARE_NAME:Repetier_0.92.9"),
            Some(FirmwareKind::Repetier)
        );
        assert_eq!(
            FirmwareDetector::detect("FIRMWARE_NAME:Smoothieware, FIRMWARE_URL:http..."),
            Some(FirmwareKind::Smoothieware)
        );
        assert_eq!(FirmwareDetector::detect("ok T:20.0 /0.0"), None);
    }
}
