//! Smoothieware flavor
//!
//! Smoothieware spells errors in lowercase, reports kills with a `!!`
//! banner, and during a single-extruder `M109` heat-wait emits bare `T:`
//! readings (handled by the shared canonicalization).

use super::{FirmwareFault, FirmwareFlavor, FirmwareKind, FATAL_MARKERS};

/// Smoothieware
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothiewareFlavor;

impl FirmwareFlavor for SmoothiewareFlavor {
    fn kind(&self) -> FirmwareKind {
        FirmwareKind::Smoothieware
    }

    fn classify_error(&self, line: &str) -> Option<FirmwareFault> {
        let message = if let Some(rest) = line.strip_prefix("Error:") {
            rest.trim()
        } else if let Some(rest) = line.strip_prefix("error:") {
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
}
