//! Malyan flavor (M200/M300 series boards)
//!
//! Malyan firmware is a Marlin derivative whose resend requests only ever
//! use the terse `rs <n>` spelling and whose boot banner includes a
//! version tail.

use super::{FirmwareFlavor, FirmwareKind};

/// Malyan firmware
#[derive(Debug, Clone, Copy, Default)]
pub struct MalyanFlavor;

impl FirmwareFlavor for MalyanFlavor {
    fn kind(&self) -> FirmwareKind {
        FirmwareKind::Malyan
    }

    fn is_boot_banner(&self, line: &str) -> bool {
        line == "start" || line.starts_with("start,") || line.starts_with("start ")
    }
}
