//! Marlin flavor, the protocol baseline
//!
//! All trait defaults implement Marlin conventions, so this flavor is an
//! empty marker type.

use super::{FirmwareFlavor, FirmwareKind};

/// Marlin firmware (the default flavor)
#[derive(Debug, Clone, Copy, Default)]
pub struct MarlinFlavor;

impl FirmwareFlavor for MarlinFlavor {
    fn kind(&self) -> FirmwareKind {
        FirmwareKind::Marlin
    }
}
