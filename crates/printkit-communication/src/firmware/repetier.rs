//! Repetier-Firmware flavor
//!
//! Repetier acks with `ok <lineno>` when `ECHO_ON_EXECUTE` is set, emits
//! `wait` when its buffer runs dry, and spells busy keepalives without the
//! `echo:` prefix.

use super::{FirmwareFlavor, FirmwareKind};

/// Repetier-Firmware
#[derive(Debug, Clone, Copy, Default)]
pub struct RepetierFlavor;

impl FirmwareFlavor for RepetierFlavor {
    fn kind(&self) -> FirmwareKind {
        FirmwareKind::Repetier
    }

    fn is_busy(&self, line: &str) -> bool {
        line.starts_with("echo:busy:") || line.starts_with("busy:")
    }

    fn is_wait(&self, line: &str) -> bool {
        line == "wait" || line.starts_with("wait ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbered_ok_is_still_an_ack() {
        let flavor = RepetierFlavor;
        assert!(flavor.is_ack("ok 42"));
    }

    #[test]
    fn unprefixed_busy_is_recognized() {
        let flavor = RepetierFlavor;
        assert!(flavor.is_busy("busy:processing"));
        assert!(flavor.is_busy("echo:busy: processing"));
    }

    #[test]
    fn wait_keepalive() {
        let flavor = RepetierFlavor;
        assert!(flavor.is_wait("wait"));
        assert!(!flavor.is_wait("waiting"));
    }
}
