//! Received-line classification
//!
//! Every line read from the printer is classified exactly once, in a fixed
//! order, against the active firmware flavor. Temperature reports ride on
//! acks (`ok T:...`) or stand alone (`M109` heat-wait chatter).

use crate::firmware::{temperature, FirmwareFault, FirmwareFlavor};
use printkit_core::TemperatureSnapshot;
use serde::{Deserialize, Serialize};

/// Classification of one received line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Acknowledgment of the in-flight line, possibly carrying a report
    Ack {
        /// Temperatures piggybacked on the ack, if any
        temperatures: Option<TemperatureSnapshot>,
    },
    /// Retransmission request for the given line number
    Resend(usize),
    /// Unsolicited temperature report (no ack)
    Temperature(TemperatureSnapshot),
    /// Firmware boot banner; fatal mid-print
    Boot,
    /// Harmless idle keepalive
    Wait,
    /// Busy keepalive; resets the heartbeat clock, never acks
    Busy,
    /// Firmware error line
    Fault(FirmwareFault),
    /// Anything else (echo chatter, capability lines)
    Other,
}

/// Classify a received line
pub fn classify(line: &str, flavor: &dyn FirmwareFlavor, current_tool: u8) -> Response {
    if flavor.is_ack(line) {
        let entries = temperature::parse_report(line);
        let temperatures = (!entries.is_empty())
            .then(|| flavor.canonicalize_temperatures(&entries, current_tool));
        return Response::Ack { temperatures };
    }

    if let Some(line_number) = flavor.parse_resend(line) {
        return Response::Resend(line_number);
    }

    let entries = temperature::parse_report(line);
    if !entries.is_empty() {
        return Response::Temperature(flavor.canonicalize_temperatures(&entries, current_tool));
    }

    if flavor.is_boot_banner(line) {
        return Response::Boot;
    }

    if flavor.is_wait(line) {
        return Response::Wait;
    }

    if flavor.is_busy(line) {
        return Response::Busy;
    }

    if let Some(fault) = flavor.classify_error(line) {
        return Response::Fault(fault);
    }

    Response::Other
}
