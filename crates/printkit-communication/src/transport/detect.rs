//! Printer autodetection
//!
//! Resolves an `Auto` port (and a zero baud rate) to a concrete device by
//! probing candidates with `M105` and keeping the first one that answers
//! with a temperature report.

use crate::transport::serial::{list_ports, SerialTransport};
use crate::transport::{ConnectionParams, Transport};
use printkit_core::{ConnectionError, Result};
use printkit_settings::ConnectionSettings;
use std::time::{Duration, Instant};

/// Resolve connection settings to a concrete port and baud rate
///
/// A literal port with a nonzero baud passes through untouched. An `Auto`
/// port probes every enumerated printer-like device; a zero baud rate
/// probes the configured candidate list in order (highest first).
pub fn resolve(settings: &ConnectionSettings) -> Result<ConnectionParams> {
    let explicit = !settings.is_auto_port() && settings.baud_rate != 0;
    if explicit {
        return Ok(ConnectionParams {
            port: settings.port.clone(),
            baud_rate: settings.baud_rate,
            timeout_ms: settings.read_timeout_ms,
        });
    }

    let ports: Vec<String> = if settings.is_auto_port() {
        list_ports()?.into_iter().map(|p| p.port_name).collect()
    } else {
        vec![settings.port.clone()]
    };

    let bauds: Vec<u32> = if settings.baud_rate == 0 {
        settings.baud_candidates.clone()
    } else {
        vec![settings.baud_rate]
    };

    for port in &ports {
        for &baud in &bauds {
            let params = ConnectionParams {
                port: port.clone(),
                baud_rate: baud,
                timeout_ms: settings.read_timeout_ms,
            };
            let Ok(mut transport) = SerialTransport::open(params.clone()) else {
                continue;
            };
            tracing::debug!("Probing {} at {} baud", port, baud);
            if probe(&mut transport, settings.probe_timeout_ms) {
                tracing::info!("Printer detected on {} at {} baud", port, baud);
                transport.close();
                return Ok(params);
            }
            transport.close();
        }
    }

    Err(ConnectionError::NoPrinterDetected.into())
}

/// Send `M105` and wait for a reply carrying a temperature report
///
/// Any line containing `T:` within the timeout window counts as a printer.
pub fn probe(transport: &mut dyn Transport, timeout_ms: u64) -> bool {
    if transport.send_line("M105").is_err() {
        return false;
    }

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        match transport.read_line() {
            Ok(Some(line)) if line.contains("T:") => return true,
            Ok(Some(_)) => {}
            Ok(None) => {}
            Err(_) => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        replies: VecDeque<Option<String>>,
        sent: Vec<String>,
    }

    impl Transport for ScriptedTransport {
        fn name(&self) -> String {
            "scripted".to_string()
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn send_line(&mut self, line: &str) -> Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        fn read_line(&mut self) -> Result<Option<String>> {
            Ok(self.replies.pop_front().flatten())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn probe_accepts_temperature_reply() {
        let mut transport = ScriptedTransport {
            replies: VecDeque::from([
                Some("echo: startup".to_string()),
                Some("ok T:21.3 /0.0 B:20.9 /0.0".to_string()),
            ]),
            sent: Vec::new(),
        };
        assert!(probe(&mut transport, 2000));
        assert_eq!(transport.sent, vec!["M105".to_string()]);
    }

    #[test]
    fn probe_rejects_silence() {
        let mut transport = ScriptedTransport {
            replies: VecDeque::from([None, None]),
            sent: Vec::new(),
        };
        assert!(!probe(&mut transport, 10));
    }

    #[test]
    fn explicit_settings_skip_probing() {
        let settings = ConnectionSettings {
            port: "/dev/ttyACM0".to_string(),
            ..ConnectionSettings::default()
        };
        let params = resolve(&settings).unwrap();
        assert_eq!(params.port, "/dev/ttyACM0");
        assert_eq!(params.baud_rate, 115200);
    }
}
