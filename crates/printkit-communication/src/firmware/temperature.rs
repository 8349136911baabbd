//! Temperature report parser
//!
//! Parses `T:`/`B:` temperature reports from printer output into a
//! [`TemperatureSnapshot`]. The snapshot is a complete replacement; a line
//! producing no matches is not a temperature line.

use printkit_core::{HeaterKey, TemperatureReading, TemperatureSnapshot};
use regex::Regex;
use std::sync::OnceLock;

/// One `key: actual [/ target]` match before canonicalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    /// The key token as it appeared (`B`, `T`, `T0`, ...)
    pub key: String,
    /// The parsed reading
    pub reading: TemperatureReading,
}

fn report_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(B|T\d*):\s*(-?\d+(?:\.\d+)?)(?:\s*/\s*(-?\d+(?:\.\d+)?))?")
            .expect("invalid regex pattern")
    })
}

/// Scan a received line for temperature readings, in source order
pub fn parse_report(line: &str) -> Vec<RawReading> {
    report_regex()
        .captures_iter(line)
        .filter_map(|caps| {
            let actual: f64 = caps[2].parse().ok()?;
            let target = caps.get(3).and_then(|m| m.as_str().parse().ok());
            Some(RawReading {
                key: caps[1].to_string(),
                reading: TemperatureReading { actual, target },
            })
        })
        .collect()
}

/// Fold raw readings into a canonical snapshot
///
/// Keyed entries (`T0:`, `B:`) map directly. A bare `T:` reports the
/// currently selected tool and overrides any keyed reading for it; the
/// bare key itself never appears in the snapshot.
pub fn canonicalize(entries: &[RawReading], current_tool: u8) -> TemperatureSnapshot {
    let mut snapshot = TemperatureSnapshot::new();
    let mut bare: Option<TemperatureReading> = None;

    for entry in entries {
        if entry.key == "T" {
            bare = Some(entry.reading);
        } else if let Some(key) = HeaterKey::parse(&entry.key) {
            snapshot.insert(key, entry.reading);
        }
    }

    if let Some(reading) = bare {
        snapshot.insert(HeaterKey::Tool(current_tool), reading);
    }

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_for_non_temperature_lines() {
        assert!(parse_report("ok").is_empty());
        assert!(parse_report("echo:busy: processing").is_empty());
        // A tool-change echo is not a report
        assert!(parse_report("echo:Active Extruder: 1").is_empty());
    }

    #[test]
    fn parses_actual_and_target() {
        let entries = parse_report("ok T:210.0 /210.0 B:60.0 /60.0");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "T");
        assert_eq!(entries[0].reading, TemperatureReading::new(210.0, 210.0));
        assert_eq!(entries[1].key, "B");
        assert_eq!(entries[1].reading, TemperatureReading::new(60.0, 60.0));
    }

    #[test]
    fn target_is_optional() {
        let entries = parse_report("T:203.7");
        assert_eq!(entries[0].reading, TemperatureReading::actual_only(203.7));
    }

    #[test]
    fn bare_tool_goes_to_current_tool_and_wins() {
        // With tool 1 selected, the bare T: reading belongs to T1 even
        // though the report also carries a keyed T1 entry
        let entries =
            parse_report("ok T:210.0 /210.0 B:60.0 /60.0 T0:210.0 /210.0 T1:25.0 /0.0");
        let snapshot = canonicalize(&entries, 1);

        assert_eq!(
            snapshot.get(&HeaterKey::Tool(1)),
            Some(&TemperatureReading::new(210.0, 210.0))
        );
        assert_eq!(
            snapshot.get(&HeaterKey::Tool(0)),
            Some(&TemperatureReading::new(210.0, 210.0))
        );
        assert_eq!(
            snapshot.get(&HeaterKey::Bed),
            Some(&TemperatureReading::new(60.0, 60.0))
        );
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn lone_bare_tool_maps_to_current_tool() {
        // Smoothieware during a single-extruder M109 heat-wait
        let entries = parse_report("T:142.5 /210.0 @:255");
        let snapshot = canonicalize(&entries, 0);
        assert_eq!(
            snapshot.get(&HeaterKey::Tool(0)),
            Some(&TemperatureReading::new(142.5, 210.0))
        );
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn negative_readings_survive() {
        // A disconnected thermistor can report below zero
        let entries = parse_report("T:-14.9 /0.0");
        assert_eq!(entries[0].reading.actual, -14.9);
    }
}
