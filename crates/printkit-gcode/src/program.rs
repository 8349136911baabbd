//! Immutable GCODE program model
//!
//! A program is loaded once, gets `M110 N0` injected at slot 0 so that
//! firmware line numbering starts at 1, and is never mutated afterwards.
//! A resend rewinds the engine's cursor, never the program.

use crate::parser::{parse_line, ModelError, Pragma};
use crate::GcodeLine;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use printkit_core::{GcodeError, Result};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

/// One slot of a loaded program
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramLine {
    /// Parsed record; `parsed.type_tag` carries the `;TYPE:` tag in effect
    pub parsed: GcodeLine,
    /// 1-based line number in the source file (slot 0 has none)
    pub source_line: Option<usize>,
}

impl ProgramLine {
    /// The text that goes on the wire for this slot
    pub fn body(&self) -> &str {
        &self.parsed.body
    }
}

/// An immutable, ordered GCODE program prepared for streaming
///
/// Slot 0 is the injected `M110 N0` line-counter reset; slots 1..n are the
/// source statements in order, including empty ones (the engine skips those
/// at send time so the numbering the firmware sees stays dense).
#[derive(Debug, Clone)]
pub struct Program {
    lines: Arc<[ProgramLine]>,
    /// Filament diameter from a `;CURA_PROFILE_STRING` pragma, if present
    pub filament_diameter_hint: Option<f64>,
    /// Slicer-reported mesh defects found in the file
    pub model_errors: Vec<ModelError>,
}

impl Program {
    /// Load a program from a file on disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| GcodeError::FileError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_text(&text)
    }

    /// Build a program from source text
    pub fn from_text(text: &str) -> Result<Self> {
        let mut lines: Vec<ProgramLine> = Vec::with_capacity(text.lines().count() + 1);

        // Slot 0: reset the firmware line counter
        let reset = parse_line("M110 N0");
        lines.push(ProgramLine {
            parsed: reset.line,
            source_line: None,
        });

        let mut active_tag: Option<String> = None;
        let mut filament_diameter_hint = None;
        let mut model_errors = Vec::new();
        let mut sendable = 0usize;

        for (i, raw) in text.lines().enumerate() {
            let mut parsed = parse_line(raw);
            match parsed.pragma.take() {
                Some(Pragma::TypeTag(tag)) => active_tag = Some(tag),
                Some(Pragma::ModelError(err)) => model_errors.push(err),
                Some(Pragma::CuraProfile(payload)) => {
                    if let Some(d) = decode_cura_filament_diameter(&payload) {
                        filament_diameter_hint = Some(d);
                    }
                }
                None => {}
            }

            let mut line = parsed.line;
            if !line.is_empty() {
                line.type_tag = active_tag.clone();
                sendable += 1;
            }
            lines.push(ProgramLine {
                parsed: line,
                source_line: Some(i + 1),
            });
        }

        if sendable == 0 {
            return Err(GcodeError::EmptyProgram.into());
        }

        Ok(Self {
            lines: lines.into(),
            filament_diameter_hint,
            model_errors,
        })
    }

    /// Total number of slots, including the injected slot 0
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the program has no source lines (never true once loaded)
    pub fn is_empty(&self) -> bool {
        self.lines.len() <= 1
    }

    /// Highest firmware line number; equal to the number of source lines
    pub fn last_line_number(&self) -> usize {
        self.lines.len() - 1
    }

    /// Slot by firmware line number (0 is the injected reset)
    pub fn line(&self, number: usize) -> Option<&ProgramLine> {
        self.lines.get(number)
    }

    /// Iterate all slots in order
    pub fn iter(&self) -> impl Iterator<Item = &ProgramLine> {
        self.lines.iter()
    }
}

/// Extract `filament_diameter` from a base64+zlib Cura profile payload
///
/// The profile is a key=value list; Cura separates entries with either
/// newlines or `\x08`. Only the diameter is of interest here.
fn decode_cura_filament_diameter(payload: &str) -> Option<f64> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .ok()?;
    let mut decoder = ZlibDecoder::new(compressed.as_slice());
    let mut profile = String::new();
    decoder.read_to_string(&mut profile).ok()?;

    for entry in profile.split(['\n', '\x08']) {
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if key.trim() == "filament_diameter" {
            match value.trim().parse::<f64>() {
                Ok(d) if d > 0.0 => return Some(d),
                _ => {
                    tracing::warn!("Ignoring unparseable filament_diameter: {:?}", value);
                    return None;
                }
            }
        }
    }
    None
}
