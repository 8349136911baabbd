//! GCODE line parser
//!
//! Splits a raw source line into the canonical [`GcodeLine`] record plus
//! any slicer pragma carried in its comment. Parsing never fails: lines
//! the scanner cannot classify are marked [`CommandCode::Unknown`] and
//! keep their cleaned text for verbatim transmission.

use crate::command::{CommandCode, GcodeLine, INT_LETTERS, PARAM_LETTERS};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A slicer annotation recognized in a line comment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pragma {
    /// `;TYPE:<tag>`: semantic role for the following lines
    TypeTag(String),
    /// `;Model error(<kind>): (<x>,<y>,<z>) (<x>,<y>,<z>)`
    ModelError(ModelError),
    /// `;CURA_PROFILE_STRING:<base64>`: zlib-compressed slicer profile
    CuraProfile(String),
}

/// A slicer-reported mesh defect marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelError {
    /// The error kind inside the parentheses
    pub kind: String,
    /// First endpoint of the defective edge
    pub from: (f64, f64, f64),
    /// Second endpoint of the defective edge
    pub to: (f64, f64, f64),
}

/// Result of parsing one raw source line
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    /// The canonical line record
    pub line: GcodeLine,
    /// Pragma found in the comment, if any
    pub pragma: Option<Pragma>,
}

fn code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([GMTgmt])(\d+)").expect("invalid regex pattern"))
}

fn param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([A-Za-z])\s*([-+]?\d*\.?\d+)").expect("invalid regex pattern")
    })
}

fn model_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            ^Model\ error\(([^)]*)\):\s*
            \(\s*(-?\d*\.?\d+)\s*,\s*(-?\d*\.?\d+)\s*,\s*(-?\d*\.?\d+)\s*\)\s*
            \(\s*(-?\d*\.?\d+)\s*,\s*(-?\d*\.?\d+)\s*,\s*(-?\d*\.?\d+)\s*\)",
        )
        .expect("invalid regex pattern")
    })
}

/// Parse a raw source line into a [`ParsedLine`]
///
/// The procedure follows firmware conventions:
/// 1. Trailing whitespace and `\r\n` are stripped.
/// 2. The comment after the first `;` is separated; pragmas are extracted.
/// 3. The leading token is matched as `G<n>`, `M<n>`, or `T<n>`.
/// 4. Filename-tailed M-codes (`M23`, `M28`, `M30`) keep their tail as
///    free text.
/// 5. Everything else is scanned for `<letter><signed number>` parameters.
pub fn parse_line(raw: &str) -> ParsedLine {
    let stripped = raw.trim_end();

    let (text, comment) = match stripped.find(';') {
        Some(pos) => (
            stripped[..pos].trim_end(),
            Some(stripped[pos + 1..].to_string()),
        ),
        None => (stripped, None),
    };
    let body = text.trim().to_string();

    let pragma = comment.as_deref().and_then(parse_pragma);

    let mut line = GcodeLine {
        code: CommandCode::Unknown,
        params: Vec::new(),
        raw_param: None,
        type_tag: None,
        comment,
        body,
    };

    if line.body.is_empty() {
        return ParsedLine { line, pragma };
    }

    let Some(caps) = code_regex().captures(&line.body) else {
        return ParsedLine { line, pragma };
    };
    let letter = caps[1].chars().next().unwrap_or('?').to_ascii_uppercase();
    let number: u32 = caps[2].parse().unwrap_or(0);
    line.code = match letter {
        'G' => CommandCode::G(number as u16),
        'M' => CommandCode::M(number as u16),
        'T' => CommandCode::T(number.min(u8::MAX as u32) as u8),
        _ => CommandCode::Unknown,
    };

    let tail = line.body[caps[0].len()..].trim().to_string();

    // Filename-style M-codes carry everything after the code verbatim
    if matches!(line.code, CommandCode::M(23) | CommandCode::M(28) | CommandCode::M(30)) {
        if !tail.is_empty() {
            line.raw_param = Some(tail);
        }
        return ParsedLine { line, pragma };
    }

    for caps in param_regex().captures_iter(&tail) {
        let letter = caps[1].chars().next().unwrap_or('?').to_ascii_uppercase();
        if !PARAM_LETTERS.contains(&letter) {
            continue;
        }
        let value: f64 = match caps[2].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let value = if INT_LETTERS.contains(&letter) {
            value.trunc()
        } else {
            value
        };
        line.params.push((letter, value));
    }

    ParsedLine { line, pragma }
}

/// Recognize slicer pragmas in a stripped comment
fn parse_pragma(comment: &str) -> Option<Pragma> {
    let comment = comment.trim_start();

    if let Some(tag) = comment.strip_prefix("TYPE:") {
        let tag = tag.trim();
        if !tag.is_empty() {
            return Some(Pragma::TypeTag(tag.to_string()));
        }
        return None;
    }

    if let Some(payload) = comment.strip_prefix("CURA_PROFILE_STRING:") {
        let payload = payload.trim();
        if !payload.is_empty() {
            return Some(Pragma::CuraProfile(payload.to_string()));
        }
        return None;
    }

    if let Some(caps) = model_error_regex().captures(comment) {
        let coord = |i: usize| caps[i].parse::<f64>().unwrap_or(0.0);
        return Some(Pragma::ModelError(ModelError {
            kind: caps[1].to_string(),
            from: (coord(2), coord(3), coord(4)),
            to: (coord(5), coord(6), coord(7)),
        }));
    }

    None
}
