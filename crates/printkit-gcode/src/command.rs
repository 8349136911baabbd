//! Canonical GCODE line record
//!
//! A parsed line keeps the cleaned source text alongside advisory metadata
//! (code, parameters, pragma tags). Transmission always uses the cleaned
//! text so that syntactically bad lines go out verbatim and the firmware's
//! resend path deals with them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parameter letters recognized by the scanner, in firmware convention
pub const PARAM_LETTERS: &[char] = &['X', 'Y', 'Z', 'E', 'F', 'S', 'P', 'R', 'I', 'J', 'N'];

/// Letters whose values are integral (the rest parse as floats)
pub const INT_LETTERS: &[char] = &['F', 'N', 'T'];

/// The command word of a GCODE line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandCode {
    /// `G<n>` motion/setting commands
    G(u16),
    /// `M<n>` machine commands
    M(u16),
    /// `T<n>` tool selection
    T(u8),
    /// Anything the scanner could not classify; sent verbatim
    Unknown,
}

impl CommandCode {
    /// Whether this is a specific G code
    pub fn is_g(&self, n: u16) -> bool {
        matches!(self, CommandCode::G(g) if *g == n)
    }

    /// Whether this is a specific M code
    pub fn is_m(&self, n: u16) -> bool {
        matches!(self, CommandCode::M(m) if *m == n)
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::G(n) => write!(f, "G{}", n),
            Self::M(n) => write!(f, "M{}", n),
            Self::T(n) => write!(f, "T{}", n),
            Self::Unknown => write!(f, "?"),
        }
    }
}

/// A parsed GCODE line
///
/// `params` preserves source order. `body` is the comment-stripped,
/// whitespace-trimmed original text; it is what goes on the wire and what
/// checksums are computed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcodeLine {
    /// Command word
    pub code: CommandCode,
    /// `(letter, value)` pairs in source order
    pub params: Vec<(char, f64)>,
    /// Free-text tail for filename-style M-codes (`M23 file.gco`)
    pub raw_param: Option<String>,
    /// Slicer `;TYPE:` tag in effect for this line
    pub type_tag: Option<String>,
    /// The stripped comment, retained only for analyzer pragmas
    pub comment: Option<String>,
    /// Cleaned source text, empty for comment-only lines
    pub body: String,
}

impl GcodeLine {
    /// An empty line (comment-only or blank in the source)
    pub fn empty() -> Self {
        Self {
            code: CommandCode::Unknown,
            params: Vec::new(),
            raw_param: None,
            type_tag: None,
            comment: None,
            body: String::new(),
        }
    }

    /// Whether there is anything to transmit
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Value of the first parameter with the given letter
    pub fn param(&self, letter: char) -> Option<f64> {
        self.params
            .iter()
            .find(|(l, _)| *l == letter)
            .map(|(_, v)| *v)
    }

    /// Whether the line carries the given parameter letter
    pub fn has_param(&self, letter: char) -> bool {
        self.params.iter().any(|(l, _)| *l == letter)
    }

    /// Body with the `F` parameter scaled by `ratio`
    ///
    /// Used by the feedrate-override subsystem before framing. Lines
    /// without an `F` parameter come back unchanged. The scaled value is
    /// rounded to the integer feedrates firmware expects.
    pub fn body_with_feedrate_ratio(&self, ratio: f64) -> String {
        let Some(feedrate) = self.param('F') else {
            return self.body.clone();
        };
        let scaled = (feedrate * ratio).round().max(1.0) as i64;

        let mut out = String::with_capacity(self.body.len() + 4);
        let mut chars = self.body.chars().peekable();
        while let Some(c) = chars.next() {
            if c == 'F' || c == 'f' {
                // Emit the scaled value and skip the old one
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_digit() || next == '.' || next == '-' || next == '+' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push('F');
                out.push_str(&scaled.to_string());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for GcodeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.body)
    }
}
