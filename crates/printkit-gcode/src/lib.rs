//! # printkit GCODE
//!
//! GCODE handling for printkit: the line codec, wire framing with
//! line-number checksums, the immutable program model prepared for
//! streaming, and the static analyzer that estimates print time and
//! material usage without a printer attached.

pub mod analyzer;
pub mod command;
pub mod framing;
pub mod kinematics;
pub mod parser;
pub mod program;

pub use analyzer::{
    analyze_file, analyze_program, AnalysisOutcome, AnalysisResult, AnalyzerOptions, Layer,
    PathSegment, SegmentKind,
};
pub use command::{CommandCode, GcodeLine};
pub use framing::{checksum, frame};
pub use kinematics::KinematicState;
pub use parser::{parse_line, ModelError, ParsedLine, Pragma};
pub use program::{Program, ProgramLine};
