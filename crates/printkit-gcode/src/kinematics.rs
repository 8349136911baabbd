//! Kinematic state shared by the analyzer
//!
//! Tracks the machine model a GCODE stream mutates as it executes:
//! position, distance modes, unit scale, feedrate, active tool, and the
//! `G92` coordinate offset.

use printkit_core::Position;
use printkit_settings::PrinterSettings;

/// Millimeters per unit when `G20` (inches) is active
pub const INCH_SCALE: f64 = 25.4;

/// The simulated machine state
#[derive(Debug, Clone)]
pub struct KinematicState {
    /// Physical position (X, Y, Z in mm; E is the logical filament coordinate)
    pub position: Position,
    /// Offset installed by `G92`: physical = offset + commanded * scale
    pub offset: Position,
    /// `G91` relative positioning active
    pub relative: bool,
    /// `M83` relative extrusion active
    pub relative_e: bool,
    /// 1.0 for mm (`G21`), 25.4 for inches (`G20`)
    pub unit_scale: f64,
    /// Current feedrate in mm/min; 0 until the stream sets one
    pub feedrate: f64,
    /// Active tool index
    pub tool: u8,
}

impl Default for KinematicState {
    fn default() -> Self {
        Self {
            position: Position::default(),
            offset: Position::default(),
            relative: false,
            relative_e: false,
            unit_scale: 1.0,
            feedrate: 0.0,
            tool: 0,
        }
    }
}

impl KinematicState {
    /// Target for one axis given the commanded value and the active mode
    pub fn axis_target(&self, current: f64, offset: f64, commanded: f64) -> f64 {
        if self.relative {
            current + commanded * self.unit_scale
        } else {
            offset + commanded * self.unit_scale
        }
    }

    /// Target E coordinate given the commanded value and the E mode
    pub fn e_target(&self, commanded: f64) -> f64 {
        if self.relative || self.relative_e {
            self.position.e + commanded * self.unit_scale
        } else {
            self.offset.e + commanded * self.unit_scale
        }
    }

    /// Install a `G92` offset for one axis: the current physical position
    /// becomes the commanded logical coordinate
    pub fn rezero_axis(offset: &mut f64, physical: f64, commanded: f64, scale: f64) {
        *offset = physical - commanded * scale;
    }

    /// Switch tools, migrating the position between tool offsets
    pub fn switch_tool(&mut self, new_tool: u8, printer: &PrinterSettings) {
        let (old_x, old_y) = printer.tool_offset(self.tool);
        let (new_x, new_y) = printer.tool_offset(new_tool);
        self.position.x = self.position.x - old_x + new_x;
        self.position.y = self.position.y - old_y + new_y;
        self.tool = new_tool;
    }
}
