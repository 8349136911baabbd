//! Static GCODE analyzer
//!
//! Cold-reads a program and simulates it under an idealized kinematic
//! model to produce total print time, extrusion length, material volume,
//! mass, and cost figures, plus an optional per-layer geometry trace.
//! Runs without a printer attached and never touches the print engine.

use crate::command::CommandCode;
use crate::kinematics::{KinematicState, INCH_SCALE};
use crate::parser::ModelError;
use crate::program::Program;
use printkit_core::{AnalyzerError, Position, ProgressCallback, Result};
use printkit_settings::{Config, FilamentSettings, PrinterSettings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often the progress callback fires, in input lines
const PROGRESS_STRIDE: usize = 1000;

/// Z jumps larger than this that land below [`HOMING_Z_FLOOR`] are treated
/// as homing artifacts and ignored for motion accounting
const HOMING_Z_SPIKE_MM: f64 = 5.0;
const HOMING_Z_FLOOR_MM: f64 = 1.0;

/// Analyzer options
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOptions {
    /// Record the per-layer path trace (costs memory on large files)
    pub with_layers: bool,
}

/// Kind of a traced path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Travel without extrusion
    Move,
    /// XY motion while extruding
    Extrude,
    /// Filament pulled back (or re-primed) without table motion
    Retract,
}

/// One traced path segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSegment {
    /// Segment classification
    pub kind: SegmentKind,
    /// Start point
    pub from: Position,
    /// End point
    pub to: Position,
    /// Index of the layer this segment belongs to
    pub layer: usize,
}

/// All segments printed at one Z height
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Z height of the layer in mm
    pub z: f64,
    /// Traced segments, in stream order
    pub segments: Vec<PathSegment>,
}

/// Result of a completed analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Total move time in seconds (XY travel plus dwells)
    pub total_time_secs: f64,
    /// Total filament extruded, in mm
    pub filament_mm: f64,
    /// Extruded material volume in cm^3
    pub volume_cm3: f64,
    /// Extruded material mass in grams
    pub mass_g: f64,
    /// Estimated material cost, when cost parameters are configured
    pub cost: Option<f64>,
    /// Simulated time after each program slot, for remaining-time estimates
    pub cumulative_time: Vec<f32>,
    /// Per-layer trace, when requested
    pub layers: Option<Vec<Layer>>,
    /// G/M codes the simulation does not model, each recorded once
    pub unknown_codes: BTreeSet<String>,
    /// Slicer-reported mesh defects found in the file
    pub model_errors: Vec<ModelError>,
}

impl AnalysisResult {
    /// Total move time as a [`Duration`]
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_time_secs.max(0.0))
    }

    /// Simulated seconds remaining after the given program slot
    pub fn remaining_after(&self, line_number: usize) -> f64 {
        let done = self
            .cumulative_time
            .get(line_number)
            .copied()
            .unwrap_or(self.total_time_secs as f32) as f64;
        (self.total_time_secs - done).max(0.0)
    }
}

/// Outcome of an analysis run
#[derive(Debug, Clone)]
pub enum AnalysisOutcome {
    /// The whole program was simulated
    Completed(Box<AnalysisResult>),
    /// The cancellation flag was raised; partial figures are discarded
    Aborted,
}

impl AnalysisOutcome {
    /// The result, if the run completed
    pub fn completed(self) -> Option<AnalysisResult> {
        match self {
            AnalysisOutcome::Completed(result) => Some(*result),
            AnalysisOutcome::Aborted => None,
        }
    }
}

/// M-codes the simulation knowingly ignores (host- or heater-side effects
/// with no kinematic impact)
const BENIGN_M_CODES: &[u16] = &[
    0, 1, 17, 18, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 80, 81, 84, 92, 104, 105, 106, 107,
    108, 109, 110, 113, 114, 115, 117, 140, 155, 190, 220, 221, 400,
];

/// Analyze a GCODE file from disk
///
/// A missing or unreadable file surfaces immediately; everything else is
/// simulated. See [`analyze_program`].
pub fn analyze_file(
    path: impl AsRef<Path>,
    config: &Config,
    options: &AnalyzerOptions,
    progress: Option<ProgressCallback>,
    abort: Option<&AtomicBool>,
) -> Result<AnalysisOutcome> {
    let path = path.as_ref();
    let program = Program::load(path).map_err(|e| AnalyzerError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(analyze_program(
        &program,
        &config.printer,
        &config.filament,
        options,
        progress,
        abort,
    ))
}

/// Simulate a loaded program
///
/// Deterministic in the program bytes and the configuration. The progress
/// callback fires every 1000 input lines with the fraction completed and
/// once more with 1.0 at the end. The abort flag is polled once per line;
/// when raised the run stops cleanly and returns
/// [`AnalysisOutcome::Aborted`].
pub fn analyze_program(
    program: &Program,
    printer: &PrinterSettings,
    filament: &FilamentSettings,
    options: &AnalyzerOptions,
    progress: Option<ProgressCallback>,
    abort: Option<&AtomicBool>,
) -> AnalysisOutcome {
    let mut state = KinematicState::default();
    let mut total_time = 0.0f64;
    let mut filament_mm = 0.0f64;
    let mut cumulative_time = Vec::with_capacity(program.len());
    let mut unknown_codes = BTreeSet::new();
    let mut trace = options.with_layers.then(LayerTrace::new);

    let total = program.len();
    for (i, slot) in program.iter().enumerate() {
        if let Some(flag) = abort {
            if flag.load(Ordering::Relaxed) {
                tracing::debug!("analysis aborted at line {}/{}", i, total);
                return AnalysisOutcome::Aborted;
            }
        }
        if i > 0 && i % PROGRESS_STRIDE == 0 {
            if let Some(cb) = progress.as_ref() {
                cb(i as f64 / total as f64);
            }
        }

        let line = &slot.parsed;
        match line.code {
            CommandCode::G(0) | CommandCode::G(1) => {
                let (seconds, extruded) = simulate_move(&mut state, line, trace.as_mut());
                total_time += seconds;
                filament_mm += extruded;
            }
            CommandCode::G(4) => {
                if let Some(s) = line.param('S') {
                    total_time += s.max(0.0);
                } else if let Some(p) = line.param('P') {
                    total_time += (p / 1000.0).max(0.0);
                }
            }
            CommandCode::G(20) => state.unit_scale = INCH_SCALE,
            CommandCode::G(21) => state.unit_scale = 1.0,
            CommandCode::G(28) => home(&mut state, line, printer),
            CommandCode::G(90) => state.relative = false,
            CommandCode::G(91) => state.relative = true,
            CommandCode::G(92) => rezero(&mut state, line),
            CommandCode::M(82) => state.relative_e = false,
            CommandCode::M(83) => state.relative_e = true,
            CommandCode::M(n) => {
                if !BENIGN_M_CODES.contains(&n) {
                    unknown_codes.insert(format!("M{}", n));
                }
            }
            CommandCode::G(n) => {
                unknown_codes.insert(format!("G{}", n));
            }
            CommandCode::T(n) => state.switch_tool(n, printer),
            CommandCode::Unknown => {}
        }

        cumulative_time.push(total_time as f32);
    }

    if let Some(cb) = progress.as_ref() {
        cb(1.0);
    }

    let diameter = program.filament_diameter_hint.unwrap_or(filament.diameter_mm);
    let radius = diameter / 2.0;
    let volume_cm3 = filament_mm * std::f64::consts::PI * radius * radius / 1000.0;
    let mass_g = volume_cm3 * filament.density_g_cm3;

    let mut cost = None;
    if let Some(per_kg) = filament.cost_per_kg {
        cost = Some(mass_g * per_kg / 1000.0);
    }
    if let Some(per_m) = filament.cost_per_m {
        cost = Some(cost.unwrap_or(0.0) + filament_mm * per_m / 1000.0);
    }

    if !unknown_codes.is_empty() {
        tracing::debug!("codes not modeled by the simulation: {:?}", unknown_codes);
    }

    AnalysisOutcome::Completed(Box::new(AnalysisResult {
        total_time_secs: total_time,
        filament_mm,
        volume_cm3,
        mass_g,
        cost,
        cumulative_time,
        layers: trace.map(LayerTrace::finish),
        unknown_codes,
        model_errors: program.model_errors.clone(),
    }))
}

/// Apply a `G0`/`G1` move; returns (seconds, mm extruded)
fn simulate_move(
    state: &mut KinematicState,
    line: &crate::GcodeLine,
    trace: Option<&mut LayerTrace>,
) -> (f64, f64) {
    if let Some(f) = line.param('F') {
        if f > 0.0 {
            state.feedrate = f * state.unit_scale;
        }
    }

    let from = state.position;
    let mut to = from;
    if let Some(x) = line.param('X') {
        to.x = state.axis_target(from.x, state.offset.x, x);
    }
    if let Some(y) = line.param('Y') {
        to.y = state.axis_target(from.y, state.offset.y, y);
    }
    if let Some(z) = line.param('Z') {
        let target = state.axis_target(from.z, state.offset.z, z);
        // A huge drop to near-zero right after homing is an artifact of
        // slicer prologues, not a real move
        if (target - from.z).abs() > HOMING_Z_SPIKE_MM && target < HOMING_Z_FLOOR_MM {
            tracing::debug!("clamping spurious Z move {} -> {}", from.z, target);
        } else {
            to.z = target;
        }
    }

    let mut extruded = 0.0;
    if let Some(e) = line.param('E') {
        to.e = state.e_target(e);
        let delta = to.e - from.e;
        if delta > 0.0 {
            extruded = delta;
        }
    }

    let distance = from.xy_distance(&to);
    let seconds = if distance > 0.0 && state.feedrate > 0.0 {
        distance / (state.feedrate / 60.0)
    } else {
        0.0
    };

    if let Some(trace) = trace {
        trace.record(from, to, to.e - from.e, distance);
    }

    state.position = to;
    (seconds, extruded)
}

/// Apply `G28`: requested axes (all when none given) jump to the home
/// position and lose their `G92` offset
///
/// Firmware accepts both `G28 X` and `G28 X0`, so axis presence is read
/// off the raw text rather than the parameter list.
fn home(state: &mut KinematicState, line: &crate::GcodeLine, printer: &PrinterSettings) {
    let tail: String = line.body.chars().skip(3).collect::<String>().to_ascii_uppercase();
    let wants = |axis: char| tail.contains(axis);
    let any_axis = wants('X') || wants('Y') || wants('Z');
    let (home_x, home_y, home_z) = printer.home_position();
    if !any_axis || wants('X') {
        state.position.x = home_x;
        state.offset.x = 0.0;
    }
    if !any_axis || wants('Y') {
        state.position.y = home_y;
        state.offset.y = 0.0;
    }
    if !any_axis || wants('Z') {
        state.position.z = home_z;
        state.offset.z = 0.0;
    }
}

/// Apply `G92`: the current physical position becomes the commanded
/// logical coordinate for every axis given
fn rezero(state: &mut KinematicState, line: &crate::GcodeLine) {
    let scale = state.unit_scale;
    let position = state.position;
    if let Some(x) = line.param('X') {
        KinematicState::rezero_axis(&mut state.offset.x, position.x, x, scale);
    }
    if let Some(y) = line.param('Y') {
        KinematicState::rezero_axis(&mut state.offset.y, position.y, y, scale);
    }
    if let Some(z) = line.param('Z') {
        KinematicState::rezero_axis(&mut state.offset.z, position.z, z, scale);
    }
    if let Some(e) = line.param('E') {
        KinematicState::rezero_axis(&mut state.offset.e, position.e, e, scale);
    }
}

/// Accumulates the per-layer path trace during simulation
struct LayerTrace {
    layers: Vec<Layer>,
}

impl LayerTrace {
    fn new() -> Self {
        Self { layers: Vec::new() }
    }

    fn record(&mut self, from: Position, to: Position, delta_e: f64, xy_distance: f64) {
        let kind = if delta_e > 0.0 && xy_distance > 0.0 {
            SegmentKind::Extrude
        } else if delta_e < 0.0 || (delta_e > 0.0 && xy_distance == 0.0) {
            SegmentKind::Retract
        } else {
            SegmentKind::Move
        };

        if kind == SegmentKind::Extrude {
            let new_layer = match self.layers.last() {
                Some(layer) => (layer.z - to.z).abs() > 1e-6,
                None => true,
            };
            if new_layer {
                self.layers.push(Layer {
                    z: to.z,
                    segments: Vec::new(),
                });
            }
        } else if self.layers.is_empty() {
            // Travel before the first extrusion belongs to a provisional
            // bottom layer
            self.layers.push(Layer {
                z: to.z,
                segments: Vec::new(),
            });
        }

        let layer = self.layers.len() - 1;
        self.layers[layer].segments.push(PathSegment {
            kind,
            from,
            to,
            layer,
        });
    }

    fn finish(self) -> Vec<Layer> {
        self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(text: &str) -> AnalysisResult {
        analyze_with(text, &AnalyzerOptions::default())
    }

    fn analyze_with(text: &str, options: &AnalyzerOptions) -> AnalysisResult {
        let program = Program::from_text(text).unwrap();
        analyze_program(
            &program,
            &PrinterSettings::default(),
            &FilamentSettings::default(),
            options,
            None,
            None,
        )
        .completed()
        .expect("analysis completed")
    }

    #[test]
    fn absolute_moves_accumulate_time_without_extrusion() {
        let result = analyze("G21\nG90\nG1 X10 F600\nG1 X20\n");
        assert!((result.total_time_secs - 2.0).abs() < 1e-6);
        assert_eq!(result.filament_mm, 0.0);
        assert!(result.unknown_codes.is_empty());
    }

    #[test]
    fn relative_moves_accumulate_time_and_extrusion() {
        let result = analyze("G21\nG91\nG1 X10 E1 F6000\nG1 X10 E1\n");
        assert!((result.total_time_secs - 0.2).abs() < 1e-6);
        assert!((result.filament_mm - 2.0).abs() < 1e-9);
    }

    #[test]
    fn long_flat_move_with_extrusion() {
        let result = analyze("G21\nG1 X0 Y0 E0 F3000\nG1 X100 Y0 E5\n");
        assert!((result.filament_mm - 5.0).abs() < 1e-9);
        assert!((result.total_time_secs - 2.0).abs() < 1e-6);
        assert!(result.unknown_codes.is_empty());
    }

    #[test]
    fn dwell_adds_seconds_and_milliseconds() {
        let result = analyze("G4 S10\nG4 P500\n");
        assert!((result.total_time_secs - 10.5).abs() < 1e-9);
    }

    #[test]
    fn inch_mode_scales_distances_and_feedrates() {
        // F600 in inch mode is 15240 mm/min; 1 inch at that rate is 0.1 s
        let result = analyze("G20\nG90\nG1 X1 F600\n");
        assert!((result.total_time_secs - 0.1).abs() < 1e-6);
    }

    #[test]
    fn g92_snaps_extrusion_accounting() {
        let result = analyze("G21\nG91\nG1 X10 E1 F6000\nG92 E0\nG90\nM82\nG1 X20 E1\n");
        // 1 mm relative, then absolute 1 mm measured from the snap
        assert!((result.filament_mm - 2.0).abs() < 1e-9);
    }

    #[test]
    fn retraction_is_not_extrusion() {
        let result = analyze("G21\nG91\nG1 E-2 F1800\nG1 E2\nG1 X10 E1 F6000\n");
        // -2 ignored, +2 re-prime counts, +1 while moving counts
        assert!((result.filament_mm - 3.0).abs() < 1e-9);
    }

    #[test]
    fn spurious_z_drop_is_clamped() {
        // Z sits at 20 then a prologue glitch commands Z0.1
        let result = analyze("G21\nG90\nG1 Z20 F600\nG1 Z0.1\nG1 Z19\n");
        // The glitch is ignored; motion time only covers XY, so just check
        // the unknown set stayed empty and the run completed
        assert!(result.unknown_codes.is_empty());
    }

    #[test]
    fn homing_resets_requested_axes_only() {
        let result = analyze("G21\nG90\nG1 X10 Y10 F600\nG28 X\nG1 X10 F600\n");
        // Diagonal out, X-only home, then 10 mm back out along X
        let expected = (200.0_f64).sqrt() / 10.0 + 10.0 / 10.0;
        assert!((result.total_time_secs - expected).abs() < 1e-6);
    }

    #[test]
    fn unknown_codes_are_collected_once() {
        let result = analyze("G1 X5 F600\nM42 P13 S255\nM42 P13 S0\nG29\n");
        assert!(result.unknown_codes.contains("M42"));
        assert!(result.unknown_codes.contains("G29"));
        assert_eq!(result.unknown_codes.len(), 2);
    }

    #[test]
    fn abort_flag_stops_the_run() {
        let program = Program::from_text("G1 X10 F600\nG1 X20\n").unwrap();
        let flag = AtomicBool::new(true);
        let outcome = analyze_program(
            &program,
            &PrinterSettings::default(),
            &FilamentSettings::default(),
            &AnalyzerOptions::default(),
            None,
            Some(&flag),
        );
        assert!(matches!(outcome, AnalysisOutcome::Aborted));
    }

    #[test]
    fn progress_reaches_one() {
        let program = Program::from_text("G1 X10 F600\n").unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback =
            std::sync::Arc::new(move |f: f64| sink.lock().unwrap().push(f));
        analyze_program(
            &program,
            &PrinterSettings::default(),
            &FilamentSettings::default(),
            &AnalyzerOptions::default(),
            Some(cb),
            None,
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[test]
    fn volume_and_mass_derive_from_extrusion() {
        let result = analyze("G21\nG91\nG1 X100 E100 F6000\n");
        let radius: f64 = 1.75 / 2.0;
        let expected_volume = 100.0 * std::f64::consts::PI * radius * radius / 1000.0;
        assert!((result.volume_cm3 - expected_volume).abs() < 1e-9);
        assert!((result.mass_g - expected_volume * 1.25).abs() < 1e-9);
        assert_eq!(result.cost, None);
    }

    #[test]
    fn cost_reports_configured_components() {
        let program = Program::from_text("G21\nG91\nG1 X100 E1000 F6000\n").unwrap();
        let filament = FilamentSettings {
            cost_per_kg: Some(20.0),
            cost_per_m: Some(0.05),
            ..FilamentSettings::default()
        };
        let result = analyze_program(
            &program,
            &PrinterSettings::default(),
            &filament,
            &AnalyzerOptions::default(),
            None,
            None,
        )
        .completed()
        .unwrap();
        let expected = result.mass_g * 20.0 / 1000.0 + 1000.0 * 0.05 / 1000.0;
        assert!((result.cost.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn cumulative_time_tracks_each_slot() {
        let result = analyze("G21\nG90\nG1 X10 F600\nG1 X20\n");
        assert_eq!(result.cumulative_time.len(), 5);
        // Nothing has moved after the mode lines
        assert_eq!(result.cumulative_time[2], 0.0);
        assert!((result.cumulative_time[3] - 1.0).abs() < 1e-6);
        assert!((result.cumulative_time[4] - 2.0).abs() < 1e-6);
        assert!((result.remaining_after(3) - 1.0).abs() < 1e-6);
        assert_eq!(result.remaining_after(4), 0.0);
    }

    #[test]
    fn layer_trace_groups_by_z() {
        let text = "G21\nG90\nG1 Z0.2 F600\nG1 X10 E1\nG1 Y10 E2\nG1 Z0.4\nG1 X0 E3\n";
        let options = AnalyzerOptions { with_layers: true };
        let result = analyze_with(text, &options);
        let layers = result.layers.unwrap();
        assert_eq!(layers.len(), 2);
        assert!((layers[0].z - 0.2).abs() < 1e-9);
        assert!((layers[1].z - 0.4).abs() < 1e-9);
        assert!(layers[0]
            .segments
            .iter()
            .any(|s| s.kind == SegmentKind::Extrude));
    }
}
