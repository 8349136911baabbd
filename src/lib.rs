//! # printkit
//!
//! A Rust-based 3D printer host core:
//! - GCODE print streaming over serial for Marlin/Repetier-family firmware
//! - Stop-and-wait protocol with line-number checksums and resend recovery
//! - Static GCODE analysis: print time, filament usage, mass and cost
//!
//! ## Architecture
//!
//! printkit is organized as a workspace with multiple crates:
//!
//! 1. **printkit-core** - Core types, states, errors, listener interface
//! 2. **printkit-settings** - Configuration with TOML/JSON persistence
//! 3. **printkit-gcode** - Line codec, framing, program model, analyzer
//! 4. **printkit-communication** - Serial transport, firmware flavors, the
//!    print engine
//! 5. **printkit** - Binary embedding the engine and analyzer behind a CLI

#![allow(dead_code)]

pub use printkit_core::{
    AbortFlag, AnalyzerError, ConnectionError, Error, GcodeError, HeaterKey, JobProgress,
    LogDirection, LogEntry, Position, PrinterListener, PrinterListenerHandle, PrinterState,
    ProgressCallback, ProtocolError, Result, TemperatureReading, TemperatureSample,
    TemperatureSnapshot,
};

pub use printkit_settings::{
    Config, ConnectionSettings, FilamentSettings, PrinterSettings, ProtocolSettings,
};

pub use printkit_gcode::{
    analyze_file, analyze_program, checksum, frame, parse_line, AnalysisOutcome, AnalysisResult,
    AnalyzerOptions, CommandCode, GcodeLine, Layer, PathSegment, Program, SegmentKind,
};

pub use printkit_communication::{
    list_ports, FirmwareDetector, FirmwareFlavor, FirmwareKind, PrintEngine, PrinterSnapshot,
    SerialPortInfo, SerialTransport, Transport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Initialize logging with the default configuration
///
/// Sets up structured logging with:
/// - Console output on stderr
/// - RUST_LOG environment variable support
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let fmt_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
