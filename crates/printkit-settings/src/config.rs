//! Configuration for the print engine and analyzer
//!
//! Provides configuration file handling and validation. Supports JSON and
//! TOML file formats stored in platform-specific directories.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (port, baud rates, probe timeouts)
//! - Protocol settings (ack/heartbeat timing, resend limits, history depth)
//! - Printer settings (bed geometry, homing origin, tool offsets)
//! - Filament settings (diameter, density, cost parameters)
//!
//! There are no global singletons; the engine and the analyzer each receive
//! an explicit `Config` (or the section they need) at construction.

use crate::error::{Result, SettingsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Serial connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Port device name, or `"Auto"` to autodetect
    pub port: String,
    /// Baud rate for serial connections; 0 probes `baud_candidates`
    pub baud_rate: u32,
    /// Candidate baud rates for autodetection, probed in order
    pub baud_candidates: Vec<u32>,
    /// Serial read timeout in milliseconds (kept short for loop liveness)
    pub read_timeout_ms: u64,
    /// How long an autodetect probe waits for a `T:` reply, in milliseconds
    pub probe_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: "Auto".to_string(),
            baud_rate: 115200,
            baud_candidates: vec![250000, 230400, 115200, 57600, 38400, 19200, 9600],
            read_timeout_ms: 1000,
            probe_timeout_ms: 2000,
        }
    }
}

impl ConnectionSettings {
    /// Whether port autodetection was requested
    pub fn is_auto_port(&self) -> bool {
        self.port.eq_ignore_ascii_case("auto")
    }
}

/// Stream protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Milliseconds of silence on an in-flight line before a heartbeat probe
    pub ack_timeout_ms: u64,
    /// Consecutive unanswered heartbeat probes before latching ERROR
    pub max_heartbeat_failures: u32,
    /// Identical resend requests for one line before latching ERROR
    pub max_resend_attempts: u32,
    /// Depth of the rolling temperature history
    pub temperature_history: usize,
    /// Depth of the rolling console log
    pub log_history: usize,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 10_000,
            max_heartbeat_failures: 3,
            max_resend_attempts: 5,
            temperature_history: 300,
            log_history: 300,
        }
    }
}

/// Printer geometry and extruder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterSettings {
    /// Build volume X dimension in mm
    pub bed_x: f64,
    /// Build volume Y dimension in mm
    pub bed_y: f64,
    /// Build volume Z dimension in mm
    pub bed_z: f64,
    /// X origin is at the bed center (delta-style) rather than the corner
    pub origin_center_x: bool,
    /// Y origin is at the bed center rather than the corner
    pub origin_center_y: bool,
    /// Number of extruders
    pub extruder_count: u8,
    /// Per-tool (X, Y) offsets in mm, indexed by tool number
    pub tool_offsets: Vec<(f64, f64)>,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            bed_x: 200.0,
            bed_y: 200.0,
            bed_z: 100.0,
            origin_center_x: false,
            origin_center_y: false,
            extruder_count: 1,
            tool_offsets: vec![(0.0, 0.0)],
        }
    }
}

impl PrinterSettings {
    /// (X, Y) offset for a tool, zero when not configured
    pub fn tool_offset(&self, tool: u8) -> (f64, f64) {
        self.tool_offsets
            .get(tool as usize)
            .copied()
            .unwrap_or((0.0, 0.0))
    }

    /// Position the carriage reaches after `G28` on the given axis
    ///
    /// Center-origin machines home to 0 at the bed center; corner-origin
    /// machines home to 0 at the corner, so both resolve to 0 here. The
    /// hook stays so delta offsets can be introduced without touching the
    /// analyzer.
    pub fn home_position(&self) -> (f64, f64, f64) {
        (0.0, 0.0, 0.0)
    }
}

/// Filament material settings used for analyzer mass/cost figures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilamentSettings {
    /// Filament diameter in mm
    pub diameter_mm: f64,
    /// Material density in g/cm^3
    pub density_g_cm3: f64,
    /// Cost per kilogram, in the user's currency, if configured
    pub cost_per_kg: Option<f64>,
    /// Cost per meter, in the user's currency, if configured
    pub cost_per_m: Option<f64>,
}

impl Default for FilamentSettings {
    fn default() -> Self {
        Self {
            diameter_mm: 1.75,
            density_g_cm3: 1.25,
            cost_per_kg: None,
            cost_per_m: None,
        }
    }
}

/// Complete host configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Serial connection settings
    pub connection: ConnectionSettings,
    /// Stream protocol settings
    pub protocol: ProtocolSettings,
    /// Printer geometry settings
    pub printer: PrinterSettings,
    /// Filament material settings
    pub filament: FilamentSettings,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::LoadError(format!("{}: {}", path.display(), e)))?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            return Err(SettingsError::UnsupportedFormat(
                path.display().to_string(),
            ));
        };

        config.validate()?;
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self)
                .map_err(|e| SettingsError::SaveError(e.to_string()))?
        } else {
            return Err(SettingsError::UnsupportedFormat(
                path.display().to_string(),
            ));
        };

        std::fs::write(path, content)
            .map_err(|e| SettingsError::SaveError(format!("{}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection.baud_rate == 0 && self.connection.baud_candidates.is_empty() {
            return Err(SettingsError::InvalidSetting {
                key: "connection.baud_rate".to_string(),
                reason: "autodetect needs a non-empty candidate list".to_string(),
            });
        }

        if self.connection.read_timeout_ms == 0 {
            return Err(SettingsError::InvalidSetting {
                key: "connection.read_timeout_ms".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.protocol.ack_timeout_ms == 0 {
            return Err(SettingsError::InvalidSetting {
                key: "protocol.ack_timeout_ms".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.protocol.max_resend_attempts == 0 {
            return Err(SettingsError::InvalidSetting {
                key: "protocol.max_resend_attempts".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.printer.bed_x <= 0.0 || self.printer.bed_y <= 0.0 || self.printer.bed_z <= 0.0 {
            return Err(SettingsError::InvalidSetting {
                key: "printer.bed_*".to_string(),
                reason: "bed dimensions must be > 0".to_string(),
            });
        }

        if self.printer.extruder_count == 0 {
            return Err(SettingsError::InvalidSetting {
                key: "printer.extruder_count".to_string(),
                reason: "must be >= 1".to_string(),
            });
        }

        if self.filament.diameter_mm <= 0.0 {
            return Err(SettingsError::InvalidSetting {
                key: "filament.diameter_mm".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        if self.filament.density_g_cm3 <= 0.0 {
            return Err(SettingsError::InvalidSetting {
                key: "filament.density_g_cm3".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        Ok(())
    }

    /// Default location of the config file in the platform config directory
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::ConfigDirectory("no config directory".to_string()))?
            .join("printkit");
        Ok(dir.join("printkit.toml"))
    }

    /// Load from the default location, falling back to defaults when the
    /// file does not exist yet
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }
}
