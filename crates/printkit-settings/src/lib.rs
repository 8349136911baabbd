//! Configuration and settings management for printkit
//!
//! Provides the explicit `Config` value passed to the print engine and the
//! analyzer at construction, with TOML/JSON persistence in the platform
//! config directory.

pub mod config;
pub mod error;

pub use config::{
    Config, ConnectionSettings, FilamentSettings, PrinterSettings, ProtocolSettings,
};
pub use error::{Result, SettingsError};
