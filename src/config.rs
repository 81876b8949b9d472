//! Configuration for the arm controller, loaded with Figment.
//!
//! Sources, lowest to highest precedence:
//! 1. built-in defaults
//! 2. a TOML file (default: `config/armctl.toml`, silently skipped if absent)
//! 3. environment variables prefixed with `ARMCTL_`, `__` between key levels
//!
//! ```text
//! ARMCTL_APPLICATION__LOG_LEVEL=debug
//! ARMCTL_SERVER__BIND=0.0.0.0:4500
//! ARMCTL_QUEUE__CAPACITY=256
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "bench-arm"
//! log_level = "info"
//!
//! [server]
//! bind = "0.0.0.0:4500"
//! max_connections = 16
//!
//! [hardware]
//! output = "/dev/ttyUSB0"
//! line_terminator = "\r\n"
//!
//! [[plates]]
//! name = "PlateA"
//! origin_x = 10.0
//! origin_y = 5.0
//! rows = 8
//! columns = 12
//! ```

use crate::arm::Coordinate;
use crate::channel::DEFAULT_LINE_TERMINATOR;
use crate::error::ConfigError;
use crate::resolver::PlateLayout;
use crate::wire::{WireLimits, DEFAULT_MAX_RECORD_BYTES, DEFAULT_MAX_TASK_DEPTH};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/armctl.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ARMCTL_";

/// Upper bound accepted for `server.max_task_depth`.
const MAX_TASK_DEPTH_LIMIT: usize = 100;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Ingestion server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Task queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Command output settings
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Arm start position
    #[serde(default)]
    pub arm: ArmConfig,
    /// Plate layouts known to the resolver
    #[serde(default)]
    pub plates: Vec<PlateLayout>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Ingestion server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, `host:port`
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Connections handled at the same time; more wait to be accepted
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Largest accepted task record in bytes
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
    /// Deepest accepted composite nesting
    #[serde(default = "default_max_task_depth")]
    pub max_task_depth: usize,
}

/// Task queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QueueConfig {
    /// Maximum queued tasks. Absent means unbounded; when set, producers wait
    /// for room.
    #[serde(default)]
    pub capacity: Option<usize>,
}

/// Hardware command output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// `"stdout"` or a path to a file or device node
    #[serde(default = "default_output")]
    pub output: String,
    /// Open `output` as a serial port (needs the `serial` feature)
    #[serde(default)]
    pub serial: bool,
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Appended after every command
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
}

/// Arm start position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArmConfig {
    /// Start X (cm)
    #[serde(default)]
    pub home_x: f64,
    /// Start Y (cm)
    #[serde(default)]
    pub home_y: f64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "armctl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:4500".to_string()
}

fn default_max_connections() -> usize {
    64
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

fn default_max_task_depth() -> usize {
    DEFAULT_MAX_TASK_DEPTH
}

fn default_output() -> String {
    "stdout".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_line_terminator() -> String {
    DEFAULT_LINE_TERMINATOR.to_string()
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_connections: default_max_connections(),
            max_record_bytes: default_max_record_bytes(),
            max_task_depth: default_max_task_depth(),
        }
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            serial: false,
            baud_rate: default_baud_rate(),
            line_terminator: default_line_terminator(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Loads from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads from a specific TOML file and the environment, then validates.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack used by [`Settings::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Checks values that parse fine but make no sense.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.server.bind.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server.bind cannot be empty".to_string(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Validation(
                "server.max_connections must be > 0".to_string(),
            ));
        }
        if self.server.max_record_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.max_record_bytes must be > 0".to_string(),
            ));
        }
        if self.server.max_task_depth == 0 || self.server.max_task_depth > MAX_TASK_DEPTH_LIMIT {
            return Err(ConfigError::Validation(format!(
                "server.max_task_depth must be between 1 and {}",
                MAX_TASK_DEPTH_LIMIT
            )));
        }

        if self.queue.capacity == Some(0) {
            return Err(ConfigError::Validation(
                "queue.capacity must be > 0 (omit it for an unbounded queue)".to_string(),
            ));
        }

        if self.hardware.output.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hardware.output cannot be empty".to_string(),
            ));
        }
        if self.hardware.line_terminator.is_empty() {
            return Err(ConfigError::Validation(
                "hardware.line_terminator cannot be empty".to_string(),
            ));
        }
        if self.hardware.serial && self.hardware.baud_rate == 0 {
            return Err(ConfigError::Validation(
                "hardware.baud_rate must be > 0".to_string(),
            ));
        }

        if !self.arm.home_x.is_finite() || !self.arm.home_y.is_finite() {
            return Err(ConfigError::Validation(
                "arm.home_x and arm.home_y must be finite".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for plate in &self.plates {
            if plate.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Plate name cannot be empty".to_string(),
                ));
            }
            if !names.insert(plate.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate plate name: '{}'",
                    plate.name
                )));
            }
            if plate.rows == 0 || plate.columns == 0 {
                return Err(ConfigError::Validation(format!(
                    "Plate '{}': rows and columns must be > 0",
                    plate.name
                )));
            }
            let numbers = [plate.origin_x, plate.origin_y, plate.pitch_x, plate.pitch_y];
            if numbers.iter().any(|v| !v.is_finite()) {
                return Err(ConfigError::Validation(format!(
                    "Plate '{}': origin and pitch must be finite",
                    plate.name
                )));
            }
        }

        Ok(())
    }

    /// Decoding limits for the ingestion server.
    pub fn wire_limits(&self) -> WireLimits {
        WireLimits {
            max_record_bytes: self.server.max_record_bytes,
            max_task_depth: self.server.max_task_depth,
        }
    }

    /// Arm start position.
    pub fn home(&self) -> Coordinate {
        Coordinate::new(self.arm.home_x, self.arm.home_y)
    }
}
