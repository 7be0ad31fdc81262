//! Service configuration file.
//!
//! Settings live in an ini file (`~/.locmux/config.ini` by default) with a
//! single `[locmux]` section. Missing files and missing keys fall back to
//! defaults; malformed values are reported rather than silently ignored.

use crate::events::DEFAULT_EVENT_LOG_CAPACITY;
use crate::fudger::DEFAULT_COARSE_ACCURACY_M;
use ini::Ini;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const SECTION: &str = "locmux";

/// Default background throttle interval (30 minutes).
pub const DEFAULT_BACKGROUND_THROTTLE_INTERVAL_MS: u64 = 30 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Typed view of the configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Name of the provider the manager fronts.
    pub provider: String,
    /// Coarse accuracy in meters.
    pub coarse_accuracy_m: f64,
    /// Interval forced on background clients, in milliseconds.
    pub background_throttle_interval_ms: u64,
    /// Ring buffer size of the event log.
    pub event_log_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "gps".to_string(),
            coarse_accuracy_m: DEFAULT_COARSE_ACCURACY_M,
            background_throttle_interval_ms: DEFAULT_BACKGROUND_THROTTLE_INTERVAL_MS,
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".locmux")
            .join("config.ini")
    }

    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let defaults = Self::default();

        Ok(Self {
            provider: ini
                .get_from(Some(SECTION), "provider")
                .map(str::to_string)
                .unwrap_or(defaults.provider),
            coarse_accuracy_m: parse_key(&ini, "coarse_accuracy_m", defaults.coarse_accuracy_m)?,
            background_throttle_interval_ms: parse_key(
                &ini,
                "background_throttle_interval_ms",
                defaults.background_throttle_interval_ms,
            )?,
            event_log_capacity: parse_key(&ini, "event_log_capacity", defaults.event_log_capacity)?,
        })
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut ini = Ini::new();
        ini.with_section(Some(SECTION))
            .set("provider", &self.provider)
            .set("coarse_accuracy_m", self.coarse_accuracy_m.to_string())
            .set(
                "background_throttle_interval_ms",
                self.background_throttle_interval_ms.to_string(),
            )
            .set("event_log_capacity", self.event_log_capacity.to_string());
        ini.write_to_file(path)?;
        Ok(())
    }
}

fn parse_key<T: FromStr>(ini: &Ini, key: &str, default: T) -> Result<T, ConfigError> {
    match ini.get_from(Some(SECTION), key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}
