// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Configuration module
//!
//! The configuration is an immutable value: components hold an
//! `Arc<Config>` and replace it wholesale when a new one is broadcast.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Coordinator settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Video source
    pub camera: CameraConfig,

    /// Frame processing
    pub processing: ProcessingConfig,

    /// Alarm timing
    pub alerting: AlertingConfig,

    /// Notifier plugin tables, keyed by plugin name
    #[serde(default)]
    pub alerters: BTreeMap<String, toml::Table>,

    /// Command line flags, never persisted
    #[serde(skip)]
    pub flags: Flags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            camera: CameraConfig::default(),
            processing: ProcessingConfig::default(),
            alerting: AlertingConfig::default(),
            alerters: BTreeMap::new(),
            flags: Flags::default(),
        }
    }
}

/// Runtime flags from the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flags {
    /// Where this configuration is persisted
    pub config_path: Option<PathBuf>,

    /// Suppress every notifier
    pub silent: bool,

    /// Test mode disables the capture schedule
    pub test: bool,

    /// Use the simulated camera
    pub demo: bool,

    /// Play a directory of frames instead of the camera
    pub file: Option<PathBuf>,

    /// Log level handed down to the worker process
    pub log_level: String,
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Size of the blocking pool (notifiers, persistence)
    pub worker_threads: usize,

    /// Seconds to wait for the worker after SIGTERM before killing it
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            shutdown_grace_secs: 5,
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// HTTP snapshot URL returning a JPEG or PNG per request
    pub url: String,

    /// Delay between snapshot requests
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,
}

fn default_snapshot_interval() -> u64 {
    66
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/snapshot.jpg".to_string(),
            snapshot_interval_ms: default_snapshot_interval(),
        }
    }
}

/// Frame processing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Detection rate ceiling; also the number of samples per second window
    pub fps: u32,

    /// Weight of each new frame in the running average (0..=1)
    pub avg_weighting: f32,

    /// Dilation passes over the change mask
    pub dilation_iterations: u32,

    /// Brightness delta counted as a changed pixel
    pub fixed_lvl_threshold: u8,

    /// Gaussian kernel size, must be odd
    pub gauss_ksize: u32,

    /// Upper bound of the pixel change band-pass
    pub pixel_threshold_hi: i64,

    /// Lower bound of the pixel change band-pass
    pub pixel_threshold_lo: i64,

    /// Canonical width frames are resized to
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
}

fn default_frame_width() -> u32 {
    640
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            fps: 5,
            avg_weighting: 0.1,
            dilation_iterations: 2,
            fixed_lvl_threshold: 20,
            gauss_ksize: 21,
            pixel_threshold_hi: 200_000,
            pixel_threshold_lo: 300,
            frame_width: default_frame_width(),
        }
    }
}

/// Alerting configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertingConfig {
    /// Daily start of the active window, "HH:MM"
    pub start_time: String,

    /// Daily end of the active window, "HH:MM"
    pub end_time: String,

    /// Length of the motion history in seconds
    pub alert_time_s: u32,

    /// Sliding window that must always contain motion
    pub min_movement_s: u32,

    /// How long an initial alarm time is kept before a new one starts
    pub initial_alarm_duration_m: u32,

    /// Minimum seconds between two alarms
    pub alarm_hysteresis_s: u32,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            start_time: "20:00".to_string(),
            end_time: "08:00".to_string(),
            alert_time_s: 20,
            min_movement_s: 10,
            initial_alarm_duration_m: 5,
            alarm_hysteresis_s: 30,
        }
    }
}

impl AlertingConfig {
    pub fn start(&self) -> Result<NaiveTime, String> {
        parse_time_str(&self.start_time)
    }

    pub fn end(&self) -> Result<NaiveTime, String> {
        parse_time_str(&self.end_time)
    }
}

/// Parse an "HH:MM" wall clock time
pub fn parse_time_str(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| format!("'{}' is not a valid HH:MM time: {}", value, e))
}

/// A single failed validation rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: &'static str,
    pub reason: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0:?}")]
    NotFound(PathBuf),

    #[error("config file {path:?} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {path:?} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {}", format_violations(.0))]
    Invalid(Vec<FieldViolation>),
}

fn format_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Config {
    /// Load and validate configuration from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        config.flags.config_path = Some(path.to_path_buf());
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.save(path)?;
            config.flags.config_path = Some(path.to_path_buf());
            Ok(config)
        }
    }

    /// Check every rule and report all violations at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = Vec::new();
        let mut check = |ok: bool, field: &'static str, reason: &str| {
            if !ok {
                violations.push(FieldViolation {
                    field,
                    reason: reason.to_string(),
                });
            }
        };

        let p = &self.processing;
        check(p.fps > 0, "processing.fps", "must be greater than zero");
        check(
            (0.0..=1.0).contains(&p.avg_weighting),
            "processing.avg_weighting",
            "must be between 0 and 1",
        );
        check(p.gauss_ksize % 2 == 1, "processing.gauss_ksize", "must be odd");
        check(p.pixel_threshold_lo >= 0, "processing.pixel_threshold_lo", "must not be negative");
        check(
            p.pixel_threshold_lo <= p.pixel_threshold_hi,
            "processing.pixel_threshold_hi",
            "must not be below pixel_threshold_lo",
        );
        check(p.frame_width > 0, "processing.frame_width", "must be greater than zero");

        let a = &self.alerting;
        check(a.min_movement_s > 0, "alerting.min_movement_s", "must be greater than zero");
        check(
            a.min_movement_s <= a.alert_time_s,
            "alerting.alert_time_s",
            "must be at least min_movement_s",
        );
        if let Err(reason) = a.start() {
            check(false, "alerting.start_time", &reason);
        }
        if let Err(reason) = a.end() {
            check(false, "alerting.end_time", &reason);
        }

        check(self.server.worker_threads > 0, "server.worker_threads", "must be greater than zero");

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(violations))
        }
    }

    /// Whether the named notifier is switched on in this configuration
    pub fn alerter_enabled(&self, name: &str) -> Option<bool> {
        self.alerters
            .get(name)
            .and_then(|t| t.get("enabled"))
            .and_then(toml::Value::as_bool)
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("overwatch"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validation_lists_every_violation() {
        let mut config = Config::default();
        config.processing.fps = 0;
        config.processing.gauss_ksize = 4;
        config.alerting.min_movement_s = 50;
        config.alerting.start_time = "25:00".to_string();

        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(violations) = err else {
            panic!("expected Invalid, got {err:?}");
        };
        let fields: Vec<_> = violations.iter().map(|v| v.field).collect();
        assert_eq!(
            fields,
            vec![
                "processing.fps",
                "processing.gauss_ksize",
                "alerting.alert_time_s",
                "alerting.start_time",
            ]
        );
    }

    #[test]
    fn test_incomplete_alerter_left_to_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        let mut table = toml::Table::new();
        table.insert("enabled".into(), toml::Value::Boolean(true));
        config.alerters.insert("siren".into(), table);
        config.save(&path).unwrap();

        // Plugin tables are checked when notifiers load, not here
        let config = Config::load(&path).unwrap();
        assert_eq!(config.alerter_enabled("siren"), Some(true));

        let plugins = crate::alerts::NotifierRegistry::with_builtins().load(&config.alerters);
        assert!(plugins.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.processing.fps = 7;
        let mut table = toml::Table::new();
        table.insert("enabled".into(), toml::Value::Boolean(false));
        table.insert("test_grp".into(), toml::Value::Boolean(true));
        table.insert("program".into(), toml::Value::String("true".into()));
        config.alerters.insert("siren".into(), table);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.processing.fps, 7);
        assert_eq!(loaded.alerter_enabled("siren"), Some(false));
        assert_eq!(loaded.flags.config_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
