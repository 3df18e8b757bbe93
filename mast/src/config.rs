//! Configuration file for the `mast-unit` binary
//!
//! One JSON document holding the unit configuration, the simulated hardware
//! used when no real drivers are wired in, and logging. Every field has a
//! default, so an empty object (or no file at all) is a valid configuration.

use mast_device::SimulatedCameraConfig;
use mast_guiding::UnitConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Simulated devices backing the unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub camera: SimulatedCameraConfig,
    pub mount_ra_hours: f64,
    pub mount_dec_degs: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            camera: SimulatedCameraConfig::default(),
            mount_ra_hours: 10.0,
            mount_dec_degs: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Daily log files are written here when set
    pub directory: Option<PathBuf>,
    /// Log files older than this many days are removed at startup
    pub retention_days: i64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            directory: None,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MastConfig {
    pub unit: UnitConfig,
    pub simulation: SimulationConfig,
    pub logging: LoggingConfig,
}

impl MastConfig {
    pub fn from_json(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: MastConfig = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text, path)
    }

    /// Load `path` when given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit.name.trim().is_empty() {
            return Err(ConfigError::Invalid("unit.name is empty".to_string()));
        }
        let camera = &self.unit.camera;
        if camera.temperature_tolerance <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "unit.camera.temperature_tolerance must be positive, got {}",
                camera.temperature_tolerance
            )));
        }
        if camera.warm_set_point <= camera.operational_set_point {
            return Err(ConfigError::Invalid(format!(
                "unit.camera.warm_set_point ({}) must be above operational_set_point ({})",
                camera.warm_set_point, camera.operational_set_point
            )));
        }
        self.unit
            .guiding
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = MastConfig::from_json("{}", Path::new("mast.json")).unwrap();
        assert_eq!(config.unit.name, "mast00");
        assert_eq!(config.logging.filter, "info");
        assert_eq!(config.simulation.mount_ra_hours, 10.0);
        assert!(config.unit.guiding.request_skew.is_none());
    }

    #[test]
    fn test_nested_overrides() {
        let text = r#"{
            "unit": {
                "name": "mast03",
                "camera": { "operational_set_point": -20.0 },
                "guiding": { "exposure_secs": 3.0, "request_skew": { "ra_hours": 0.001, "dec_degs": 0.0 } }
            },
            "logging": { "directory": "/var/log/mast" }
        }"#;
        let config = MastConfig::from_json(text, Path::new("mast.json")).unwrap();
        assert_eq!(config.unit.name, "mast03");
        assert_eq!(config.unit.camera.operational_set_point, -20.0);
        assert_eq!(config.unit.camera.warm_set_point, 5.0);
        assert_eq!(config.unit.guiding.exposure_secs, 3.0);
        assert!(config.unit.guiding.request_skew.is_some());
        assert_eq!(config.logging.directory, Some(PathBuf::from("/var/log/mast")));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = MastConfig::from_json(
            r#"{"unit": {"guiding": {"check_interval_ms": 10000}}}"#,
            Path::new("mast.json"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = MastConfig::from_json(r#"{"unit": 5}"#, Path::new("mast.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mast.json");
        std::fs::write(&path, r#"{"unit": {"name": "mast07"}}"#).unwrap();

        assert_eq!(MastConfig::load(&path).unwrap().unit.name, "mast07");
        assert!(matches!(
            MastConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
        assert_eq!(MastConfig::load_or_default(None).unwrap().unit.name, "mast00");
    }
}
