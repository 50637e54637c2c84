//! Configuration for the exposure analytics engine.

use crate::error::ConfigError;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "gas-exposure-analytics";

/// Main configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interval between scheduled ticks
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Maximum number of firefighters evaluated concurrently
    pub max_concurrency: usize,

    /// Time budget for one firefighter's evaluation inside a tick
    #[serde(with = "duration_serde")]
    pub firefighter_budget: Duration,

    /// Timeout for a single store operation
    #[serde(with = "duration_serde")]
    pub store_timeout: Duration,

    /// How long shutdown waits for in-flight ticks
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,

    /// Health turns stale when no tick completed within this many intervals
    pub health_stale_ticks: u32,

    /// Evaluate at the start of the current minute instead of at `now`
    pub floor_to_minute: bool,

    /// Seconds subtracted from the evaluation instant to let late readings arrive
    pub arrival_buffer_secs: u64,

    /// Gauge percentage at which a firefighter's status turns yellow
    pub yellow_warning_percent: f64,

    /// Region assigned to firefighters the store has no region for
    pub default_region: String,

    /// Path to the limits table (JSON)
    pub limits_path: PathBuf,

    /// Path to the reading store snapshot (JSON)
    pub store_path: PathBuf,

    /// Path for storing health state
    pub data_path: PathBuf,

    /// Path for exporting decision records
    pub export_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        let config_dir = Self::config_dir();

        Self {
            tick_interval: Duration::from_secs(60),
            max_concurrency: 8,
            firefighter_budget: Duration::from_secs(45),
            store_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            health_stale_ticks: 3,
            floor_to_minute: true,
            arrival_buffer_secs: 0,
            yellow_warning_percent: 80.0,
            default_region: "EU".to_string(),
            limits_path: config_dir.join("limits.json"),
            store_path: data_dir.join("store.json"),
            export_path: data_dir.join("exports"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults when it does
    /// not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            let config: Config =
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if self.max_concurrency == 0 {
            issues.push("max_concurrency must be at least 1".to_string());
        }
        if self.tick_interval.is_zero() {
            issues.push("tick_interval must be greater than zero".to_string());
        }
        if self.firefighter_budget.is_zero() {
            issues.push("firefighter_budget must be greater than zero".to_string());
        }
        if self.store_timeout.is_zero() {
            issues.push("store_timeout must be greater than zero".to_string());
        }
        if !(self.yellow_warning_percent > 0.0 && self.yellow_warning_percent < 100.0) {
            issues.push(format!(
                "yellow_warning_percent must be between 0 and 100 (got {})",
                self.yellow_warning_percent
            ));
        }
        if self.default_region.trim().is_empty() {
            issues.push("default_region must not be empty".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Evaluation instant for a tick triggered at `now`.
    pub fn evaluation_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = if self.floor_to_minute {
            now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
        } else {
            now
        };
        let buffer = i64::try_from(self.arrival_buffer_secs).unwrap_or(i64::MAX);
        base - TimeDelta::try_seconds(buffer).unwrap_or(TimeDelta::zero())
    }
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.firefighter_budget, Duration::from_secs(45));
        assert!(config.floor_to_minute);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_every_issue() {
        let config = Config {
            max_concurrency: 0,
            tick_interval: Duration::ZERO,
            yellow_warning_percent: 150.0,
            ..Config::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid(issues)) => assert_eq!(issues.len(), 3),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluation_instant() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 42).unwrap();
        let floored = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        let config = Config::default();
        assert_eq!(config.evaluation_instant(now), floored);

        let buffered = Config {
            arrival_buffer_secs: 30,
            ..Config::default()
        };
        assert_eq!(
            buffered.evaluation_instant(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 29, 30).unwrap()
        );

        let exact = Config {
            floor_to_minute: false,
            ..Config::default()
        };
        assert_eq!(exact.evaluation_instant(now), now);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let path = std::env::temp_dir()
            .join(format!("exposure-config-{}", uuid::Uuid::new_v4()))
            .join("config.json");
        let config = Config {
            max_concurrency: 3,
            default_region: "US".into(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.max_concurrency, 3);
        assert_eq!(loaded.default_region, "US");
        assert_eq!(loaded.tick_interval, Duration::from_secs(60));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let path = std::env::temp_dir().join(format!("exposure-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"tick_interval": 30}"#).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.tick_interval, Duration::from_secs(30));
        assert_eq!(loaded.max_concurrency, 8);

        let _ = std::fs::remove_file(&path);
    }
}
