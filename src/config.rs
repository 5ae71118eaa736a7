use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::coordination::{BreakerConfig, BreakerKind, StateServiceConfig};
use crate::error::{Result, SentinelError};
use crate::persistence::DbBufferConfig;
use crate::services::EventBusConfig;
use crate::supervisor::RecoveryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub state: StateServiceConfig,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub db_buffer: DbBufferConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Thresholds per monitored dependency
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub broker: BreakerConfig,
    #[serde(default)]
    pub market_data: BreakerConfig,
    #[serde(default)]
    pub risk: BreakerConfig,
    #[serde(default)]
    pub database: BreakerConfig,
}

impl BreakersConfig {
    pub fn for_kind(&self, kind: BreakerKind) -> &BreakerConfig {
        match kind {
            BreakerKind::Broker => &self.broker,
            BreakerKind::MarketData => &self.market_data,
            BreakerKind::Risk => &self.risk,
            BreakerKind::Database => &self.database,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; without it buffered writes are never flushed
    #[serde(default)]
    pub url: Option<String>,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files (console only if unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("recovery.ready_stable_secs", 30)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific file, e.g. config/production.toml
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SENTINEL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // SENTINEL_EVENT_BUS__QUEUE_SIZE, SENTINEL_DB_BUFFER__WAL_PATH, ...
            .add_source(
                Environment::with_prefix("SENTINEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for kind in BreakerKind::ALL {
            if let Err(e) = self.breakers.for_kind(kind).validate() {
                errors.push(format!("breakers.{}: {}", kind, e));
            }
        }

        if let Err(e) = self.event_bus.validate() {
            errors.push(e.to_string());
        }

        if let Err(e) = self.db_buffer.validate() {
            errors.push(e.to_string());
        }

        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SentinelError::Validation(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SystemMode;

    #[test]
    fn test_empty_dir_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path()).unwrap();

        assert_eq!(config.state.initial_mode, SystemMode::SafeModeDisconnected);
        assert_eq!(config.breakers.broker.fail_threshold_count, 3);
        assert_eq!(config.event_bus.queue_size, 1024);
        assert_eq!(config.recovery.ready_stable_secs, 30);
        assert_eq!(config.db_buffer.max_entries, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[state]
initial_mode = "HALT"

[breakers.database]
fail_threshold_count = 5

[event_bus]
queue_size = 16
must_deliver = ["MODE_CHANGED"]
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.state.initial_mode, SystemMode::Halt);
        assert_eq!(config.breakers.database.fail_threshold_count, 5);
        assert_eq!(config.breakers.broker.fail_threshold_count, 3);
        assert_eq!(config.event_bus.queue_size, 16);
        assert_eq!(config.event_bus.must_deliver.len(), 1);
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = AppConfig::default();
        config.breakers.risk.fail_threshold_count = 0;
        config.db_buffer.max_bytes = 0;

        let err = config.validate().unwrap_err();
        assert!(err.is_validation());
        let msg = err.to_string();
        assert!(msg.contains("breakers.risk"));
        assert!(msg.contains("max_bytes"));
    }
}
