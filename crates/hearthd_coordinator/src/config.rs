//! Configuration file parsing and structures.
//!
//! hearthd-coordinator uses TOML for declarative configuration. Each table
//! under `[entries]` is one polled entry: a source to fetch from plus the
//! cadence it is polled at.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::scheduler::DEFAULT_REQUEST_REFRESH_COOLDOWN;
use crate::scheduler::SchedulerOptions;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP API; omitted means no API server
    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Key = entry_id
    #[serde(default)]
    pub entries: BTreeMap<String, EntryConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"hearthd_coordinator::scheduler" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter for this configuration.
    pub fn filter(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

/// HTTP API configuration
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// One polled entry
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between polls; omitted suspends periodic polling
    #[serde(default, deserialize_with = "seconds::option")]
    pub update_interval: Option<Duration>,

    /// Seconds a single fetch may take
    #[serde(default, deserialize_with = "seconds::option")]
    pub fetch_timeout: Option<Duration>,

    /// Seconds between out-of-band refreshes
    #[serde(
        default = "default_request_refresh_cooldown",
        deserialize_with = "seconds::required"
    )]
    pub request_refresh_cooldown: Duration,

    #[serde(default)]
    pub refresh_on_start: bool,

    /// Don't notify listeners when a poll returns the same payload
    #[serde(default)]
    pub skip_unchanged: bool,

    pub source: SourceConfig,
}

impl EntryConfig {
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            refresh_on_start: self.refresh_on_start,
            request_refresh_cooldown: self.request_refresh_cooldown,
        }
    }
}

/// Where an entry's data comes from.
///
/// The `kind` field selects the source; see [`crate::sources`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// GET a JSON document
    Http {
        url: String,

        /// Sent as a bearer token
        #[serde(default)]
        token: Option<String>,

        #[serde(default)]
        headers: BTreeMap<String, String>,
    },

    /// Run a program and read its stdout
    Command {
        program: String,

        #[serde(default)]
        args: Vec<String>,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Http { .. } => "http",
            SourceConfig::Command { .. } => "command",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8565
}

fn default_request_refresh_cooldown() -> Duration {
    DEFAULT_REQUEST_REFRESH_COOLDOWN
}

/// Durations are written as (possibly fractional) seconds.
mod seconds {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::de::Error;

    pub fn option<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        required(deserializer).map(Some)
    }

    pub fn required<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e)))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::parse(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (entry_id, entry) in &self.entries {
            if entry_id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: "entries".to_string(),
                    message: "entry ids must not be empty".to_string(),
                });
            }

            let positive = [
                ("update_interval", entry.update_interval),
                ("fetch_timeout", entry.fetch_timeout),
                ("request_refresh_cooldown", Some(entry.request_refresh_cooldown)),
            ];
            for (name, value) in positive {
                if value.is_some_and(|d| d.is_zero()) {
                    return Err(ConfigError::Invalid {
                        field: format!("entries.{}.{}", entry_id, name),
                        message: "must be greater than zero".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [logging]
            level = "info"
        "#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.api.is_none());
        assert!(config.entries.is_empty());
    }

    #[test]
    fn test_parse_entries() {
        let toml = r#"
            [api]
            port = 9000

            [entries.office]
            update_interval = 30
            fetch_timeout = 2.5
            refresh_on_start = true
            source = { kind = "http", url = "http://10.0.0.5/api/state", token = "secret" }

            [entries.uptime]
            source = { kind = "command", program = "uptime", args = ["-p"] }
        "#;

        let config = Config::parse(toml).unwrap();

        let api = config.api.as_ref().unwrap();
        assert!(api.enabled);
        assert_eq!(api.listen, "127.0.0.1");
        assert_eq!(api.port, 9000);

        let office = &config.entries["office"];
        assert!(office.enabled);
        assert_eq!(office.update_interval, Some(Duration::from_secs(30)));
        assert_eq!(office.fetch_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(office.request_refresh_cooldown, DEFAULT_REQUEST_REFRESH_COOLDOWN);
        assert!(office.scheduler_options().refresh_on_start);
        assert!(!office.skip_unchanged);
        assert_eq!(
            office.source,
            SourceConfig::Http {
                url: "http://10.0.0.5/api/state".to_string(),
                token: Some("secret".to_string()),
                headers: BTreeMap::new(),
            }
        );

        let uptime = &config.entries["uptime"];
        assert_eq!(uptime.update_interval, None);
        assert_eq!(uptime.source.kind(), "command");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let toml = r#"
            [entries.office]
            update_interval = 0
            source = { kind = "command", program = "true" }
        "#;

        let err = Config::parse(toml).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Invalid value for entries.office.update_interval: must be greater than zero");
    }

    #[test]
    fn test_negative_interval_rejected() {
        let toml = r#"
            [entries.office]
            update_interval = -5
            source = { kind = "command", program = "true" }
        "#;

        assert!(matches!(Config::parse(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_source_kind_rejected() {
        let toml = r#"
            [entries.office]
            source = { kind = "carrier_pigeon" }
        "#;

        assert!(matches!(Config::parse(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [entries.office]
            update_interval = 60
            source = {{ kind = "command", program = "date" }}
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.entries["office"].update_interval,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }

    #[test]
    fn test_logging_filter() {
        let toml = r#"
            [logging]
            level = "warn"

            [logging.overrides]
            "hearthd_coordinator::scheduler" = "debug"
        "#;

        let config = Config::parse(toml).unwrap();
        let filter = config.logging.filter();
        assert!(filter.would_enable("hearthd_coordinator::scheduler", &tracing::Level::DEBUG));
        assert!(!filter.would_enable("hearthd_coordinator::api", &tracing::Level::INFO));
        assert!(filter.would_enable("hearthd_coordinator::api", &tracing::Level::WARN));
    }
}
