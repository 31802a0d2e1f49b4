//! Configuration system for runlog.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `RUNLOG_*` environment variables, then validation. The origin of every
//! value is kept so the effective configuration can be explained.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};

use crate::types::{ChannelId, TimeoutClass};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Tunables of the event pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each channel queue.
    pub queue_capacity: usize,
    /// Defer commits to the backend batch cache.
    pub batch_mode: bool,
    /// Idle poll interval after which a batch-mode worker flushes.
    pub batch_flush_interval_ms: u64,
    pub standard_event_timeout_ms: u64,
    pub long_event_timeout_ms: u64,
    /// Uncommitted writes a backend may hold before committing on its own.
    pub max_cached_events: usize,
    pub enable_checkpoints: bool,
    pub log_run_and_suite_messages: bool,
    /// Non-critical failures logged per worker before going quiet.
    pub minor_error_log_limit: u32,
    pub monitor_queue: bool,
    pub machine_name: String,
    /// Channel whose worker survives LEAVE_TESTCASE.
    pub main_channel: Option<ChannelId>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100_000,
            batch_mode: false,
            batch_flush_interval_ms: 10_000,
            standard_event_timeout_ms: 60_000,
            long_event_timeout_ms: 900_000,
            max_cached_events: 2_000,
            enable_checkpoints: true,
            log_run_and_suite_messages: true,
            minor_error_log_limit: 5,
            monitor_queue: false,
            machine_name: default_machine_name(),
            main_channel: None,
        }
    }
}

fn default_machine_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown host".to_string())
}

/// Effective configuration plus where each value came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub sources: Vec<ConfigValueSource>,
}

impl PipelineConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    pub fn with_batch_flush_interval(mut self, interval: Duration) -> Self {
        self.batch_flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_timeouts(mut self, standard: Duration, long: Duration) -> Self {
        self.standard_event_timeout_ms = standard.as_millis() as u64;
        self.long_event_timeout_ms = long.as_millis() as u64;
        self
    }

    pub fn with_main_channel(mut self, channel: impl Into<ChannelId>) -> Self {
        self.main_channel = Some(channel.into());
        self
    }

    pub fn with_machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = name.into();
        self
    }

    pub fn batch_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_flush_interval_ms)
    }

    pub fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Standard => Duration::from_millis(self.standard_event_timeout_ms),
            TimeoutClass::Long => Duration::from_millis(self.long_event_timeout_ms),
        }
    }

    /// Load defaults, an optional TOML file and the process environment.
    pub fn load(file: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
        Self::load_with(file, &mut EnvParser::new())
    }

    /// Like [`PipelineConfig::load`] with an explicit environment parser.
    pub fn load_with(file: Option<&Path>, env: &mut EnvParser) -> Result<LoadedConfig, ConfigError> {
        let mut config = PipelineConfig::default();
        let mut file_keys: Vec<String> = Vec::new();

        if let Some(path) = file {
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            let table: toml::Table = toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
            file_keys = table.keys().cloned().collect();
        }

        let mut sources = Vec::new();
        let file_source = |key: &str| match file {
            Some(path) if file_keys.iter().any(|k| k == key) => ConfigSource::File {
                path: path.to_path_buf(),
            },
            _ => ConfigSource::Default,
        };

        macro_rules! layer {
            ($key:literal, $field:ident, $sourced:expr) => {{
                let sourced = $sourced;
                let source = if sourced.is_default() {
                    file_source($key)
                } else {
                    config.$field = sourced.value;
                    sourced.source
                };
                sources.push(ConfigValueSource {
                    key: $key,
                    value: format!("{:?}", config.$field),
                    source,
                });
            }};
        }

        layer!(
            "queue_capacity",
            queue_capacity,
            env.get_usize_range("QUEUE_CAPACITY", config.queue_capacity, 1, usize::MAX)
        );
        layer!(
            "batch_mode",
            batch_mode,
            env.get_bool("BATCH_MODE", config.batch_mode)
        );
        layer!(
            "batch_flush_interval_ms",
            batch_flush_interval_ms,
            env.get_u64_range(
                "BATCH_FLUSH_INTERVAL_MS",
                config.batch_flush_interval_ms,
                1,
                u64::MAX
            )
        );
        layer!(
            "standard_event_timeout_ms",
            standard_event_timeout_ms,
            env.get_u64_range(
                "STANDARD_EVENT_TIMEOUT_MS",
                config.standard_event_timeout_ms,
                1,
                u64::MAX
            )
        );
        layer!(
            "long_event_timeout_ms",
            long_event_timeout_ms,
            env.get_u64_range(
                "LONG_EVENT_TIMEOUT_MS",
                config.long_event_timeout_ms,
                1,
                u64::MAX
            )
        );
        layer!(
            "max_cached_events",
            max_cached_events,
            env.get_usize_range("MAX_CACHED_EVENTS", config.max_cached_events, 1, usize::MAX)
        );
        layer!(
            "enable_checkpoints",
            enable_checkpoints,
            env.get_bool("ENABLE_CHECKPOINTS", config.enable_checkpoints)
        );
        layer!(
            "log_run_and_suite_messages",
            log_run_and_suite_messages,
            env.get_bool(
                "LOG_RUN_AND_SUITE_MESSAGES",
                config.log_run_and_suite_messages
            )
        );
        layer!(
            "minor_error_log_limit",
            minor_error_log_limit,
            env.get_u32_range(
                "MINOR_ERROR_LOG_LIMIT",
                config.minor_error_log_limit,
                0,
                u32::MAX
            )
        );
        layer!(
            "monitor_queue",
            monitor_queue,
            env.get_bool("MONITOR_QUEUE", config.monitor_queue)
        );
        layer!(
            "machine_name",
            machine_name,
            env.get_string("MACHINE_NAME", &config.machine_name)
        );

        let main = env.get_optional_string("MAIN_CHANNEL");
        let main_source = if main.is_default() {
            file_source("main_channel")
        } else {
            config.main_channel = main.value.map(ChannelId::new);
            main.source
        };
        sources.push(ConfigValueSource {
            key: "main_channel",
            value: format!("{:?}", config.main_channel),
            source: main_source,
        });

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }

        config.validate()?;
        Ok(LoadedConfig { config, sources })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.batch_flush_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_flush_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.standard_event_timeout_ms == 0 || self.long_event_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "event timeouts",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_cached_events == 0 {
            return Err(ConfigError::Invalid {
                field: "max_cached_events",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.machine_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "machine_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(vars: &[(&str, &str)]) -> EnvParser {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvParser::with_lookup(move |name| map.get(name).cloned())
    }

    fn source_of<'a>(loaded: &'a LoadedConfig, key: &str) -> &'a ConfigSource {
        &loaded
            .sources
            .iter()
            .find(|s| s.key == key)
            .unwrap()
            .source
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue_capacity, 100_000);
        assert!(!config.batch_mode);
        assert_eq!(config.batch_flush_interval(), Duration::from_secs(10));
        assert_eq!(
            config.timeout_for(TimeoutClass::Standard),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.timeout_for(TimeoutClass::Long),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(config.max_cached_events, 2_000);
        assert_eq!(config.minor_error_log_limit, 5);
        assert!(config.enable_checkpoints);
        assert!(config.log_run_and_suite_messages);
        assert!(config.main_channel.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layering_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_capacity = 64\nbatch_mode = true\nmain_channel = \"main\"").unwrap();

        let mut env = env_of(&[("RUNLOG_QUEUE_CAPACITY", "128")]);
        let loaded = PipelineConfig::load_with(Some(file.path()), &mut env).unwrap();

        assert_eq!(loaded.config.queue_capacity, 128);
        assert!(loaded.config.batch_mode);
        assert_eq!(loaded.config.main_channel, Some(ChannelId::new("main")));
        assert!(matches!(
            source_of(&loaded, "queue_capacity"),
            ConfigSource::Environment { var } if var == "RUNLOG_QUEUE_CAPACITY"
        ));
        assert!(matches!(
            source_of(&loaded, "batch_mode"),
            ConfigSource::File { .. }
        ));
        assert_eq!(
            source_of(&loaded, "monitor_queue"),
            &ConfigSource::Default
        );
    }

    #[test]
    fn test_env_errors_are_collected() {
        let mut env = env_of(&[
            ("RUNLOG_BATCH_MODE", "sometimes"),
            ("RUNLOG_QUEUE_CAPACITY", "0"),
        ]);
        let err = PipelineConfig::load_with(None, &mut env).unwrap_err();
        match err {
            ConfigError::Env(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_parse_error_names_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "queue_capacity = \"many\"").unwrap();
        let err = PipelineConfig::load_with(Some(file.path()), &mut env_of(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = PipelineConfig::default().with_queue_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "queue_capacity",
                ..
            })
        ));
    }

    #[test]
    fn test_main_channel_from_env() {
        let mut env = env_of(&[("RUNLOG_MAIN_CHANNEL", "driver")]);
        let loaded = PipelineConfig::load_with(None, &mut env).unwrap();
        assert_eq!(loaded.config.main_channel, Some(ChannelId::new("driver")));
    }
}
