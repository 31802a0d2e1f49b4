//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConfigSource {
    Default,
    File { path: PathBuf },
    Environment { var: String },
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File { path } => write!(f, "file {}", path.display()),
            Self::Environment { var } => write!(f, "env {var}"),
        }
    }
}

/// A value paired with its origin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment { var: var.into() },
        }
    }

    pub fn from_file(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            source: ConfigSource::File { path: path.into() },
        }
    }

    pub fn is_default(&self) -> bool {
        self.source == ConfigSource::Default
    }
}

/// One line of the effective-configuration report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigValueSource {
    pub key: &'static str,
    pub value: String,
    pub source: ConfigSource,
}
