//! Source tracking for configuration values.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Where a configuration value came from, lowest precedence first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    File { path: PathBuf },
    Environment,
    CommandLine,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File { path } => write!(f, "file ({})", path.display()),
            Self::Environment => write!(f, "environment"),
            Self::CommandLine => write!(f, "command line"),
        }
    }
}

/// A value paired with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable the value was read from, if any.
    pub var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            var: None,
        }
    }

    pub fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            var: Some(var),
        }
    }

    pub fn is_from_env(&self) -> bool {
        self.source == ConfigSource::Environment
    }
}

/// Per-key record of which layer last set each value.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceMap {
    entries: BTreeMap<String, ConfigSource>,
}

impl SourceMap {
    pub fn record(&mut self, key: &str, source: ConfigSource) {
        self.entries.insert(key.to_string(), source);
    }

    /// Source of `key`, falling back to [`ConfigSource::Default`].
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.entries
            .get(key)
            .cloned()
            .unwrap_or(ConfigSource::Default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigSource)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
