//! `FNBENCH_*` environment overrides.
//!
//! Each getter returns the default untouched when the variable is unset. A
//! variable that is set but unusable is recorded as an [`EnvError`] and the
//! default is kept, so one pass over the environment reports every bad value.

use super::source::Sourced;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const PREFIX: &str = "FNBENCH_";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Reads overrides and collects every parse failure.
#[derive(Debug, Default)]
pub struct EnvParser {
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Raw value of `FNBENCH_{name}` with the full variable name.
    fn lookup(name: &str) -> (String, Option<String>) {
        let var = format!("{PREFIX}{name}");
        let value = env::var(&var).ok();
        (var, value)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(value, var),
            (_, None) => Sourced::default_value(default.to_string()),
        }
    }

    /// Unset keeps the default; an empty value clears it.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(Some(value).filter(|v| !v.is_empty()), var),
            (_, None) => Sourced::default_value(None),
        }
    }

    /// `1/true/yes/on` and `0/false/no/off/""`, case-insensitive.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let (var, Some(value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        let parsed = match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        };
        match parsed {
            Some(flag) => Sourced::from_env(flag, var),
            None => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)",
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Integer within `min..=max`.
    pub fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let (var, Some(value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => Sourced::from_env(n, var),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                Sourced::default_value(default)
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned integer",
                    value,
                });
                Sourced::default_value(default)
            }
        }
    }

    /// Duration such as `15s`, `4m` or `1h 30m`.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let (var, Some(value)) = Self::lookup(name) else {
            return Sourced::default_value(default);
        };
        match humantime::parse_duration(value.trim()) {
            Ok(d) => Sourced::from_env(d, var),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                Sourced::default_value(default)
            }
        }
    }

    /// Path with a leading `~` expanded.
    pub fn get_path(&mut self, name: &str, default: &Path) -> Sourced<PathBuf> {
        match Self::lookup(name) {
            (var, Some(value)) => {
                Sourced::from_env(PathBuf::from(shellexpand::tilde(&value).into_owned()), var)
            }
            (_, None) => Sourced::default_value(default.to_path_buf()),
        }
    }

    /// Comma-separated list; blank entries are dropped.
    pub fn get_string_list(&mut self, name: &str, default: &[String]) -> Sourced<Vec<String>> {
        match Self::lookup(name) {
            (var, Some(value)) => Sourced::from_env(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                var,
            ),
            (_, None) => Sourced::default_value(default.to_vec()),
        }
    }
}
