//! Logging setup shared by the fnbench binary and its tests.
//!
//! Console output goes to stderr so stdout stays free for reports. An optional
//! daily-rolling JSON log file is written through a non-blocking writer whose
//! guard must be held until the process exits.

use crate::config::EnvParser;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {message}")]
    Filter { filter: String, message: String },

    #[error("failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("global subscriber already installed: {0}")]
    Init(String),
}

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `fnbench=debug,ureq=warn`.
    pub filter: String,
    pub format: LogFormat,
    /// Directory for the rolling JSON log file. `None` disables file output.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
            directory: None,
            file_prefix: "fnbench.log".to_string(),
        }
    }
}

impl LogConfig {
    /// Read `FNBENCH_LOG`, `FNBENCH_LOG_FORMAT` and `FNBENCH_LOG_DIR`.
    ///
    /// Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let mut parser = EnvParser::new();
        let defaults = Self::default();
        let filter = parser.get_string("LOG", &defaults.filter).value;
        let format = parser
            .get_string("LOG_FORMAT", "pretty")
            .value
            .parse()
            .unwrap_or_default();
        let directory = parser
            .get_optional_string("LOG_DIR")
            .value
            .map(|d| PathBuf::from(shellexpand::tilde(&d).into_owned()));
        Self {
            filter,
            format,
            directory,
            ..defaults
        }
    }

    /// Raise the console filter to `debug` (or `trace` for `-vv`).
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.filter = "debug".to_string(),
            _ => self.filter = "trace".to_string(),
        }
        self
    }
}

/// Keeps the non-blocking file writer alive. Drop flushes it.
#[derive(Default)]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let filter = EnvFilter::try_new(&config.filter).map_err(|e| LoggingError::Filter {
        filter: config.filter.clone(),
        message: e.to_string(),
    })?;

    let console = match config.format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let mut guards = LoggingGuards::default();
    let file_layer = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::Directory {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards._file = Some(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console.with_filter(filter))
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(guards)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_with_verbosity() {
        assert_eq!(LogConfig::default().with_verbosity(0).filter, "info");
        assert_eq!(LogConfig::default().with_verbosity(1).filter, "debug");
        assert_eq!(LogConfig::default().with_verbosity(3).filter, "trace");
    }

    #[test]
    fn test_from_env() {
        let _guard = env_test_lock();
        // SAFETY: env access is serialized by env_test_lock
        unsafe {
            std::env::set_var("FNBENCH_LOG", "fnbench=debug");
            std::env::set_var("FNBENCH_LOG_FORMAT", "json");
            std::env::remove_var("FNBENCH_LOG_DIR");
        }
        let config = LogConfig::from_env();
        unsafe {
            std::env::remove_var("FNBENCH_LOG");
            std::env::remove_var("FNBENCH_LOG_FORMAT");
        }
        assert_eq!(config.filter, "fnbench=debug");
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.directory.is_none());
    }
}
