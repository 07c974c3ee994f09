//! # Structured Logging
//!
//! Installs the global `tracing` subscriber:
//!
//! - JSON, pretty or compact output on stderr
//! - Level from the configuration, overridden by `RUST_LOG` when set
//! - Optional module filter (e.g. `uemix_core::endpoint=debug`)
//!
//! ## Example
//!
//! ```rust
//! use uemix_core::observe::{init_logging, LogConfig, LogFormat, LogLevel};
//!
//! let config = LogConfig {
//!     level: LogLevel::Debug,
//!     format: LogFormat::Json,
//!     ..Default::default()
//! };
//! init_logging(&config);
//!
//! tracing::info!(samples = 1024, "block forwarded");
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Machine-readable, one JSON object per event
    Json,
    /// Multi-line, human-readable
    Pretty,
    /// One line per event
    #[default]
    Compact,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file:line
    pub source_location: bool,
    /// Include worker thread names (`src-s0`, `tick`, `sink-out_a`, ...)
    pub thread_names: bool,
    /// Directive string replacing `level`, e.g. `uemix_core=debug`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            source_location: false,
            thread_names: true,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Verbose preset for bench work.
    pub fn development() -> Self {
        Self {
            level: LogLevel::Debug,
            format: LogFormat::Pretty,
            source_location: true,
            ..Default::default()
        }
    }

    /// JSON preset for log collectors.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            ..Default::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string());
        match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => match &self.filter {
                Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|_| fallback()),
                None => fallback(),
            },
        }
    }
}

/// Install the global subscriber. Calls after the first are ignored.
pub fn init_logging(config: &LogConfig) {
    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(config.thread_names);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(layer)
        .with(config.env_filter());

    // Already installed by an earlier call or by the host application
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse_and_display() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Error.to_string(), "error");
    }

    #[test]
    fn test_presets() {
        let dev = LogConfig::development();
        assert_eq!(dev.level, LogLevel::Debug);
        assert!(dev.source_location);
        assert_eq!(LogConfig::production().format, LogFormat::Json);
    }

    #[test]
    fn test_partial_yaml() {
        let config: LogConfig = serde_yaml::from_str("format: json").unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.thread_names);
    }

    #[test]
    fn test_repeated_init_is_ignored() {
        init_logging(&LogConfig::default());
        init_logging(&LogConfig::production());
        tracing::info!("still logging");
    }
}
