//! # Configuration System
//!
//! YAML configuration for the mixer:
//!
//! - Graph settings (rate, slow-down divisor, re-blocking, queue depth, grace)
//! - Transport defaults (timeout, high-water mark, wire format)
//! - Topology (sources, mixes, weighted edges, sinks and their addresses)
//! - Logging
//!
//! ## Configuration Search Path
//!
//! Configuration is loaded from the first file found:
//! 1. Path specified via `UEMIX_CONFIG` environment variable
//! 2. `./uemix.yaml` (current directory)
//! 3. `~/.config/uemix/config.yaml` (user config)
//! 4. `/etc/uemix/config.yaml` (system config)
//!
//! ## Example Configuration
//!
//! ```yaml
//! graph:
//!   sample_rate: 11.52e6
//!   slow_down_divisor: 4
//!
//! transport:
//!   timeout_ms: 100
//!   high_water_mark: 1
//!
//! topology:
//!   sources:
//!     - { name: s0, address: "tcp://192.168.60.3:2000", throttle: true }
//!   mixes:
//!     - { name: mix_a }
//!   edges:
//!     - { from: s0, to: mix_a, weight: 0.8 }
//!   sinks:
//!     - { name: out_a, from: mix_a, address: "tcp://0.0.0.0:2001" }
//! ```

use crate::endpoint::{Address, EndpointConfig};
use crate::io::IqFormat;
use crate::observe::LogConfig;
use crate::topology::{SinkSpec, SourceSpec, Topology};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Error type for configuration operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Configuration file not found
    NotFound(String),
    /// Failed to read or write configuration file
    ReadError(String),
    /// Failed to parse configuration
    ParseError(String),
    /// Invalid configuration value
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(msg) => write!(f, "config not found: {}", msg),
            ConfigError::ReadError(msg) => write!(f, "failed to read config: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "failed to parse config: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Flow graph settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Nominal sample rate in samples/second
    pub sample_rate: f64,
    /// Throttled streams run at `sample_rate / slow_down_divisor`
    pub slow_down_divisor: f64,
    /// Regroup pulled samples into blocks of this size (0 = as received)
    pub block_size: usize,
    /// Blocks buffered between each worker and the tick thread
    pub queue_depth: usize,
    /// How long `stop()` lets in-flight exchanges finish
    pub grace_ms: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sample_rate: 11_520_000.0,
            slow_down_divisor: 4.0,
            block_size: 0,
            queue_depth: 4,
            grace_ms: 500,
        }
    }
}

impl GraphConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Transport defaults shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on a single pull or push
    pub timeout_ms: u64,
    /// Queued request cap; 0 or negative means unbounded
    pub high_water_mark: i32,
    /// Sample encoding on the wire
    pub format: IqFormat,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            high_water_mark: 1,
            format: IqFormat::Cf32,
        }
    }
}

/// Complete mixer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Configuration version
    pub version: String,
    pub graph: GraphConfig,
    pub transport: TransportConfig,
    pub topology: Topology,
    pub logging: LogConfig,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            graph: GraphConfig::default(),
            transport: TransportConfig::default(),
            topology: Topology::default(),
            logging: LogConfig::default(),
        }
    }
}

impl MixerConfig {
    /// Load configuration from the default search path.
    ///
    /// Returns the defaults if no file is found. A `UEMIX_CONFIG` pointing
    /// at a missing file is an error.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::locate()? {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// First existing file on the search path.
    pub fn locate() -> Result<Option<PathBuf>, ConfigError> {
        if let Ok(path) = std::env::var("UEMIX_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::NotFound(format!(
                "UEMIX_CONFIG={}",
                path.display()
            )));
        }

        Ok(Self::config_search_paths().into_iter().find(|p| p.exists()))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))
    }

    /// Get configuration search paths.
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./uemix.yaml")];

        if let Some(dirs) = directories::ProjectDirs::from("", "", "uemix") {
            paths.push(dirs.config_dir().join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/uemix/config.yaml"));
        paths
    }

    /// Validate the configuration, topology included.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        let g = &self.graph;
        if !(g.sample_rate.is_finite() && g.sample_rate > 0.0) {
            return invalid(format!("sample_rate must be positive, got {}", g.sample_rate));
        }
        if !(g.slow_down_divisor.is_finite() && g.slow_down_divisor > 0.0) {
            return invalid(format!(
                "slow_down_divisor must be positive, got {}",
                g.slow_down_divisor
            ));
        }
        if g.queue_depth == 0 {
            return invalid("queue_depth must be > 0".to_string());
        }
        if self.transport.timeout_ms == 0 {
            return invalid("timeout_ms must be > 0".to_string());
        }

        self.topology
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        for source in &self.topology.sources {
            self.source_endpoint(source)?;
        }
        for sink in &self.topology.sinks {
            self.sink_endpoint(sink)?;
        }

        if self.transport.high_water_mark <= 0 {
            warn!(
                high_water_mark = self.transport.high_water_mark,
                "unbounded request queues; memory grows if a peer stalls"
            );
        }

        Ok(())
    }

    /// Endpoint settings for a source, with per-source overrides applied.
    pub fn source_endpoint(&self, source: &SourceSpec) -> Result<EndpointConfig, ConfigError> {
        self.endpoint(
            &source.name,
            source.address.as_deref(),
            source.timeout_ms,
            source.high_water_mark,
        )
    }

    /// Endpoint settings for a sink, with per-sink overrides applied.
    pub fn sink_endpoint(&self, sink: &SinkSpec) -> Result<EndpointConfig, ConfigError> {
        self.endpoint(
            &sink.name,
            sink.address.as_deref(),
            sink.timeout_ms,
            sink.high_water_mark,
        )
    }

    fn endpoint(
        &self,
        name: &str,
        address: Option<&str>,
        timeout_ms: Option<u64>,
        high_water_mark: Option<i32>,
    ) -> Result<EndpointConfig, ConfigError> {
        let address = address.ok_or_else(|| {
            ConfigError::ValidationError(format!("endpoint '{}' has no address", name))
        })?;
        Address::parse(address)
            .map_err(|e| ConfigError::ValidationError(format!("endpoint '{}': {}", name, e)))?;

        let timeout_ms = timeout_ms.unwrap_or(self.transport.timeout_ms);
        if timeout_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "endpoint '{}': timeout_ms must be > 0",
                name
            )));
        }

        Ok(EndpointConfig::new(name, address)
            .with_timeout(Duration::from_millis(timeout_ms))
            .with_high_water_mark(high_water_mark.unwrap_or(self.transport.high_water_mark))
            .with_format(self.transport.format))
    }

    /// Generate example configuration YAML.
    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::default()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MixerConfig::default();
        assert_eq!(config.graph.sample_rate, 11_520_000.0);
        assert_eq!(config.graph.slow_down_divisor, 4.0);
        assert_eq!(config.transport.timeout_ms, 100);
        assert_eq!(config.transport.high_water_mark, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
graph:
  slow_down_divisor: 2
transport:
  format: cf64
"#;
        let config = MixerConfig::parse(yaml).unwrap();
        assert_eq!(config.graph.slow_down_divisor, 2.0);
        assert_eq!(config.transport.format, IqFormat::Cf64);
        // Defaults fill the rest
        assert_eq!(config.graph.sample_rate, 11_520_000.0);
        assert_eq!(config.topology, Topology::default());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            MixerConfig::parse("graph: [1, 2]"),
            Err(ConfigError::ParseError(_))
        ));
        assert!(matches!(
            MixerConfig::parse("transport:\n  format: cu8\n"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = MixerConfig::default();
        config.graph.slow_down_divisor = 0.0;
        assert!(config.validate().is_err());

        let mut config = MixerConfig::default();
        config.graph.queue_depth = 0;
        assert!(config.validate().is_err());

        let mut config = MixerConfig::default();
        config.topology.sources[1].address = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("s1"), "{}", err);

        let mut config = MixerConfig::default();
        config.topology.sinks[0].address = Some("2001".into());
        assert!(config.validate().is_err());

        let mut config = MixerConfig::default();
        config.topology.edges[0].weight = 2.0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        // Unbounded queues are allowed, only warned about
        let mut config = MixerConfig::default();
        config.transport.high_water_mark = -1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_overrides() {
        let mut config = MixerConfig::default();
        config.topology.sinks[0].timeout_ms = Some(250);
        config.topology.sinks[0].high_water_mark = Some(0);

        let sink = config.sink_endpoint(&config.topology.sinks[0]).unwrap();
        assert_eq!(sink.timeout, Duration::from_millis(250));
        assert_eq!(sink.high_water_mark, 0);

        let source = config.source_endpoint(&config.topology.sources[0]).unwrap();
        assert_eq!(source.timeout, Duration::from_millis(100));
        assert_eq!(source.address, "tcp://192.168.60.3:2000");
    }

    #[test]
    fn test_example_yaml() {
        let yaml = MixerConfig::example_yaml();
        assert!(yaml.contains("graph:"));
        assert!(yaml.contains("topology:"));
        let parsed = MixerConfig::parse(&yaml).unwrap();
        assert_eq!(parsed, MixerConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("uemix-config-{}.yaml", std::process::id()));
        let mut config = MixerConfig::default();
        config.topology = Topology::multi_ue();
        config.save(&path).unwrap();

        let loaded = MixerConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_search_paths() {
        let paths = MixerConfig::config_search_paths();
        assert!(paths[0].ends_with("uemix.yaml"));
        assert!(paths.last().unwrap().starts_with("/etc/uemix"));
    }
}
