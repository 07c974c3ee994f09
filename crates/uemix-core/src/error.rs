//! Mixer error types

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::io::FormatError;
use crate::topology::TopologyError;

/// Result type for a single channel exchange
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Result type for mixer operations
pub type MixerResult<T> = Result<T, MixerError>;

/// Failure of one request/reply exchange on an endpoint
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// Peer did not answer within the configured window
    #[error("{endpoint}: no response within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    /// Peer disconnected, or the graph is stopping
    #[error("{endpoint}: channel closed ({reason})")]
    Closed { endpoint: String, reason: String },
}

impl ChannelError {
    pub(crate) fn timeout(endpoint: &str, timeout: Duration) -> Self {
        ChannelError::Timeout {
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    pub(crate) fn closed(endpoint: &str, reason: impl Into<String>) -> Self {
        ChannelError::Closed {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if the caller may simply retry the exchange
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChannelError::Timeout { .. })
    }

    /// Name of the endpoint that failed
    pub fn endpoint(&self) -> &str {
        match self {
            ChannelError::Timeout { endpoint, .. } | ChannelError::Closed { endpoint, .. } => {
                endpoint
            }
        }
    }
}

/// Errors raised by the combiner, the rate limiter and the flow graph
#[derive(Error, Debug, Clone)]
pub enum MixerError {
    /// Transport failure surfaced to the caller
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Combiner inputs of different lengths
    #[error("block length mismatch in {mix}: expected {expected}, got {actual}")]
    LengthMismatch {
        mix: String,
        expected: usize,
        actual: usize,
    },

    /// Rate or divisor set to a non-positive or non-finite value
    #[error("invalid parameter {name}: {value} (must be positive and finite)")]
    InvalidParameter { name: &'static str, value: f64 },

    /// Combiner weight outside (0, 1]
    #[error("invalid weight {weight} on {from} -> {to} (must be in (0, 1])")]
    InvalidWeight { from: String, to: String, weight: f32 },

    /// Topology descriptor failed validation
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// A source or sink in the topology has no endpoint attached
    #[error("no endpoint bound for {0}")]
    UnboundEndpoint(String),

    /// Endpoint address could not be parsed or resolved
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Lifecycle call not allowed in the current state
    #[error("cannot {action} graph in state {state}")]
    InvalidState { action: &'static str, state: String },

    /// Worker thread could not be spawned
    #[error("failed to spawn {0}")]
    Spawn(String),

    /// Configuration problem
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Wire codec problem
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl MixerError {
    /// Structural errors indicate a topology or transport bug and stop the graph
    pub fn is_fatal(&self) -> bool {
        matches!(self, MixerError::LengthMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_recoverable() {
        let timeout = ChannelError::timeout("s0", Duration::from_millis(100));
        assert!(timeout.is_recoverable());
        assert_eq!(timeout.endpoint(), "s0");

        let closed = ChannelError::closed("out_a", "peer reset");
        assert!(!closed.is_recoverable());
        assert_eq!(closed.to_string(), "out_a: channel closed (peer reset)");
    }

    #[test]
    fn test_fatal_errors() {
        let mismatch = MixerError::LengthMismatch {
            mix: "mix_a".into(),
            expected: 4,
            actual: 5,
        };
        assert!(mismatch.is_fatal());

        let param = MixerError::InvalidParameter {
            name: "slow_down_divisor",
            value: 0.0,
        };
        assert!(!param.is_fatal());

        let channel: MixerError = ChannelError::closed("s1", "eof").into();
        assert!(!channel.is_fatal());
    }
}
