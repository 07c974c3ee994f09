//! # Multi-UE IQ Mixer
//!
//! This crate connects one base station and several UE modems that exchange
//! baseband IQ samples over synchronous request/reply channels, and mixes
//! their streams so every UE hears the base station and the base station
//! hears a weighted sum of every UE.
//!
//! ## Overview
//!
//! - **Endpoints**: request/reply sample channels (TCP frames, or in-process
//!   for tests) with per-call timeouts and a bounded request queue
//! - **Throttle**: paces a source to `sample_rate / slow_down_divisor`,
//!   retunable while running
//! - **Combiner**: `out = Σ w_k · x_k` over equal-length blocks
//! - **Topology**: declarative sources, mixes, weighted edges and sinks,
//!   validated into an evaluation plan
//! - **Flow graph**: one thread per endpoint plus a tick loop, with an
//!   orderly stop
//!
//! ## Signal Flow
//!
//! As wired by [`Topology::multi_ue`]. [`Topology::default`] sums the
//! throttled `s0` with `s1` and `s2` and fans `s3` out instead; see
//! [`topology`].
//!
//! ```text
//! eNB  tx ─> [throttle] ─┬─ ×0.8 ─> UE1 rx
//!                        ├─ ×0.6 ─> UE2 rx
//!                        └─ ×0.4 ─> UE3 rx
//!
//! UE1 tx ─ ×0.8 ─┐
//! UE2 tx ─ ×0.6 ─┼─(+)─> eNB rx
//! UE3 tx ─ ×0.4 ─┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use uemix_core::{FlowGraph, MixerConfig};
//!
//! let config = MixerConfig::load().unwrap();
//! let graph = FlowGraph::from_config(&config).unwrap();
//! graph.start().unwrap();
//!
//! // Halve the pace of the base station without restarting
//! graph.set_slow_down_divisor(8.0).unwrap();
//!
//! graph.wait();
//! graph.stop();
//! ```

pub mod combiner;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod graph;
pub mod io;
pub mod observe;
pub mod reblock;
pub mod stats;
pub mod throttle;
pub mod topology;
pub mod types;

pub use combiner::{combine, WeightedCombiner};
pub use config::{ConfigError, GraphConfig, MixerConfig, TransportConfig};
pub use endpoint::{Address, EndpointConfig, SampleSink, SampleSource, Shutdown};
pub use error::{ChannelError, ChannelResult, MixerError, MixerResult};
pub use graph::{Endpoints, FlowGraph, GraphEvent, GraphState};
pub use io::IqFormat;
pub use stats::{GraphStats, GraphStatsSnapshot};
pub use throttle::{RateControl, RateLimiter, RateParams};
pub use topology::{MixPlan, Topology, TopologyError};
pub use types::{Sample, SampleBlock, Weight};

/// Common imports for wiring a graph by hand.
pub mod prelude {
    pub use crate::endpoint::memory::{rendezvous, MemReplier, MemRequester};
    pub use crate::endpoint::{EndpointConfig, SampleSink, SampleSource};
    pub use crate::graph::{Endpoints, FlowGraph, GraphEvent, GraphState};
    pub use crate::topology::{EdgeSpec, MixSpec, SinkSpec, SourceSpec, Topology};
    pub use crate::types::{Sample, SampleBlock};
}
