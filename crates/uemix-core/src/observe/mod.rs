//! # Observability
//!
//! Logging goes through `tracing`; this module only sets up the subscriber.
//! Runtime counters live in [`crate::stats`].

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
