//! # Graph statistics
//!
//! Lock-free counters updated by the worker threads and read from anywhere.
//!
//! ## Example
//!
//! ```rust
//! use uemix_core::stats::GraphStats;
//!
//! let stats = GraphStats::new();
//! stats.record_tick_time_ns(1500);
//! stats.record_tick_time_ns(2500);
//! stats.record_mix_produced();
//!
//! let snapshot = stats.snapshot();
//! assert_eq!(snapshot.ticks, 2);
//! assert_eq!(snapshot.avg_tick_ns, 2000);
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one flow graph.
#[derive(Debug)]
pub struct GraphStats {
    ticks: AtomicU64,
    total_tick_ns: AtomicU64,
    max_tick_ns: AtomicU64,
    min_tick_ns: AtomicU64,
    mixes_produced: AtomicU64,
    mixes_skipped: AtomicU64,
    pull_timeouts: AtomicU64,
    pull_closed: AtomicU64,
    push_timeouts: AtomicU64,
    push_closed: AtomicU64,
    outputs_stalled: AtomicU64,
    samples_in: AtomicU64,
    samples_out: AtomicU64,
}

impl Default for GraphStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStats {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            total_tick_ns: AtomicU64::new(0),
            max_tick_ns: AtomicU64::new(0),
            min_tick_ns: AtomicU64::new(u64::MAX),
            mixes_produced: AtomicU64::new(0),
            mixes_skipped: AtomicU64::new(0),
            pull_timeouts: AtomicU64::new(0),
            pull_closed: AtomicU64::new(0),
            push_timeouts: AtomicU64::new(0),
            push_closed: AtomicU64::new(0),
            outputs_stalled: AtomicU64::new(0),
            samples_in: AtomicU64::new(0),
            samples_out: AtomicU64::new(0),
        }
    }

    /// Record the time spent combining and dispatching one tick.
    #[inline]
    pub fn record_tick_time_ns(&self, time_ns: u64) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.total_tick_ns.fetch_add(time_ns, Ordering::Relaxed);
        self.max_tick_ns.fetch_max(time_ns, Ordering::Relaxed);
        self.min_tick_ns.fetch_min(time_ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mix_produced(&self) {
        self.mixes_produced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mix_skipped(&self) {
        self.mixes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pull_timeout(&self) {
        self.pull_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_pull_closed(&self) {
        self.pull_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_push_timeout(&self) {
        self.push_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_push_closed(&self) {
        self.push_closed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_output_stalled(&self) {
        self.outputs_stalled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_samples_in(&self, count: usize) {
        self.samples_in.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_samples_out(&self, count: usize) {
        self.samples_out.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn mixes_produced(&self) -> u64 {
        self.mixes_produced.load(Ordering::Relaxed)
    }

    pub fn mixes_skipped(&self) -> u64 {
        self.mixes_skipped.load(Ordering::Relaxed)
    }

    /// Copy every counter at once.
    pub fn snapshot(&self) -> GraphStatsSnapshot {
        let ticks = self.ticks();
        let min = self.min_tick_ns.load(Ordering::Relaxed);
        GraphStatsSnapshot {
            ticks,
            mixes_produced: self.mixes_produced(),
            mixes_skipped: self.mixes_skipped(),
            pull_timeouts: self.pull_timeouts.load(Ordering::Relaxed),
            pull_closed: self.pull_closed.load(Ordering::Relaxed),
            push_timeouts: self.push_timeouts.load(Ordering::Relaxed),
            push_closed: self.push_closed.load(Ordering::Relaxed),
            outputs_stalled: self.outputs_stalled.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            samples_out: self.samples_out.load(Ordering::Relaxed),
            min_tick_ns: if min == u64::MAX { 0 } else { min },
            max_tick_ns: self.max_tick_ns.load(Ordering::Relaxed),
            avg_tick_ns: if ticks == 0 {
                0
            } else {
                self.total_tick_ns.load(Ordering::Relaxed) / ticks
            },
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.ticks,
            &self.total_tick_ns,
            &self.max_tick_ns,
            &self.mixes_produced,
            &self.mixes_skipped,
            &self.pull_timeouts,
            &self.pull_closed,
            &self.push_timeouts,
            &self.push_closed,
            &self.outputs_stalled,
            &self.samples_in,
            &self.samples_out,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_tick_ns.store(u64::MAX, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`GraphStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStatsSnapshot {
    pub ticks: u64,
    pub mixes_produced: u64,
    pub mixes_skipped: u64,
    pub pull_timeouts: u64,
    pub pull_closed: u64,
    pub push_timeouts: u64,
    pub push_closed: u64,
    pub outputs_stalled: u64,
    pub samples_in: u64,
    pub samples_out: u64,
    pub min_tick_ns: u64,
    pub max_tick_ns: u64,
    pub avg_tick_ns: u64,
}

impl fmt::Display for GraphStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ticks={} mixes={}/{} skipped pulls(timeout/closed)={}/{} \
             pushes(timeout/closed)={}/{} stalled={} samples in/out={}/{} \
             tick_ns min/avg/max={}/{}/{}",
            self.ticks,
            self.mixes_produced,
            self.mixes_skipped,
            self.pull_timeouts,
            self.pull_closed,
            self.push_timeouts,
            self.push_closed,
            self.outputs_stalled,
            self.samples_in,
            self.samples_out,
            self.min_tick_ns,
            self.avg_tick_ns,
            self.max_tick_ns,
        )
    }
}
