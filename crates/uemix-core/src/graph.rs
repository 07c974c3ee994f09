//! # Flow Graph
//!
//! Owns the endpoints, the rate limiter and the compiled mix plan, and runs
//! them on dedicated threads:
//!
//! ```text
//!  src-s0: pull ─> reblock ─> throttle ─┐
//!  src-s1: pull ─> reblock ─────────────┤  bounded
//!  src-s2: pull ─> reblock ─────────────┤  queues     tick: gather one outcome
//!  src-s3: pull ─> reblock ─────────────┘ ─────────>       per source, evaluate
//!                                                          mixes, dispatch
//!                        sink-out_a <─┐                        │
//!                        sink-out_b <─┤  bounded queues        │
//!                        sink-out_c <─┤ <──────────────────────┘
//!                        sink-out_d <─┘  (full queue: block dropped, stall event)
//! ```
//!
//! Lifecycle: `Constructed -> Running -> Stopping -> Stopped`. [`FlowGraph::stop`]
//! first lets workers finish the exchange they are in (no new pulls or
//! pushes start), then triggers the shared [`Shutdown`] once the grace period
//! runs out so blocked calls return `Closed`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use uemix_core::config::MixerConfig;
//! use uemix_core::graph::FlowGraph;
//!
//! let config = MixerConfig::load().unwrap();
//! let graph = FlowGraph::from_config(&config).unwrap();
//! graph.start().unwrap();
//! graph.set_slow_down_divisor(2.0).unwrap();
//! graph.stop();
//! ```

use crate::config::{GraphConfig, MixerConfig};
use crate::endpoint::{open_sink, open_source, SampleSink, SampleSource, Shutdown};
use crate::error::{ChannelError, MixerError, MixerResult};
use crate::reblock::Reblocker;
use crate::stats::GraphStats;
use crate::throttle::{RateControl, RateLimiter, RateParams};
use crate::topology::{MixOutcome, MixPlan, Topology};
use crate::types::{SampleBlock, Weight};
use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the event channel; older events are discarded when full.
pub const EVENT_CAPACITY: usize = 1024;

/// Pause after a `Closed` pull before dialling again
const CLOSED_BACKOFF: Duration = Duration::from_millis(100);

/// Poll interval while waiting for workers during the grace period
const JOIN_POLL: Duration = Duration::from_millis(5);

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Constructed,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GraphState::Constructed => "constructed",
            GraphState::Running => "running",
            GraphState::Stopping => "stopping",
            GraphState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Things worth telling the operator about.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    Started,
    /// A pull timed out or the source disconnected
    SourceFailed { source: String, error: ChannelError },
    /// A mix had no block this tick because `missing` delivered nothing
    MixSkipped { mix: String, missing: String },
    /// The sink's queue was full; this tick's block for it was dropped
    OutputStalled { sink: String },
    /// A push failed with `Closed`; the block was dropped
    SinkFailed { sink: String, error: ChannelError },
    /// Structural error; the tick loop has ended
    Fault(MixerError),
    Stopped,
}

/// Endpoints keyed by the topology names they serve.
#[derive(Default)]
pub struct Endpoints {
    sources: HashMap<String, Box<dyn SampleSource>>,
    sinks: HashMap<String, Box<dyn SampleSink>>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a source under its own name.
    pub fn with_source(mut self, source: impl SampleSource + 'static) -> Self {
        self.insert_source(Box::new(source));
        self
    }

    /// Bind a sink under its own name.
    pub fn with_sink(mut self, sink: impl SampleSink + 'static) -> Self {
        self.insert_sink(Box::new(sink));
        self
    }

    pub fn insert_source(&mut self, source: Box<dyn SampleSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn insert_sink(&mut self, sink: Box<dyn SampleSink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    /// Open TCP endpoints for every source and sink in the configuration.
    ///
    /// Sinks bind their listening sockets here; sources dial on first pull.
    pub fn open(config: &MixerConfig) -> MixerResult<Self> {
        let mut endpoints = Self::new();
        for source in &config.topology.sources {
            let endpoint = config.source_endpoint(source)?;
            endpoints.insert_source(open_source(&endpoint)?);
        }
        for sink in &config.topology.sinks {
            let endpoint = config.sink_endpoint(sink)?;
            endpoints.insert_sink(open_sink(&endpoint)?);
        }
        Ok(endpoints)
    }
}

impl fmt::Debug for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoints")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// State shared with the worker threads.
struct Shared {
    state: Mutex<GraphState>,
    /// Set by `stop()`: no new exchanges may start
    draining: AtomicBool,
    fault: Mutex<Option<MixerError>>,
    shutdown: Shutdown,
    stats: Arc<GraphStats>,
    events: Sender<GraphEvent>,
    /// Used to discard the oldest event when the channel is full
    events_rx: Receiver<GraphEvent>,
}

impl Shared {
    fn emit(&self, event: GraphEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            let _ = self.events_rx.try_recv();
            let _ = self.events.try_send(event);
        }
    }

    fn should_stop(&self) -> bool {
        self.draining.load(Ordering::SeqCst) || self.shutdown.is_triggered()
    }

    fn state(&self) -> GraphState {
        *lock(&self.state)
    }

    fn set_state(&self, state: GraphState) {
        *lock(&self.state) = state;
    }
}

struct Control {
    endpoints: Option<Endpoints>,
    handles: Vec<JoinHandle<()>>,
    /// Dropped when the tick loop ends, releasing `wait()`
    done: Option<Sender<()>>,
}

/// The running sample-flow network.
pub struct FlowGraph {
    config: GraphConfig,
    plan: Arc<ArcSwap<MixPlan>>,
    rate: Arc<RateControl>,
    shared: Arc<Shared>,
    control: Mutex<Control>,
    done: Receiver<()>,
    /// Serialises weight updates
    tuning: Mutex<()>,
}

impl FlowGraph {
    /// Validate the topology and bind it to `endpoints`.
    pub fn new(topology: &Topology, config: GraphConfig, endpoints: Endpoints) -> MixerResult<Self> {
        let plan = topology.validate()?;
        let rate = RateControl::new(config.sample_rate, config.slow_down_divisor)?;
        if config.queue_depth == 0 {
            return Err(MixerError::InvalidParameter {
                name: "queue_depth",
                value: 0.0,
            });
        }

        for source in &plan.sources {
            if !endpoints.sources.contains_key(&source.name) {
                return Err(MixerError::UnboundEndpoint(source.name.clone()));
            }
        }
        for sink in &plan.sinks {
            if !endpoints.sinks.contains_key(&sink.name) {
                return Err(MixerError::UnboundEndpoint(sink.name.clone()));
            }
        }

        let (events, events_rx) = bounded(EVENT_CAPACITY);
        let (done_tx, done) = bounded(0);

        Ok(Self {
            config,
            plan: Arc::new(ArcSwap::from_pointee(plan)),
            rate: Arc::new(rate),
            shared: Arc::new(Shared {
                state: Mutex::new(GraphState::Constructed),
                draining: AtomicBool::new(false),
                fault: Mutex::new(None),
                shutdown: Shutdown::new(),
                stats: Arc::new(GraphStats::new()),
                events,
                events_rx,
            }),
            control: Mutex::new(Control {
                endpoints: Some(endpoints),
                handles: Vec::new(),
                done: Some(done_tx),
            }),
            done,
            tuning: Mutex::new(()),
        })
    }

    /// Validate `config`, open its TCP endpoints and build the graph.
    pub fn from_config(config: &MixerConfig) -> MixerResult<Self> {
        config.validate()?;
        let endpoints = Endpoints::open(config)?;
        Self::new(&config.topology, config.graph.clone(), endpoints)
    }

    pub fn state(&self) -> GraphState {
        self.shared.state()
    }

    /// Structural error that ended the tick loop, if any.
    pub fn fault(&self) -> Option<MixerError> {
        lock(&self.shared.fault).clone()
    }

    /// Event stream. Clones share one queue.
    pub fn events(&self) -> Receiver<GraphEvent> {
        self.shared.events_rx.clone()
    }

    pub fn stats(&self) -> &Arc<GraphStats> {
        &self.shared.stats
    }

    pub fn rate_control(&self) -> &Arc<RateControl> {
        &self.rate
    }

    /// Current plan snapshot.
    pub fn plan(&self) -> Arc<MixPlan> {
        self.plan.load_full()
    }

    pub fn set_sample_rate(&self, sample_rate: f64) -> MixerResult<RateParams> {
        self.rate.set_sample_rate(sample_rate)
    }

    pub fn set_slow_down_divisor(&self, slow_down_divisor: f64) -> MixerResult<RateParams> {
        self.rate.set_slow_down_divisor(slow_down_divisor)
    }

    /// Replace the weight of edge `from -> mix`; applies from the next tick.
    pub fn set_weight(&self, mix: &str, from: &str, weight: Weight) -> MixerResult<()> {
        let _guard = lock(&self.tuning);
        let updated = self.plan.load().with_weight(mix, from, weight)?;
        self.plan.store(Arc::new(updated));
        info!(mix, from, weight, "weight changed");
        Ok(())
    }

    /// Spawn the worker threads.
    pub fn start(&self) -> MixerResult<()> {
        let mut control = lock(&self.control);
        let state = self.state();
        if state != GraphState::Constructed {
            return Err(MixerError::InvalidState {
                action: "start",
                state: state.to_string(),
            });
        }
        let (Some(mut endpoints), Some(done)) = (control.endpoints.take(), control.done.take())
        else {
            return Err(MixerError::InvalidState {
                action: "start",
                state: state.to_string(),
            });
        };

        let plan = self.plan.load_full();
        let mut spawned = Vec::new();
        let result = self.spawn_workers(&plan, &mut endpoints, done, &mut spawned);
        control.handles = spawned;

        if let Err(e) = result {
            error!(error = %e, "failed to start graph");
            self.shared.shutdown.trigger();
            for handle in control.handles.drain(..) {
                let _ = handle.join();
            }
            self.shared.set_state(GraphState::Stopped);
            return Err(e);
        }

        self.shared.set_state(GraphState::Running);
        self.shared.emit(GraphEvent::Started);
        let params = self.rate.params();
        info!(
            sources = plan.sources.len(),
            mixes = plan.mixes.len(),
            sinks = plan.sinks.len(),
            effective_rate = params.effective_rate,
            "graph started"
        );
        Ok(())
    }

    fn spawn_workers(
        &self,
        plan: &MixPlan,
        endpoints: &mut Endpoints,
        done: Sender<()>,
        spawned: &mut Vec<JoinHandle<()>>,
    ) -> MixerResult<()> {
        let shutdown = &self.shared.shutdown;

        let mut outputs = Vec::with_capacity(plan.sinks.len());
        for planned in &plan.sinks {
            let mut sink = endpoints
                .sinks
                .remove(&planned.name)
                .ok_or_else(|| MixerError::UnboundEndpoint(planned.name.clone()))?;
            sink.set_shutdown(shutdown);
            let (tx, rx) = bounded(self.config.queue_depth);
            outputs.push(tx);

            let worker = SinkWorker {
                sink,
                queue: rx,
                shared: self.shared.clone(),
            };
            spawned.push(spawn(format!("sink-{}", planned.name), move || worker.run())?);
        }

        let mut inputs = Vec::with_capacity(plan.sources.len());
        for spec in &plan.sources {
            let mut source = endpoints
                .sources
                .remove(&spec.name)
                .ok_or_else(|| MixerError::UnboundEndpoint(spec.name.clone()))?;
            source.set_shutdown(shutdown);
            let limiter = spec.throttle.then(|| {
                let mut limiter = RateLimiter::new(self.rate.clone());
                limiter.set_shutdown(shutdown);
                limiter
            });
            let (tx, rx) = bounded(self.config.queue_depth);
            inputs.push(rx);

            let worker = SourceWorker {
                source,
                reblocker: Reblocker::new(self.config.block_size),
                limiter,
                queue: tx,
                shared: self.shared.clone(),
            };
            spawned.push(spawn(format!("src-{}", spec.name), move || worker.run())?);
        }

        let tick = TickLoop {
            plan: self.plan.clone(),
            inputs,
            stalls: StallLog::new(outputs.len()),
            outputs,
            shared: self.shared.clone(),
            _done: done,
        };
        spawned.push(spawn("tick".to_string(), move || tick.run())?);
        Ok(())
    }

    /// Block until the tick loop ends (fault or stop).
    pub fn wait(&self) {
        let _ = self.done.recv();
    }

    /// Like [`wait`](Self::wait) with a bound. Returns `true` if the loop ended.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }

    /// Orderly shutdown. Idempotent.
    pub fn stop(&self) {
        let mut control = lock(&self.control);
        match self.state() {
            GraphState::Stopped => return,
            GraphState::Constructed => {
                control.endpoints = None;
                control.done = None;
                self.shared.set_state(GraphState::Stopped);
                self.shared.emit(GraphEvent::Stopped);
                info!("graph released before start");
                return;
            }
            GraphState::Running | GraphState::Stopping => {}
        }

        self.shared.set_state(GraphState::Stopping);
        self.shared.draining.store(true, Ordering::SeqCst);
        info!(grace_ms = self.config.grace_ms, "stopping graph");

        let deadline = Instant::now() + self.config.grace();
        while Instant::now() < deadline && !control.handles.iter().all(|h| h.is_finished()) {
            thread::sleep(JOIN_POLL);
        }
        if !control.handles.iter().all(|h| h.is_finished()) {
            warn!("grace period expired, cancelling in-flight exchanges");
        }
        self.shared.shutdown.trigger();

        for handle in control.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "worker panicked");
            }
        }

        self.shared.set_state(GraphState::Stopped);
        self.shared.emit(GraphEvent::Stopped);
        info!(stats = %self.shared.stats.snapshot(), "graph stopped");
    }
}

impl Drop for FlowGraph {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn<F>(name: String, f: F) -> MixerResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| MixerError::Spawn(format!("{}: {}", name, e)))
}

type SourceItem = Result<SampleBlock, ChannelError>;

struct SourceWorker {
    source: Box<dyn SampleSource>,
    reblocker: Reblocker,
    limiter: Option<RateLimiter>,
    queue: Sender<SourceItem>,
    shared: Arc<Shared>,
}

impl SourceWorker {
    fn run(mut self) {
        let name = self.source.name().to_string();
        debug!(source = %name, throttled = self.limiter.is_some(), "source worker started");

        while !self.shared.should_stop() {
            if let Some(block) = self.reblocker.next_block() {
                let block = match self.limiter.as_mut() {
                    Some(limiter) => match limiter.throttle(block) {
                        Some(block) => block,
                        None => break,
                    },
                    None => block,
                };
                if !self.forward(Ok(block)) {
                    break;
                }
                continue;
            }

            match self.source.pull() {
                Ok(block) => {
                    self.shared.stats.record_samples_in(block.len());
                    self.reblocker.feed(block);
                }
                Err(_) if self.shared.shutdown.is_triggered() => break,
                Err(e) => {
                    let closed = !e.is_recoverable();
                    if closed {
                        self.shared.stats.record_pull_closed();
                        warn!(source = %name, error = %e, "pull failed");
                    } else {
                        self.shared.stats.record_pull_timeout();
                        debug!(source = %name, "pull timed out");
                    }
                    self.shared.emit(GraphEvent::SourceFailed {
                        source: name.clone(),
                        error: e.clone(),
                    });
                    if !self.forward(Err(e)) {
                        break;
                    }
                    if closed && !self.shared.shutdown.sleep(CLOSED_BACKOFF) {
                        break;
                    }
                }
            }
        }

        debug!(source = %name, "source worker exiting");
    }

    /// Hand one outcome to the tick loop; `false` once it is gone.
    fn forward(&self, item: SourceItem) -> bool {
        select! {
            send(self.queue, item) -> res => res.is_ok(),
            recv(self.shared.shutdown.receiver()) -> _ => false,
        }
    }
}

/// Per-output stall flags, so a sink with no consumer warns once rather
/// than on every tick.
#[derive(Debug)]
struct StallLog {
    stalled: Vec<bool>,
}

impl StallLog {
    fn new(outputs: usize) -> Self {
        Self {
            stalled: vec![false; outputs],
        }
    }

    /// Mark output `i` stalled; `true` if it was flowing until now.
    fn stalled(&mut self, i: usize) -> bool {
        self.stalled
            .get_mut(i)
            .map_or(false, |flag| !std::mem::replace(flag, true))
    }

    /// Mark output `i` flowing; `true` if it was stalled until now.
    fn accepted(&mut self, i: usize) -> bool {
        self.stalled
            .get_mut(i)
            .map_or(false, |flag| std::mem::replace(flag, false))
    }
}

struct TickLoop {
    plan: Arc<ArcSwap<MixPlan>>,
    inputs: Vec<Receiver<SourceItem>>,
    stalls: StallLog,
    outputs: Vec<Sender<SampleBlock>>,
    shared: Arc<Shared>,
    _done: Sender<()>,
}

impl TickLoop {
    fn run(mut self) {
        debug!("tick loop started");
        while !self.shared.should_stop() {
            let Some(blocks) = self.gather() else {
                break;
            };
            if let Some(fault) = self.tick(&blocks) {
                error!(error = %fault, "fatal error, tick loop ending");
                *lock(&self.shared.fault) = Some(fault.clone());
                self.shared.emit(GraphEvent::Fault(fault));
                let mut state = lock(&self.shared.state);
                if *state == GraphState::Running {
                    *state = GraphState::Stopping;
                }
                break;
            }
        }
        debug!("tick loop exiting");
    }

    /// One outcome per source, in plan order. `None` once inputs are gone.
    fn gather(&self) -> Option<Vec<Option<SampleBlock>>> {
        let plan = self.plan.load();
        let mut blocks = Vec::with_capacity(self.inputs.len());
        for (rx, spec) in self.inputs.iter().zip(&plan.sources) {
            let item = select! {
                recv(rx) -> item => item.ok()?,
                recv(self.shared.shutdown.receiver()) -> _ => return None,
            };
            match item {
                Ok(block) => blocks.push(Some(block)),
                Err(e) => {
                    debug!(source = %spec.name, error = %e, "no block this tick");
                    blocks.push(None);
                }
            }
        }
        Some(blocks)
    }

    /// Evaluate and dispatch one tick; returns a fatal error if one occurred.
    fn tick(&mut self, blocks: &[Option<SampleBlock>]) -> Option<MixerError> {
        let started = Instant::now();
        let plan = self.plan.load();
        let stats = &self.shared.stats;
        let outcomes = plan.evaluate(blocks);

        let mut fault = None;
        for (planned, outcome) in plan.mixes.iter().zip(&outcomes) {
            match outcome {
                MixOutcome::Ready(_) => stats.record_mix_produced(),
                MixOutcome::Skipped { missing } => {
                    stats.record_mix_skipped();
                    self.shared.emit(GraphEvent::MixSkipped {
                        mix: planned.name.clone(),
                        missing: missing.clone(),
                    });
                }
                MixOutcome::Failed(e) => {
                    stats.record_mix_skipped();
                    if e.is_fatal() && fault.is_none() {
                        fault = Some(e.clone());
                    }
                }
            }
        }

        for (i, (sink, queue)) in plan.sinks.iter().zip(&self.outputs).enumerate() {
            let Some(block) = plan.sink_block(sink, blocks, &outcomes) else {
                continue;
            };
            match queue.try_send(block.clone()) {
                Ok(()) => {
                    if self.stalls.accepted(i) {
                        info!(sink = %sink.name, "output queue draining again");
                    }
                }
                Err(TrySendError::Full(_)) => {
                    stats.record_output_stalled();
                    if self.stalls.stalled(i) {
                        warn!(sink = %sink.name, "output queue full, dropping blocks until it drains");
                    } else {
                        debug!(sink = %sink.name, "output queue still full, block dropped");
                    }
                    self.shared.emit(GraphEvent::OutputStalled {
                        sink: sink.name.clone(),
                    });
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        stats.record_tick_time_ns(started.elapsed().as_nanos() as u64);
        fault
    }
}

struct SinkWorker {
    sink: Box<dyn SampleSink>,
    queue: Receiver<SampleBlock>,
    shared: Arc<Shared>,
}

impl SinkWorker {
    fn run(mut self) {
        let name = self.sink.name().to_string();
        debug!(sink = %name, "sink worker started");

        'blocks: loop {
            let block = select! {
                recv(self.queue) -> block => match block {
                    Ok(block) => block,
                    Err(_) => break,
                },
                recv(self.shared.shutdown.receiver()) -> _ => break,
            };

            // Retry timeouts with the same block until it is taken
            loop {
                if self.shared.should_stop() {
                    break 'blocks;
                }
                match self.sink.push(&block) {
                    Ok(()) => {
                        self.shared.stats.record_samples_out(block.len());
                        continue 'blocks;
                    }
                    Err(e) if e.is_recoverable() => {
                        self.shared.stats.record_push_timeout();
                        debug!(sink = %name, "push timed out, retrying");
                    }
                    Err(_) if self.shared.shutdown.is_triggered() => break 'blocks,
                    Err(e) => {
                        self.shared.stats.record_push_closed();
                        warn!(sink = %name, error = %e, "push failed, block dropped");
                        self.shared.emit(GraphEvent::SinkFailed {
                            sink: name.clone(),
                            error: e,
                        });
                        continue 'blocks;
                    }
                }
            }
        }

        debug!(sink = %name, "sink worker exiting");
    }
}
