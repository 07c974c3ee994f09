//! In-process request/reply pair
//!
//! Requests travel over a channel bounded by the high-water mark. Each request
//! carries a one-slot reply channel, so a reply can only ever answer the
//! request it belongs to.
//!
//! ```rust
//! use std::thread;
//! use uemix_core::endpoint::memory::rendezvous;
//! use uemix_core::endpoint::{EndpointConfig, SampleSink, SampleSource};
//! use uemix_core::types::Sample;
//!
//! let (mut requester, mut replier) = rendezvous(&EndpointConfig::memory("s0"));
//! let producer = thread::spawn(move || {
//!     while replier.push(&vec![Sample::new(1.0, 0.0); 4]).is_err() {}
//! });
//! let block = loop {
//!     if let Ok(block) = requester.pull() {
//!         break block;
//!     }
//! };
//! assert_eq!(block.len(), 4);
//! producer.join().unwrap();
//! ```

use super::{EndpointConfig, SampleSink, SampleSource, Shutdown};
use crate::error::{ChannelError, ChannelResult};
use crate::types::SampleBlock;
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::time::{Duration, Instant};

struct Request {
    reply: Sender<SampleBlock>,
}

/// Create a connected requester/replier pair.
pub fn rendezvous(config: &EndpointConfig) -> (MemRequester, MemReplier) {
    let (tx, rx) = match config.queue_capacity() {
        Some(cap) => bounded(cap),
        None => unbounded(),
    };

    let replier = MemReplier {
        name: config.name.clone(),
        timeout: config.timeout,
        requests: rx,
        connector: tx,
        shutdown: Shutdown::new(),
    };
    let requester = replier.connect();

    (requester, replier)
}

/// Requester half of an in-process pair.
pub struct MemRequester {
    name: String,
    timeout: Duration,
    requests: Sender<Request>,
    /// Reply slot of a request that timed out before being answered
    pending: Option<Receiver<SampleBlock>>,
    shutdown: Shutdown,
}

impl MemRequester {
    /// Check whether a previous request is still waiting for its reply.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn send_request(&mut self, deadline: Instant) -> ChannelResult<Receiver<SampleBlock>> {
        let (reply, slot) = bounded(1);
        let remaining = deadline.saturating_duration_since(Instant::now());

        select! {
            send(self.requests, Request { reply }) -> res => {
                res.map_err(|_| ChannelError::closed(&self.name, "replier dropped"))?;
            }
            recv(self.shutdown.receiver()) -> _ => {
                return Err(ChannelError::closed(&self.name, "shutdown"));
            }
            default(remaining) => {
                return Err(ChannelError::timeout(&self.name, self.timeout));
            }
        }

        Ok(slot)
    }
}

enum Wait {
    Reply(SampleBlock),
    Dropped,
    Shutdown,
    Expired,
}

impl SampleSource for MemRequester {
    fn name(&self) -> &str {
        &self.name
    }

    fn pull(&mut self) -> ChannelResult<SampleBlock> {
        if self.shutdown.is_triggered() {
            return Err(ChannelError::closed(&self.name, "shutdown"));
        }

        let deadline = Instant::now() + self.timeout;
        let slot = match self.pending.take() {
            Some(slot) => slot,
            None => self.send_request(deadline)?,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = select! {
            recv(slot) -> msg => match msg {
                Ok(block) => Wait::Reply(block),
                Err(_) => Wait::Dropped,
            },
            recv(self.shutdown.receiver()) -> _ => Wait::Shutdown,
            default(remaining) => Wait::Expired,
        };

        match outcome {
            Wait::Reply(block) => Ok(block),
            Wait::Dropped => Err(ChannelError::closed(&self.name, "replier dropped request")),
            Wait::Shutdown => Err(ChannelError::closed(&self.name, "shutdown")),
            Wait::Expired => {
                self.pending = Some(slot);
                Err(ChannelError::timeout(&self.name, self.timeout))
            }
        }
    }

    fn set_shutdown(&mut self, shutdown: &Shutdown) {
        self.shutdown = shutdown.clone();
    }
}

/// Replier half of an in-process pair.
pub struct MemReplier {
    name: String,
    timeout: Duration,
    requests: Receiver<Request>,
    connector: Sender<Request>,
    shutdown: Shutdown,
}

impl MemReplier {
    /// Create another requester sharing this replier's request queue.
    pub fn connect(&self) -> MemRequester {
        MemRequester {
            name: self.name.clone(),
            timeout: self.timeout,
            requests: self.connector.clone(),
            pending: None,
            shutdown: Shutdown::new(),
        }
    }

    /// Number of requests waiting for a reply.
    pub fn queued_requests(&self) -> usize {
        self.requests.len()
    }
}

impl SampleSink for MemReplier {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&mut self, block: &SampleBlock) -> ChannelResult<()> {
        if self.shutdown.is_triggered() {
            return Err(ChannelError::closed(&self.name, "shutdown"));
        }

        let request = select! {
            recv(self.requests) -> req => {
                req.map_err(|_| ChannelError::closed(&self.name, "requester dropped"))?
            }
            recv(self.shutdown.receiver()) -> _ => {
                return Err(ChannelError::closed(&self.name, "shutdown"));
            }
            default(self.timeout) => {
                return Err(ChannelError::timeout(&self.name, self.timeout));
            }
        };

        // Reply slots hold exactly one block, so this never blocks.
        request
            .reply
            .try_send(block.clone())
            .map_err(|_| ChannelError::closed(&self.name, "requester disconnected mid-exchange"))
    }

    fn set_shutdown(&mut self, shutdown: &Shutdown) {
        self.shutdown = shutdown.clone();
    }
}
