//! Sample channel endpoints
//!
//! An endpoint moves whole [`SampleBlock`]s across a strict request/reply
//! channel. The requester side ([`SampleSource`]) asks for the next block and
//! waits for it; the replier side ([`SampleSink`]) waits for a request and
//! answers it with one block. Neither side ever has more than one exchange in
//! flight.
//!
//! ```text
//!   requester (pull)                replier (push)
//!        |  ---- request ---------->  |
//!        |                            |  block ready
//!        |  <--- reply (1 block) ---  |
//! ```
//!
//! Two transports are provided:
//!
//! - [`memory`]: in-process pair built on bounded channels, used by tests and
//!   for wiring graphs together inside one process.
//! - [`tcp`]: length-prefixed frames over TCP, built from an
//!   [`EndpointConfig`] with [`open_source`] / [`open_sink`].

pub mod memory;
pub mod tcp;

use crate::error::{ChannelResult, MixerError, MixerResult};
use crate::io::IqFormat;
use crate::types::SampleBlock;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default exchange timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default high-water mark (one queued request, strict rendezvous).
pub const DEFAULT_HIGH_WATER_MARK: i32 = 1;

/// Requester side of a channel: produces blocks on demand.
pub trait SampleSource: Send {
    /// Endpoint name used in logs and errors
    fn name(&self) -> &str;

    /// Request the next block and wait for the reply.
    ///
    /// Fails with `Timeout` if no reply arrives within the configured window
    /// and with `Closed` if the peer went away or shutdown was triggered.
    fn pull(&mut self) -> ChannelResult<SampleBlock>;

    /// Attach the cancellation token that unblocks a waiting `pull`.
    fn set_shutdown(&mut self, shutdown: &Shutdown);
}

/// Replier side of a channel: hands one block to each request.
pub trait SampleSink: Send {
    /// Endpoint name used in logs and errors
    fn name(&self) -> &str;

    /// Wait for a request and answer it with `block`.
    ///
    /// On `Timeout` the block was not consumed and may be pushed again.
    fn push(&mut self, block: &SampleBlock) -> ChannelResult<()>;

    /// Attach the cancellation token that unblocks a waiting `push`.
    fn set_shutdown(&mut self, shutdown: &Shutdown);
}

/// Shared cancellation token.
///
/// Clones observe the same trigger. Blocking endpoint calls select on
/// [`Shutdown::receiver`], which disconnects once [`Shutdown::trigger`] runs.
#[derive(Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create an untriggered token.
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            rx,
            trigger: Arc::new(Mutex::new(Some(tx))),
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wake every waiter. Idempotent.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let mut guard = match self.trigger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    /// Check whether the token has fired.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Receiver that disconnects on trigger; never yields a message.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Sleep for `duration` unless triggered first.
    ///
    /// Returns `false` if the sleep was cut short by the trigger.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_triggered() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        matches!(self.rx.recv_timeout(duration), Err(RecvTimeoutError::Timeout))
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Parsed `scheme://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    /// Parse an address string. A `*` host means all interfaces.
    pub fn parse(address: &str) -> MixerResult<Self> {
        let invalid = |reason: &str| MixerError::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://host:port"))?;
        if scheme != "tcp" {
            return Err(invalid("only the tcp scheme is supported"));
        }
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }

    /// Check whether the host is the all-interfaces wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.host == "*"
    }

    /// Resolve to a socket address, mapping `*` to `0.0.0.0`.
    pub fn socket_addr(&self) -> MixerResult<SocketAddr> {
        let host = if self.is_wildcard() { "0.0.0.0" } else { self.host.as_str() };
        (host, self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| MixerError::InvalidAddress {
                address: self.to_string(),
                reason: "host did not resolve".to_string(),
            })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

/// Per-endpoint settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Name used in logs, errors and topology bindings
    pub name: String,
    /// Target address, `scheme://host:port`
    pub address: String,
    /// Bound on one `pull` or `push`
    pub timeout: Duration,
    /// `<= 0` unbounded, `> 0` caps queued requests
    pub high_water_mark: i32,
    /// Payload encoding
    pub format: IqFormat,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            timeout: DEFAULT_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            format: IqFormat::default(),
        }
    }

    /// Config for an in-process pair; the address is informational only.
    pub fn memory(name: impl Into<String>) -> Self {
        let name = name.into();
        let address = format!("inproc://{}", name);
        Self::new(name, address)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_high_water_mark(mut self, high_water_mark: i32) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn with_format(mut self, format: IqFormat) -> Self {
        self.format = format;
        self
    }

    /// Queue capacity implied by the high-water mark, `None` when unbounded.
    pub fn queue_capacity(&self) -> Option<usize> {
        if self.high_water_mark > 0 {
            Some(self.high_water_mark as usize)
        } else {
            None
        }
    }
}

/// Open a requester for `config.address`.
///
/// The connection is dialled on the first `pull`.
pub fn open_source(config: &EndpointConfig) -> MixerResult<Box<dyn SampleSource>> {
    let source = tcp::TcpRequester::new(config.clone())?;
    Ok(Box::new(source))
}

/// Open a replier listening on `config.address`.
///
/// The listening socket is bound before this returns.
pub fn open_sink(config: &EndpointConfig) -> MixerResult<Box<dyn SampleSink>> {
    let sink = tcp::TcpReplier::bind(config.clone())?;
    Ok(Box::new(sink))
}
