//! TCP request/reply endpoints
//!
//! Every message on the wire is a 4-byte little-endian length followed by
//! that many payload bytes. A request is an empty message; a reply carries
//! one block encoded with the endpoint's [`IqFormat`].
//!
//! ```text
//!  +----------------+-------------------------------+
//!  | len (u32 LE)   | payload (len bytes)           |
//!  +----------------+-------------------------------+
//! ```
//!
//! [`TcpRequester`] dials its peer on the first `pull`. [`TcpReplier`] binds
//! its listening socket at construction and accepts one consumer at a time
//! inside `push`. Any I/O failure drops the connection and reports
//! `Closed`; the next call reconnects. Writes are bounded by the endpoint
//! timeout and by shutdown, so a peer that stops reading mid-reply also
//! costs it the connection.
//!
//! [`IqFormat`]: crate::io::IqFormat

use super::{Address, EndpointConfig, SampleSink, SampleSource, Shutdown};
use crate::error::{ChannelError, ChannelResult, MixerError, MixerResult};
use crate::types::SampleBlock;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Read slice used to notice shutdown while waiting on a socket
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accept poll interval for the nonblocking listener
const ACCEPT_INTERVAL: Duration = Duration::from_millis(10);

const READ_CHUNK: usize = 64 * 1024;

/// Write one frame, giving up at `deadline` or on shutdown.
///
/// A write cut short may leave a partial frame on the wire, so every error
/// here means the connection must be dropped.
fn write_frame(
    stream: &mut TcpStream,
    payload: &[u8],
    deadline: Instant,
    shutdown: &Shutdown,
) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|&len| len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    write_before(stream, &len.to_le_bytes(), deadline, shutdown)?;
    write_before(stream, payload, deadline, shutdown)?;
    stream.flush()
}

fn write_before(
    stream: &mut TcpStream,
    mut buf: &[u8],
    deadline: Instant,
    shutdown: &Shutdown,
) -> io::Result<()> {
    while !buf.is_empty() {
        if shutdown.is_triggered() {
            return Err(io::Error::new(io::ErrorKind::Other, "shutdown during write"));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading"));
        }

        stream.set_write_timeout(Some((deadline - now).min(POLL_INTERVAL)))?;
        match stream.write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed connection")),
            Ok(n) => buf = &buf[n..],
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Accumulates bytes until a complete frame is available.
///
/// Partial frames survive a timed-out read so the next call resumes where
/// the previous one stopped.
#[derive(Debug, Default)]
struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    fn clear(&mut self) {
        self.buf.clear();
    }

    fn take_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }

    /// Read until one frame is complete, `deadline` passes or shutdown fires.
    ///
    /// `Ok(None)` means the wait ended without a frame.
    fn read_frame(
        &mut self,
        stream: &mut TcpStream,
        deadline: Instant,
        shutdown: &Shutdown,
    ) -> io::Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(Some(frame));
            }
            if shutdown.is_triggered() {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            stream.set_read_timeout(Some((deadline - now).min(POLL_INTERVAL)))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ))
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Requester that dials a remote replier.
#[derive(Debug)]
pub struct TcpRequester {
    config: EndpointConfig,
    address: Address,
    stream: Option<TcpStream>,
    reader: FrameReader,
    /// A request was written and its reply has not been read yet
    awaiting_reply: bool,
    shutdown: Shutdown,
}

impl TcpRequester {
    /// Create a requester; no connection is attempted yet.
    pub fn new(config: EndpointConfig) -> MixerResult<Self> {
        let address = Address::parse(&config.address)?;
        Ok(Self {
            config,
            address,
            stream: None,
            reader: FrameReader::default(),
            awaiting_reply: false,
            shutdown: Shutdown::new(),
        })
    }

    /// Check if a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&mut self, deadline: Instant) -> ChannelResult<()> {
        let name = self.config.name.as_str();
        let addr = self
            .address
            .socket_addr()
            .map_err(|e| ChannelError::closed(name, e.to_string()))?;
        let window = deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1));

        let stream = TcpStream::connect_timeout(&addr, window)
            .map_err(|e| ChannelError::closed(name, format!("connect to {} failed: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ChannelError::closed(name, e.to_string()))?;

        info!(endpoint = name, %addr, "connected");
        self.stream = Some(stream);
        self.reader.clear();
        self.awaiting_reply = false;
        Ok(())
    }

    fn disconnect(&mut self, reason: &str) -> ChannelError {
        if self.stream.take().is_some() {
            warn!(endpoint = %self.config.name, reason, "connection dropped");
        }
        self.reader.clear();
        self.awaiting_reply = false;
        ChannelError::closed(&self.config.name, reason)
    }
}

impl SampleSource for TcpRequester {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn pull(&mut self) -> ChannelResult<SampleBlock> {
        if self.shutdown.is_triggered() {
            return Err(ChannelError::closed(&self.config.name, "shutdown"));
        }

        let deadline = Instant::now() + self.config.timeout;
        if self.stream.is_none() {
            self.connect(deadline)?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(ChannelError::closed(&self.config.name, "not connected"));
        };

        if !self.awaiting_reply {
            if let Err(e) = write_frame(stream, &[], deadline, &self.shutdown) {
                return Err(self.disconnect(&e.to_string()));
            }
            self.awaiting_reply = true;
        }

        match self.reader.read_frame(stream, deadline, &self.shutdown) {
            Ok(Some(payload)) => {
                self.awaiting_reply = false;
                match self.config.format.decode(&payload) {
                    Ok(block) => Ok(block),
                    Err(e) => Err(self.disconnect(&e.to_string())),
                }
            }
            Ok(None) if self.shutdown.is_triggered() => {
                Err(ChannelError::closed(&self.config.name, "shutdown"))
            }
            Ok(None) => {
                debug!(endpoint = %self.config.name, "pull timed out, request outstanding");
                Err(ChannelError::timeout(&self.config.name, self.config.timeout))
            }
            Err(e) => Err(self.disconnect(&e.to_string())),
        }
    }

    fn set_shutdown(&mut self, shutdown: &Shutdown) {
        self.shutdown = shutdown.clone();
    }
}

/// Replier listening for one requester at a time.
#[derive(Debug)]
pub struct TcpReplier {
    config: EndpointConfig,
    listener: TcpListener,
    conn: Option<TcpStream>,
    reader: FrameReader,
    /// A request was read and has not been answered yet
    request_pending: bool,
    shutdown: Shutdown,
}

impl TcpReplier {
    /// Bind the listening socket.
    pub fn bind(config: EndpointConfig) -> MixerResult<Self> {
        let address = Address::parse(&config.address)?;
        let addr = address.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
            .map_err(|e| MixerError::InvalidAddress {
                address: config.address.clone(),
                reason: format!("bind failed: {}", e),
            })?;

        info!(endpoint = %config.name, %addr, "listening");
        Ok(Self {
            config,
            listener,
            conn: None,
            reader: FrameReader::default(),
            request_pending: false,
            shutdown: Shutdown::new(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Check if a requester is currently connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn accept(&mut self, deadline: Instant) -> ChannelResult<()> {
        let name = self.config.name.as_str();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_nodelay(true))
                        .map_err(|e| ChannelError::closed(name, e.to_string()))?;
                    info!(endpoint = name, %peer, "requester connected");
                    self.conn = Some(stream);
                    self.reader.clear();
                    self.request_pending = false;
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(ChannelError::timeout(name, self.config.timeout));
                    }
                    if !self.shutdown.sleep(remaining.min(ACCEPT_INTERVAL)) {
                        return Err(ChannelError::closed(name, "shutdown"));
                    }
                }
                Err(e) => return Err(ChannelError::closed(name, format!("accept failed: {}", e))),
            }
        }
    }

    fn disconnect(&mut self, reason: &str) -> ChannelError {
        if self.conn.take().is_some() {
            warn!(endpoint = %self.config.name, reason, "connection dropped");
        }
        self.reader.clear();
        self.request_pending = false;
        ChannelError::closed(&self.config.name, reason)
    }
}

impl SampleSink for TcpReplier {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn push(&mut self, block: &SampleBlock) -> ChannelResult<()> {
        if self.shutdown.is_triggered() {
            return Err(ChannelError::closed(&self.config.name, "shutdown"));
        }

        let deadline = Instant::now() + self.config.timeout;
        if self.conn.is_none() {
            self.accept(deadline)?;
        }
        let Some(stream) = self.conn.as_mut() else {
            return Err(ChannelError::closed(&self.config.name, "not connected"));
        };

        if !self.request_pending {
            match self.reader.read_frame(stream, deadline, &self.shutdown) {
                Ok(Some(frame)) if frame.is_empty() => self.request_pending = true,
                Ok(Some(_)) => return Err(self.disconnect("request carried a payload")),
                Ok(None) if self.shutdown.is_triggered() => {
                    return Err(ChannelError::closed(&self.config.name, "shutdown"))
                }
                Ok(None) => {
                    return Err(ChannelError::timeout(&self.config.name, self.config.timeout))
                }
                Err(e) => return Err(self.disconnect(&e.to_string())),
            }
        }

        let Some(stream) = self.conn.as_mut() else {
            return Err(ChannelError::closed(&self.config.name, "not connected"));
        };
        // The reply gets a full window of its own once the request is in
        let payload = self.config.format.encode(block);
        let write_deadline = Instant::now() + self.config.timeout;
        match write_frame(stream, &payload, write_deadline, &self.shutdown) {
            Ok(()) => {
                self.request_pending = false;
                Ok(())
            }
            Err(e) => Err(self.disconnect(&e.to_string())),
        }
    }

    fn set_shutdown(&mut self, shutdown: &Shutdown) {
        self.shutdown = shutdown.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;
    use std::thread;

    fn replier(timeout_ms: u64) -> (TcpReplier, String) {
        let config = EndpointConfig::new("out_a", "tcp://127.0.0.1:0")
            .with_timeout(Duration::from_millis(timeout_ms));
        let replier = TcpReplier::bind(config).unwrap();
        let port = replier.local_addr().unwrap().port();
        (replier, format!("tcp://127.0.0.1:{}", port))
    }

    fn requester(address: &str, timeout_ms: u64) -> TcpRequester {
        let config = EndpointConfig::new("s0", address).with_timeout(Duration::from_millis(timeout_ms));
        TcpRequester::new(config).unwrap()
    }

    #[test]
    fn test_loopback_exchange() {
        let (mut replier, address) = replier(2000);
        let blocks: Vec<SampleBlock> = (0..3)
            .map(|k| (0..16).map(|i| Sample::new(k as f32, i as f32 * 0.25)).collect())
            .collect();
        let sent = blocks.clone();

        let server = thread::spawn(move || {
            for block in &sent {
                replier.push(block).unwrap();
            }
        });

        let mut source = requester(&address, 2000);
        for expected in &blocks {
            assert_eq!(&source.pull().unwrap(), expected);
        }
        server.join().unwrap();
    }

    #[test]
    fn test_pull_times_out_against_silent_listener() {
        // Accepted by the kernel backlog but never answered
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = format!("tcp://{}", listener.local_addr().unwrap());
        let mut source = requester(&address, 80);

        let start = Instant::now();
        let err = source.pull().unwrap_err();
        assert!(err.is_recoverable(), "{}", err);
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert!(source.is_connected());
    }

    #[test]
    fn test_timeout_then_reply_to_same_request() {
        let (mut replier, address) = replier(2000);
        let mut source = requester(&address, 50);

        // No push yet, the request stays outstanding
        assert!(source.pull().unwrap_err().is_recoverable());

        let server = thread::spawn(move || replier.push(&vec![Sample::new(3.0, 0.0); 2]));
        let block = loop {
            match source.pull() {
                Ok(block) => break block,
                Err(e) => assert!(e.is_recoverable(), "{}", e),
            }
        };
        server.join().unwrap().unwrap();
        assert_eq!(block, vec![Sample::new(3.0, 0.0); 2]);
    }

    #[test]
    fn test_connect_refused_is_closed() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut source = requester(&format!("tcp://127.0.0.1:{}", port), 200);
        let err = source.pull().unwrap_err();
        assert!(matches!(err, ChannelError::Closed { .. }));
    }

    #[test]
    fn test_push_times_out_without_requester() {
        let (mut replier, _address) = replier(40);
        let err = replier.push(&vec![Sample::new(1.0, 1.0)]).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!replier.is_connected());
    }

    #[test]
    fn test_oversized_frame_closes() {
        let (mut replier, address) = replier(2000);
        let addr = Address::parse(&address).unwrap().socket_addr().unwrap();
        let client = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&u32::MAX.to_le_bytes()).unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let err = replier.push(&vec![Sample::new(1.0, 1.0)]).unwrap_err();
        assert!(matches!(err, ChannelError::Closed { .. }));
        assert!(!replier.is_connected());
        client.join().unwrap();
    }

    /// Connects, sends one request and never reads the reply.
    fn stalled_requester(address: &str, hold: Duration) -> thread::JoinHandle<()> {
        let addr = Address::parse(address).unwrap().socket_addr().unwrap();
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(&0u32.to_le_bytes()).unwrap();
            thread::sleep(hold);
        })
    }

    fn large_block() -> SampleBlock {
        // 32 MB as cf32, well beyond any loopback socket buffer
        vec![Sample::new(0.5, -0.5); 4_000_000]
    }

    #[test]
    fn test_shutdown_cancels_blocked_reply() {
        let (mut replier, address) = replier(10_000);
        let shutdown = Shutdown::new();
        replier.set_shutdown(&shutdown);
        let client = stalled_requester(&address, Duration::from_secs(4));

        let trigger = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(300));
                shutdown.trigger();
                Instant::now()
            })
        };

        let err = replier.push(&large_block()).unwrap_err();
        let returned = Instant::now();
        let triggered = trigger.join().unwrap();

        assert!(matches!(err, ChannelError::Closed { .. }), "{}", err);
        assert!(returned.duration_since(triggered) < Duration::from_secs(1));
        assert!(!replier.is_connected());
        client.join().unwrap();
    }

    #[test]
    fn test_reply_to_non_reading_peer_respects_timeout() {
        let (mut replier, address) = replier(200);
        let client = stalled_requester(&address, Duration::from_secs(3));

        let start = Instant::now();
        let err = loop {
            // The first calls may time out before the request arrives
            match replier.push(&large_block()) {
                Err(e) if e.is_recoverable() => continue,
                Err(e) => break e,
                Ok(()) => panic!("reply cannot complete while the peer is not reading"),
            }
        };

        // A partially written reply cannot be retried on the same connection
        assert!(matches!(err, ChannelError::Closed { .. }), "{}", err);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!replier.is_connected());
        client.join().unwrap();
    }

    #[test]
    fn test_frame_reader_keeps_partial_frames() {
        let mut reader = FrameReader::default();
        reader.buf.extend_from_slice(&3u32.to_le_bytes());
        reader.buf.extend_from_slice(&[1, 2]);
        assert!(reader.take_frame().unwrap().is_none());

        reader.buf.extend_from_slice(&[3, 0, 0, 0, 0]);
        assert_eq!(reader.take_frame().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(reader.take_frame().unwrap(), Some(vec![]));
        assert!(reader.buf.is_empty());
    }
}
