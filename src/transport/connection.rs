//! Connections and the named streams they carry.
//!
//! A [`Connection`] is a handle shared between the transport that produced it
//! and whoever consumes it. Its lifecycle is published on a watch channel so
//! any holder can observe transitions; streams are handed out once by name.

use crate::identity::{Address, TransportKind};
use crate::transport::framing;
use crate::utils::{NetworkError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use uuid::Uuid;

/// Name of the stream that carries application frames
pub const PAYLOAD_STREAM: &str = "payload";

/// Name of the stream reserved for transport control traffic
pub const CONTROL_STREAM: &str = "control";

/// Any ordered, reliable byte stream a transport can produce
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed byte stream
pub type BoxedIo = Box<dyn ByteStream>;

/// Connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing or accepting
    Connecting,
    /// Waiting for both users to confirm a short code
    Pairing {
        /// Code displayed on both devices
        code: String,
    },
    /// Streams usable
    Open,
    /// Shutting down
    Closing,
    /// Terminal, closed cleanly
    Closed,
    /// Terminal, closed by an error
    Failed {
        /// What went wrong
        reason: String,
    },
}

impl ConnectionState {
    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed { .. })
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Connecting, Pairing { .. }) | (Connecting, Open) | (Pairing { .. }, Open) => true,
            (Connecting | Pairing { .. } | Open, Closing) => true,
            (Closing, Closed) => true,
            (current, Failed { .. }) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Pairing { code } => write!(f, "pairing ({code})"),
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Reading half of a framed stream
pub struct FrameReader {
    name: String,
    inner: Box<dyn AsyncRead + Send + Unpin>,
    max_frame: usize,
}

impl FrameReader {
    /// Next frame, or `None` once the remote half-closed
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        framing::read_frame(&mut self.inner, self.max_frame).await
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Writing half of a framed stream
pub struct FrameWriter {
    name: String,
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    max_frame: usize,
}

impl FrameWriter {
    /// Write one frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        framing::write_frame(&mut self.inner, frame, self.max_frame).await
    }

    /// Half-close: the remote reader sees end of stream, our reader keeps working
    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered, bidirectional, framed stream with explicit half-close
pub struct Stream {
    reader: FrameReader,
    writer: FrameWriter,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.reader.name)
            .field("max_frame", &self.reader.max_frame)
            .finish()
    }
}

impl Stream {
    /// Wrap a byte stream
    pub fn new(name: impl Into<String>, io: BoxedIo, max_frame: usize) -> Self {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: FrameReader {
                name: name.clone(),
                inner: Box::new(read_half),
                max_frame,
            },
            writer: FrameWriter {
                name,
                inner: Box::new(write_half),
                max_frame,
            },
        }
    }

    /// Stream name
    pub fn name(&self) -> &str {
        &self.reader.name
    }

    /// Write one frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.send(frame).await
    }

    /// Read one frame
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.recv().await
    }

    /// Half-close the write side
    pub async fn close_write(&mut self) -> Result<()> {
        self.writer.close().await
    }

    /// Separate the halves so they can be driven by different tasks
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

struct ConnectionInner {
    id: Uuid,
    kind: TransportKind,
    remote: Address,
    state: watch::Sender<ConnectionState>,
    streams: Mutex<HashMap<String, Stream>>,
}

/// Shared handle to one transport connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("remote", &self.inner.remote.to_string())
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl Connection {
    /// New connection in `Connecting`
    pub fn new(kind: TransportKind, remote: Address) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                kind,
                remote,
                state,
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Unique connection id
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Transport that produced the connection
    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// Remote address as dialed or observed
    pub fn remote(&self) -> &Address {
        &self.inner.remote
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether streams are usable
    pub fn is_open(&self) -> bool {
        matches!(*self.inner.state.borrow(), ConnectionState::Open)
    }

    /// Move to `next` if the lifecycle allows it
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Transport` for an illegal transition
    pub fn transition(&self, next: ConnectionState) -> Result<()> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                log::trace!("connection {} {} -> {}", self.inner.id, current, next);
                *current = next.clone();
                true
            } else {
                result = Err(NetworkError::Transport {
                    reason: format!("illegal connection transition {current} -> {next}"),
                }
                .into());
                false
            }
        });
        result
    }

    /// Attach a named stream
    pub fn add_stream(&self, stream: Stream) {
        self.inner
            .streams
            .lock()
            .insert(stream.name().to_string(), stream);
    }

    /// Take ownership of a named stream. Each stream is handed out once.
    pub fn take_stream(&self, name: &str) -> Option<Stream> {
        self.inner.streams.lock().remove(name)
    }

    /// Names of streams not yet taken
    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.streams.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Mark failed and drop untaken streams
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.transition(ConnectionState::Failed {
            reason: reason.into(),
        });
        self.inner.streams.lock().clear();
    }

    /// Close: half-close every untaken stream, then move to `Closed`.
    /// Closing an already terminal connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        self.transition(ConnectionState::Closing)?;
        let streams: Vec<Stream> = self.inner.streams.lock().drain().map(|(_, s)| s).collect();
        for mut stream in streams {
            if let Err(e) = stream.close_write().await {
                log::debug!("half-close of {} failed: {}", stream.name(), e);
            }
        }
        self.transition(ConnectionState::Closed)
    }

    /// Wait until the connection reaches a terminal state
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        while !rx.borrow_and_update().is_terminal() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::address::parse_address;

    fn connection() -> Connection {
        Connection::new(TransportKind::Socket, parse_address("tcp/127.0.0.1/4001").unwrap())
    }

    #[test]
    fn test_lifecycle_transitions() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.transition(ConnectionState::Pairing {
            code: "123456".to_string(),
        })
        .unwrap();
        conn.transition(ConnectionState::Open).unwrap();
        assert!(conn.is_open());

        assert!(conn.transition(ConnectionState::Connecting).is_err());
        assert!(conn.transition(ConnectionState::Closed).is_err());

        conn.transition(ConnectionState::Closing).unwrap();
        conn.transition(ConnectionState::Closed).unwrap();
        assert!(conn
            .transition(ConnectionState::Failed {
                reason: "late".to_string()
            })
            .is_err());
    }

    #[test]
    fn test_watch_observes_transitions() {
        let conn = connection();
        let mut rx = conn.subscribe();
        conn.transition(ConnectionState::Open).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_named_streams_and_half_close() {
        let (a, b) = tokio::io::duplex(1024);
        let conn = connection();
        conn.add_stream(Stream::new(PAYLOAD_STREAM, Box::new(a), 1024));
        conn.transition(ConnectionState::Open).unwrap();
        assert_eq!(conn.stream_names(), vec![PAYLOAD_STREAM.to_string()]);

        let mut local = conn.take_stream(PAYLOAD_STREAM).unwrap();
        assert!(conn.take_stream(PAYLOAD_STREAM).is_none());
        let mut remote = Stream::new(PAYLOAD_STREAM, Box::new(b), 1024);

        local.send(b"ping").await.unwrap();
        local.close_write().await.unwrap();
        assert_eq!(remote.recv().await.unwrap().unwrap(), b"ping");
        assert!(remote.recv().await.unwrap().is_none());

        // The other direction still works after the half-close
        remote.send(b"pong").await.unwrap();
        assert_eq!(local.recv().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let conn = connection();
        conn.transition(ConnectionState::Open).unwrap();
        conn.close().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.close().await.unwrap();
        conn.closed().await;
    }
}
