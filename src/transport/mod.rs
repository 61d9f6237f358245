//! Transport layer for P2P messaging.
//!
//! Every way of reaching a peer implements [`Transport`]: short-range radio,
//! peer data channels, direct sockets and relay servers. Transports report
//! discoveries and inbound connections on a shared event channel, and the
//! [`TransportManager`] picks among them per peer.

pub mod connection;
pub mod data_channel;
pub mod framing;
pub mod manager;
pub mod radio;
pub mod relay;
pub mod socket;

pub use connection::{
    BoxedIo, ByteStream, Connection, ConnectionState, FrameReader, FrameWriter, Stream,
    CONTROL_STREAM, PAYLOAD_STREAM,
};
pub use manager::{ManagerEvent, ManagerStats, TransportManager};

use crate::identity::{Address, PeerId, PeerRecord, TransportKind};
use crate::utils::{NetworkError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A peer seen by a transport's discovery
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Identity announced by the peer
    pub peer: PeerId,
    /// Addresses it can be reached at
    pub addresses: Vec<Address>,
    /// Signal strength or link quality if the transport measures one
    pub quality: Option<i16>,
    /// Observation time
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredPeer {
    /// Observation made now
    pub fn now(peer: PeerId, address: Address, quality: Option<i16>) -> Self {
        Self {
            peer,
            addresses: vec![address],
            quality,
            last_seen: Utc::now(),
        }
    }
}

impl From<DiscoveredPeer> for PeerRecord {
    fn from(value: DiscoveredPeer) -> Self {
        PeerRecord {
            peer: value.peer,
            addresses: value.addresses,
            quality: value.quality,
            last_seen: value.last_seen,
        }
    }
}

/// Something a transport observed
#[derive(Debug)]
pub enum TransportEvent {
    /// Discovery saw a peer
    PeerDiscovered(DiscoveredPeer),
    /// A remote peer connected to us; the connection is already open
    IncomingConnection(Connection),
}

/// Capability set shared by every transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is
    fn kind(&self) -> TransportKind;

    /// Attach the shared event channel. Must precede `start`.
    async fn init(&self, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    /// Begin listening, advertising and background discovery
    async fn start(&self) -> Result<()>;

    /// Stop background work and release listeners. Open connections stay open.
    async fn stop(&self) -> Result<()>;

    /// Open a connection to an address of this transport's kind
    ///
    /// # Errors
    ///
    /// * `NetworkError::UnsupportedAddress` - the address belongs to another transport
    /// * `NetworkError::ConnectionFailed` - the remote could not be reached
    async fn dial(&self, address: &Address) -> Result<Connection>;

    /// Addresses we currently advertise
    fn listen_addresses(&self) -> Vec<Address>;

    /// Run one discovery round and return what it saw
    async fn discover(&self) -> Result<Vec<DiscoveredPeer>>;
}

/// Reject addresses that belong to a different transport
pub(crate) fn ensure_kind(kind: TransportKind, address: &Address) -> Result<()> {
    if address.kind() != kind {
        return Err(NetworkError::UnsupportedAddress {
            transport: kind.to_string(),
            address: address.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Lifecycle bookkeeping shared by the transport implementations
pub(crate) struct TransportRuntime {
    kind: TransportKind,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TransportRuntime {
    pub(crate) fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            events: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn attach(&self, events: mpsc::Sender<TransportEvent>) {
        *self.events.lock() = Some(events);
    }

    /// Event sender, for tasks that outlive the call that spawned them
    pub(crate) fn sender(&self) -> Result<mpsc::Sender<TransportEvent>> {
        self.events.lock().clone().ok_or_else(|| self.not_started())
    }

    /// Flip to started. Returns false if already running.
    pub(crate) fn begin(&self) -> Result<bool> {
        if self.events.lock().is_none() {
            return Err(self.not_started());
        }
        Ok(!self.started.swap(true, Ordering::SeqCst))
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn require_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(self.not_started())
        }
    }

    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }

    /// Abort background tasks and flip to stopped
    pub(crate) fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn not_started(&self) -> crate::utils::MessengerError {
        NetworkError::NotStarted {
            transport: self.kind.to_string(),
        }
        .into()
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Forward an event, logging instead of failing when nobody listens
pub(crate) async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
    if events.send(event).await.is_err() {
        log::debug!("transport event dropped: receiver closed");
    }
}
