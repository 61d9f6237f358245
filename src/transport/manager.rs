//! Transport selection, connection caching and per-peer send queues.
//!
//! The manager owns every registered [`Transport`]. To reach a peer it tries
//! the peer's known addresses in transport priority order, retrying transient
//! failures with backoff, and keeps the first connection that opens. Each
//! cached connection has exactly one writer task fed by a bounded queue, so
//! frames to one peer leave in the order they were submitted.
//!
//! Both ends open a link by exchanging a hello frame carrying their
//! [`PeerId`]; after that, frames carry `(protocol_id, payload)` pairs.

use crate::identity::{Address, PeerId, PeerStore, TransportKind};
use crate::transport::{
    Connection, DiscoveredPeer, FrameReader, FrameWriter, Transport, TransportEvent,
    PAYLOAD_STREAM,
};
use crate::utils::{BoundedCache, NetworkConfig, NetworkError, ProtocolError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const EVENT_QUEUE: usize = 256;

/// What the manager reports to the layer above
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// A transport discovered a peer; the peer table is already updated
    PeerDiscovered(DiscoveredPeer),
    /// A link to the peer opened
    PeerConnected {
        /// Remote identity from its hello
        peer: PeerId,
        /// Transport carrying the link
        kind: TransportKind,
    },
    /// The cached link to the peer closed
    PeerDisconnected {
        /// Remote identity
        peer: PeerId,
    },
    /// A frame arrived
    MessageReceived {
        /// Sender
        peer: PeerId,
        /// Protocol the payload belongs to
        protocol_id: String,
        /// Frame payload
        payload: Vec<u8>,
    },
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Dial attempts across all transports
    pub dial_attempts: u64,
    /// Links established, inbound and outbound
    pub links_opened: u64,
    /// Links currently cached
    pub active_links: usize,
    /// Frames queued for sending
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
}

#[derive(Debug, Serialize, Deserialize)]
enum LinkFrame {
    Hello {
        peer: PeerId,
    },
    Message {
        protocol_id: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

enum LinkEvent {
    Frame {
        peer: PeerId,
        protocol_id: String,
        payload: Vec<u8>,
    },
    Closed {
        peer: PeerId,
        link: Uuid,
    },
}

struct PeerLink {
    kind: TransportKind,
    connection: Connection,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl PeerLink {
    fn is_usable(&self) -> bool {
        !self.outbound.is_closed() && !self.connection.state().is_terminal()
    }

    /// Drop the queue so the writer half-closes, then mark the connection closed
    fn close(self) {
        let PeerLink {
            connection,
            outbound,
            ..
        } = self;
        drop(outbound);
        tokio::spawn(async move {
            if let Err(e) = connection.close().await {
                log::debug!("Closing link {} failed: {}", connection.id(), e);
            }
        });
    }
}

struct Inner {
    local: PeerId,
    config: NetworkConfig,
    peers: Arc<PeerStore>,
    transports: RwLock<Vec<Arc<dyn Transport>>>,
    links: Mutex<BoundedCache<PeerId, PeerLink>>,
    dial_slots: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<()>>>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    link_tx: mpsc::Sender<LinkEvent>,
    link_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    events: mpsc::Sender<ManagerEvent>,
    stats: Mutex<ManagerStats>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// One dial per peer at a time. The map entry goes away with its last
/// holder, also when the dialing future is dropped.
struct DialSlot<'a> {
    inner: &'a Inner,
    peer: &'a PeerId,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> DialSlot<'a> {
    fn acquire(inner: &'a Inner, peer: &'a PeerId) -> Self {
        let lock = inner.dial_slots.lock().entry(peer.clone()).or_default().clone();
        Self { inner, peer, lock }
    }
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        let mut slots = self.inner.dial_slots.lock();
        let last = slots
            .get(self.peer)
            .is_some_and(|s| Arc::ptr_eq(s, &self.lock) && Arc::strong_count(s) <= 2);
        if last {
            slots.remove(self.peer);
        }
    }
}

/// Chooses transports per peer and owns the live links
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<Inner>,
}

fn encode(frame: &LinkFrame) -> Result<Vec<u8>> {
    Ok(bincode::serialize(frame)?)
}

async fn read_hello(reader: &mut FrameReader, timeout: Duration) -> Result<PeerId> {
    let frame = tokio::time::timeout(timeout, reader.recv())
        .await
        .map_err(|_| NetworkError::Timeout {
            operation: "link hello".to_string(),
        })??;
    let bytes = frame.ok_or_else(|| NetworkError::ConnectionClosed {
        peer: "closed before hello".to_string(),
    })?;
    match bincode::deserialize::<LinkFrame>(&bytes)? {
        LinkFrame::Hello { peer } => Ok(peer),
        LinkFrame::Message { .. } => Err(ProtocolError::InvalidMessage {
            reason: "expected hello as first frame".to_string(),
        }
        .into()),
    }
}

impl TransportManager {
    /// Create a manager and the receiver for its events
    ///
    /// # Arguments
    ///
    /// * `local` - Our identity, sent in every hello
    /// * `config` - Dial timeouts, retry policy and queue sizes
    /// * `peers` - Peer table shared with the rest of the core
    pub fn new(
        local: PeerId,
        config: NetworkConfig,
        peers: Arc<PeerStore>,
    ) -> (Self, mpsc::Receiver<ManagerEvent>) {
        let (transport_tx, transport_rx) = mpsc::channel(EVENT_QUEUE);
        let (link_tx, link_rx) = mpsc::channel(EVENT_QUEUE);
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let links = BoundedCache::new(config.max_connections);

        let manager = Self {
            inner: Arc::new(Inner {
                local,
                config,
                peers,
                transports: RwLock::new(Vec::new()),
                links: Mutex::new(links),
                dial_slots: Mutex::new(HashMap::new()),
                transport_tx,
                transport_rx: Mutex::new(Some(transport_rx)),
                link_tx,
                link_rx: Mutex::new(Some(link_rx)),
                events,
                stats: Mutex::new(ManagerStats::default()),
                dispatcher: Mutex::new(None),
            }),
        };
        (manager, events_rx)
    }

    /// Our identity
    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local
    }

    /// Shared peer table
    pub fn peers(&self) -> &Arc<PeerStore> {
        &self.inner.peers
    }

    /// Register and initialize a transport. One transport per kind.
    pub async fn register(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let kind = transport.kind();
        if self.inner.transports.read().iter().any(|t| t.kind() == kind) {
            return Err(NetworkError::Transport {
                reason: format!("{kind} transport already registered"),
            }
            .into());
        }
        transport.init(self.inner.transport_tx.clone()).await?;
        let mut transports = self.inner.transports.write();
        transports.push(transport);
        transports.sort_by_key(|t| t.kind());
        log::debug!("Registered {kind} transport");
        Ok(())
    }

    /// Registered transport kinds in dial priority order
    pub fn transport_kinds(&self) -> Vec<TransportKind> {
        self.inner.transports.read().iter().map(|t| t.kind()).collect()
    }

    fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.inner.transports.read().clone()
    }

    /// Start the event loop and every transport.
    ///
    /// A transport that fails to start is logged and skipped; the call only
    /// fails when every registered transport failed.
    pub async fn start(&self) -> Result<()> {
        let transport_rx = self.inner.transport_rx.lock().take();
        let link_rx = self.inner.link_rx.lock().take();
        if let (Some(transport_rx), Some(link_rx)) = (transport_rx, link_rx) {
            let handle = tokio::spawn(self.clone().dispatch(transport_rx, link_rx));
            *self.inner.dispatcher.lock() = Some(handle);
        }

        let transports = self.transports();
        let mut first_error = None;
        let mut started = 0usize;
        for transport in &transports {
            match transport.start().await {
                Ok(()) => started += 1,
                Err(e) => {
                    log::warn!("{} transport failed to start: {}", transport.kind(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if started == 0 => Err(e),
            _ => {
                log::info!("Transport manager started with {started} transport(s)");
                Ok(())
            }
        }
    }

    /// Stop transports, the event loop and every link
    pub async fn stop(&self) {
        for transport in self.transports() {
            if let Err(e) = transport.stop().await {
                log::warn!("{} transport failed to stop: {}", transport.kind(), e);
            }
        }
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            handle.abort();
        }
        let links: Vec<PeerLink> = {
            let mut cache = self.inner.links.lock();
            let peers: Vec<PeerId> = cache.iter().map(|(peer, _)| peer.clone()).collect();
            peers.iter().filter_map(|peer| cache.remove(peer)).collect()
        };
        for link in links {
            link.close();
        }
    }

    /// Addresses advertised by all transports
    pub fn local_addresses(&self) -> Vec<Address> {
        self.transports()
            .iter()
            .flat_map(|t| t.listen_addresses())
            .collect()
    }

    /// Teach the peer table an address learned out of band
    pub fn add_address(&self, peer: &PeerId, address: Address) {
        self.inner.peers.observe(peer, address, None);
    }

    /// Run one discovery round on every transport
    pub async fn discover(&self) -> Vec<DiscoveredPeer> {
        let mut found = Vec::new();
        for transport in self.transports() {
            match transport.discover().await {
                Ok(peers) => {
                    for peer in &peers {
                        self.inner.peers.upsert(peer.clone().into());
                    }
                    found.extend(peers);
                }
                Err(e) => log::debug!("{} discovery failed: {}", transport.kind(), e),
            }
        }
        found
    }

    /// Peers with a live link
    pub fn connected_peers(&self) -> Vec<(PeerId, TransportKind)> {
        self.inner
            .links
            .lock()
            .iter()
            .filter(|(_, link)| link.is_usable())
            .map(|(peer, link)| (peer.clone(), link.kind))
            .collect()
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> ManagerStats {
        let mut stats = *self.inner.stats.lock();
        stats.active_links = self.inner.links.lock().len();
        stats
    }

    fn live_link(&self, peer: &PeerId) -> Option<TransportKind> {
        let mut links = self.inner.links.lock();
        match links.get(peer).map(|link| (link.is_usable(), link.kind)) {
            Some((true, kind)) => Some(kind),
            Some((false, _)) => {
                if let Some(stale) = links.remove(peer) {
                    stale.close();
                }
                None
            }
            None => None,
        }
    }

    /// Make sure a link to `peer` exists, dialing if needed.
    ///
    /// Concurrent callers for the same peer share one dial.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Unreachable` when every transport and address
    /// failed
    pub async fn connect(&self, peer: &PeerId) -> Result<TransportKind> {
        if let Some(kind) = self.live_link(peer) {
            return Ok(kind);
        }

        let slot = DialSlot::acquire(&self.inner, peer);
        let _guard = slot.lock.lock().await;
        match self.live_link(peer) {
            Some(kind) => Ok(kind),
            None => self.dial_peer(peer).await,
        }
    }

    async fn dial_peer(&self, peer: &PeerId) -> Result<TransportKind> {
        let unreachable = || NetworkError::Unreachable {
            peer: peer.to_string(),
        };
        let record = self.inner.peers.get(peer).ok_or_else(unreachable)?;
        let config = &self.inner.config;

        for transport in self.transports() {
            let kind = transport.kind();
            let addresses: Vec<Address> = record.addresses_for(kind).cloned().collect();
            for address in addresses {
                for attempt in 1..=config.dial_attempts {
                    self.inner.stats.lock().dial_attempts += 1;
                    log::debug!("Dialing {peer} at {address} (attempt {attempt})");

                    let error = match tokio::time::timeout(config.dial_timeout(), transport.dial(&address)).await {
                        Ok(Ok(connection)) => match self.establish(connection, Some(peer)).await {
                            Ok(kind) => {
                                log::info!("Connected to {} via {}", peer.short(), kind);
                                return Ok(kind);
                            }
                            Err(e) => e,
                        },
                        Ok(Err(e)) => e,
                        Err(_) => NetworkError::Timeout {
                            operation: format!("dial {address}"),
                        }
                        .into(),
                    };

                    log::debug!("Dial {address} failed: {error}");
                    if !error.is_recoverable() || attempt == config.dial_attempts {
                        break;
                    }
                    tokio::time::sleep(config.backoff(attempt)).await;
                }
            }
        }

        log::warn!("Every transport failed for {}", peer.short());
        Err(unreachable().into())
    }

    /// Exchange hellos and install the link. `expected` is set when we dialed.
    async fn establish(&self, connection: Connection, expected: Option<&PeerId>) -> Result<TransportKind> {
        match self.handshake(&connection, expected).await {
            Ok((peer, reader, writer)) => Ok(self.install(peer, connection, reader, writer).await),
            Err(e) => {
                connection.fail(e.to_string());
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        connection: &Connection,
        expected: Option<&PeerId>,
    ) -> Result<(PeerId, FrameReader, FrameWriter)> {
        let stream = connection
            .take_stream(PAYLOAD_STREAM)
            .ok_or_else(|| NetworkError::Transport {
                reason: "connection has no payload stream".to_string(),
            })?;
        let (mut reader, mut writer) = stream.into_split();
        let hello = encode(&LinkFrame::Hello {
            peer: self.inner.local.clone(),
        })?;
        let timeout = self.inner.config.dial_timeout();

        let remote = match expected {
            Some(expected) => {
                writer.send(&hello).await?;
                let remote = read_hello(&mut reader, timeout).await?;
                if &remote != expected {
                    return Err(NetworkError::ConnectionFailed {
                        peer: expected.to_string(),
                        reason: format!("address answered as {remote}"),
                    }
                    .into());
                }
                remote
            }
            None => {
                let remote = read_hello(&mut reader, timeout).await?;
                writer.send(&hello).await?;
                remote
            }
        };
        Ok((remote, reader, writer))
    }

    async fn install(
        &self,
        peer: PeerId,
        connection: Connection,
        mut reader: FrameReader,
        mut writer: FrameWriter,
    ) -> TransportKind {
        let kind = connection.kind();
        let link_id = connection.id();
        let (outbound, mut queue) = mpsc::channel::<Vec<u8>>(self.inner.config.send_queue_depth);

        tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = writer.send(&frame).await {
                    log::debug!("Link write failed: {e}");
                    return;
                }
            }
            let _ = writer.close().await;
        });

        let link_tx = self.inner.link_tx.clone();
        let reader_peer = peer.clone();
        let reader_connection = connection.clone();
        tokio::spawn(async move {
            loop {
                let bytes = match reader.recv().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("Link read from {} failed: {}", reader_peer.short(), e);
                        break;
                    }
                };
                match bincode::deserialize::<LinkFrame>(&bytes) {
                    Ok(LinkFrame::Message {
                        protocol_id,
                        payload,
                    }) => {
                        let event = LinkEvent::Frame {
                            peer: reader_peer.clone(),
                            protocol_id,
                            payload,
                        };
                        if link_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(LinkFrame::Hello { .. }) => {
                        log::debug!("Duplicate hello from {}", reader_peer.short())
                    }
                    Err(e) => {
                        log::warn!("Malformed frame from {}: {}", reader_peer.short(), e);
                        break;
                    }
                }
            }
            let _ = reader_connection.close().await;
            let _ = link_tx
                .send(LinkEvent::Closed {
                    peer: reader_peer,
                    link: link_id,
                })
                .await;
        });

        let (replaced, evicted) = {
            let mut links = self.inner.links.lock();
            let replaced = links.remove(&peer);
            let evicted = links.insert(
                peer.clone(),
                PeerLink {
                    kind,
                    connection,
                    outbound,
                },
            );
            (replaced, evicted)
        };
        if let Some(old) = replaced {
            old.close();
        }
        if let Some((evicted_peer, link)) = evicted {
            log::debug!("Connection cache full, closing link to {}", evicted_peer.short());
            link.close();
            self.emit(ManagerEvent::PeerDisconnected { peer: evicted_peer })
                .await;
        }

        self.inner.stats.lock().links_opened += 1;
        self.emit(ManagerEvent::PeerConnected { peer, kind }).await;
        kind
    }

    /// Queue a frame for `peer`, connecting first if needed.
    ///
    /// # Errors
    ///
    /// * `ProtocolError::MessageTooLarge` - payload exceeds the frame limit
    /// * `NetworkError::Unreachable` - no transport could reach the peer
    pub async fn send(&self, peer: &PeerId, protocol_id: &str, payload: Vec<u8>) -> Result<()> {
        let frame = encode(&LinkFrame::Message {
            protocol_id: protocol_id.to_string(),
            payload,
        })?;
        if frame.len() > self.inner.config.max_frame_size {
            return Err(ProtocolError::MessageTooLarge {
                size: frame.len(),
                max: self.inner.config.max_frame_size,
            }
            .into());
        }

        // A link can die between connect and enqueue; redial once
        for _ in 0..2 {
            self.connect(peer).await?;
            let queue = self
                .inner
                .links
                .lock()
                .get(peer)
                .map(|link| link.outbound.clone());
            if let Some(queue) = queue {
                if queue.send(frame.clone()).await.is_ok() {
                    self.inner.stats.lock().frames_sent += 1;
                    return Ok(());
                }
            }
            if let Some(dead) = self.inner.links.lock().remove(peer) {
                dead.close();
            }
        }
        Err(NetworkError::ConnectionClosed {
            peer: peer.to_string(),
        }
        .into())
    }

    /// Close the link to `peer` if there is one
    pub async fn disconnect(&self, peer: &PeerId) {
        let link = self.inner.links.lock().remove(peer);
        if let Some(link) = link {
            link.close();
            self.emit(ManagerEvent::PeerDisconnected { peer: peer.clone() })
                .await;
        }
    }

    async fn emit(&self, event: ManagerEvent) {
        if self.inner.events.send(event).await.is_err() {
            log::debug!("Manager event dropped: receiver closed");
        }
    }

    async fn dispatch(
        self,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
        mut link_rx: mpsc::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => self.on_transport_event(event).await,
                Some(event) = link_rx.recv() => self.on_link_event(event).await,
                else => break,
            }
        }
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered(found) => {
                if found.peer == self.inner.local {
                    return;
                }
                self.inner.peers.upsert(found.clone().into());
                self.emit(ManagerEvent::PeerDiscovered(found)).await;
            }
            TransportEvent::IncomingConnection(connection) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    let remote = connection.remote().clone();
                    let kind = connection.kind();
                    match manager.handshake(&connection, None).await {
                        Ok((peer, reader, writer)) => {
                            // Inbound socket ports are ephemeral and not worth remembering
                            if kind != TransportKind::Socket {
                                manager.inner.peers.observe(&peer, remote, None);
                            }
                            log::info!("Accepted {} via {}", peer.short(), kind);
                            manager.install(peer, connection, reader, writer).await;
                        }
                        Err(e) => {
                            log::warn!("Inbound {kind} link from {remote} failed: {e}");
                            connection.fail(e.to_string());
                        }
                    }
                });
            }
        }
    }

    async fn on_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Frame {
                peer,
                protocol_id,
                payload,
            } => {
                self.inner.stats.lock().frames_received += 1;
                self.emit(ManagerEvent::MessageReceived {
                    peer,
                    protocol_id,
                    payload,
                })
                .await;
            }
            LinkEvent::Closed { peer, link } => {
                let removed = {
                    let mut links = self.inner.links.lock();
                    if links.peek(&peer).map(|l| l.connection.id()) == Some(link) {
                        links.remove(&peer)
                    } else {
                        None
                    }
                };
                if let Some(removed) = removed {
                    removed.close();
                    log::info!("Link to {} closed", peer.short());
                    self.emit(ManagerEvent::PeerDisconnected { peer }).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChainType;
    use crate::transport::socket::SocketTransport;
    use crate::utils::{ErrorKind, SocketConfig};

    fn network() -> NetworkConfig {
        NetworkConfig {
            transports: Vec::new(),
            dial_timeout_ms: 2_000,
            dial_attempts: 2,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            ..NetworkConfig::default()
        }
    }

    async fn node(name: &str) -> (TransportManager, mpsc::Receiver<ManagerEvent>) {
        let peer = PeerId::new(format!("0x{name}"), ChainType::Ethereum, name);
        let (manager, events) = TransportManager::new(peer.clone(), network(), Arc::new(PeerStore::new()));
        let socket = SocketTransport::new(
            SocketConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                enable_multicast: false,
                ..SocketConfig::default()
            },
            peer,
            64 * 1024,
        );
        manager.register(Arc::new(socket)).await.unwrap();
        manager.start().await.unwrap();
        (manager, events)
    }

    async fn next_message(events: &mut mpsc::Receiver<ManagerEvent>) -> (PeerId, String, Vec<u8>) {
        loop {
            match events.recv().await.unwrap() {
                ManagerEvent::MessageReceived {
                    peer,
                    protocol_id,
                    payload,
                } => return (peer, protocol_id, payload),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_send_in_order_over_one_link() {
        let (alice, _alice_events) = node("a11ce").await;
        let (bob, mut bob_events) = node("b0b").await;
        alice.add_address(bob.local_peer(), bob.local_addresses().remove(0));

        for i in 0..20u8 {
            alice
                .send(bob.local_peer(), "chat/1", vec![i])
                .await
                .unwrap();
        }
        for i in 0..20u8 {
            let (from, protocol, payload) = next_message(&mut bob_events).await;
            assert_eq!(&from, alice.local_peer());
            assert_eq!(protocol, "chat/1");
            assert_eq!(payload, vec![i]);
        }
        assert_eq!(alice.stats().dial_attempts, 1);
        assert_eq!(alice.stats().frames_sent, 20);
    }

    #[tokio::test]
    async fn test_reply_reuses_inbound_link() {
        let (alice, mut alice_events) = node("a11ce").await;
        let (bob, mut bob_events) = node("b0b").await;
        alice.add_address(bob.local_peer(), bob.local_addresses().remove(0));

        alice.send(bob.local_peer(), "p", b"ping".to_vec()).await.unwrap();
        next_message(&mut bob_events).await;

        bob.send(alice.local_peer(), "p", b"pong".to_vec()).await.unwrap();
        let (_, _, payload) = next_message(&mut alice_events).await;
        assert_eq!(payload, b"pong");
        assert_eq!(bob.stats().dial_attempts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_share_one_dial() {
        let (alice, _alice_events) = node("a11ce").await;
        let (bob, _bob_events) = node("b0b").await;
        alice.add_address(bob.local_peer(), bob.local_addresses().remove(0));

        let peer = bob.local_peer().clone();
        let (a, b) = tokio::join!(alice.connect(&peer), alice.connect(&peer));
        assert_eq!(a.unwrap(), TransportKind::Socket);
        assert_eq!(b.unwrap(), TransportKind::Socket);
        assert_eq!(alice.stats().dial_attempts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_after_retries() {
        let (alice, _events) = node("a11ce").await;
        let ghost = PeerId::new("0x6405", ChainType::Ethereum, "ghost");

        let err = alice.connect(&ghost).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(alice.stats().dial_attempts, 0);

        let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);
        alice.add_address(
            &ghost,
            Address::Socket {
                host: "127.0.0.1".to_string(),
                port,
            },
        );
        let err = alice.send(&ghost, "p", vec![1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(alice.stats().dial_attempts, 2);
    }

    #[tokio::test]
    async fn test_cancelled_connect_releases_dial_slot() {
        let (alice, _events) = node("a11ce").await;
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mute = PeerId::new("0x307e", ChainType::Ethereum, "mute");
        alice.add_address(
            &mute,
            Address::Socket {
                host: "127.0.0.1".to_string(),
                port: silent.local_addr().unwrap().port(),
            },
        );

        // the listener never answers the hello, so the dial hangs
        let cancelled = tokio::time::timeout(Duration::from_millis(100), alice.connect(&mute)).await;
        assert!(cancelled.is_err());
        assert!(alice.inner.dial_slots.lock().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_identity_at_address_rejected() {
        let (alice, _a) = node("a11ce").await;
        let (bob, _b) = node("b0b").await;
        let mallory = PeerId::new("0x3a11", ChainType::Ethereum, "mallory");
        alice.add_address(&mallory, bob.local_addresses().remove(0));

        let err = alice.connect(&mallory).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert!(alice.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_reported_to_remote() {
        let (alice, _alice_events) = node("a11ce").await;
        let (bob, mut bob_events) = node("b0b").await;
        alice.add_address(bob.local_peer(), bob.local_addresses().remove(0));
        alice.connect(bob.local_peer()).await.unwrap();

        alice.disconnect(bob.local_peer()).await;
        loop {
            match bob_events.recv().await.unwrap() {
                ManagerEvent::PeerDisconnected { peer } => {
                    assert_eq!(&peer, alice.local_peer());
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (alice, _events) = node("a11ce").await;
        let bob = PeerId::new("0xb0b", ChainType::Ethereum, "b");
        let err = alice
            .send(&bob, "p", vec![0u8; crate::MAX_MESSAGE_SIZE + 1])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::utils::MessengerError::Protocol(ProtocolError::MessageTooLarge { .. })
        ));
    }
}
