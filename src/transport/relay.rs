//! Relay transport and the rendezvous server it talks to.
//!
//! Clients keep one TCP session to a [`RelayServer`], register under their
//! peer id and heartbeat to stay present. A dial asks the server to open a
//! circuit to another registered client; each circuit surfaces as an ordinary
//! byte stream on both ends. Half-closing one direction leaves the other
//! direction of the circuit usable.

use crate::identity::{Address, PeerId, TransportKind};
use crate::transport::{
    emit, ensure_kind, framing, BoxedIo, Connection, ConnectionState, DiscoveredPeer, Stream,
    Transport, TransportEvent, TransportRuntime, PAYLOAD_STREAM,
};
use crate::utils::{MessengerError, NetworkError, ProtocolError, RelayConfig, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Largest control frame on a relay session
const RELAY_FRAME_MAX: usize = 1024 * 1024;
/// Bytes read from a circuit per data frame
const CIRCUIT_CHUNK: usize = 16 * 1024;
const CIRCUIT_BUFFER: usize = 64 * 1024;
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
/// Heartbeats a client may miss before it is considered gone
const MISSED_HEARTBEATS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RelayFrame {
    Register {
        name: String,
        peer: PeerId,
    },
    Registered {
        server_id: String,
    },
    Open {
        request: u64,
        to: String,
    },
    Opened {
        request: u64,
        circuit: u64,
    },
    Incoming {
        circuit: u64,
        from: String,
    },
    Data {
        circuit: u64,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Sender will write no more on this circuit
    Finish {
        circuit: u64,
    },
    /// Circuit torn down, the other end went away
    Reset {
        circuit: u64,
    },
    Heartbeat,
    HeartbeatAck,
    ListPeers,
    Peers {
        entries: Vec<(String, PeerId)>,
    },
    Error {
        request: Option<u64>,
        reason: String,
    },
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<RelayFrame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = framing::write_message(&mut writer, &frame, RELAY_FRAME_MAX).await {
            log::debug!("Relay session write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Server

struct ClientEntry {
    peer: PeerId,
    session: u64,
    tx: mpsc::Sender<RelayFrame>,
}

struct Circuit {
    a: String,
    b: String,
    a_finished: bool,
    b_finished: bool,
}

impl Circuit {
    fn other(&self, name: &str) -> Option<&str> {
        if self.a == name {
            Some(self.b.as_str())
        } else if self.b == name {
            Some(self.a.as_str())
        } else {
            None
        }
    }
}

#[derive(Default)]
struct ServerState {
    clients: Mutex<HashMap<String, ClientEntry>>,
    circuits: Mutex<HashMap<u64, Circuit>>,
    next_id: AtomicU64,
}

impl ServerState {
    fn sender(&self, name: &str) -> Option<mpsc::Sender<RelayFrame>> {
        self.clients.lock().get(name).map(|c| c.tx.clone())
    }

    async fn deliver(&self, name: &str, frame: RelayFrame) {
        if let Some(tx) = self.sender(name) {
            let _ = tx.send(frame).await;
        }
    }

    async fn open(&self, from: &str, request: u64, to: &str) -> RelayFrame {
        let Some(target) = self.sender(to) else {
            return RelayFrame::Error {
                request: Some(request),
                reason: format!("{to} is not connected to this relay"),
            };
        };
        let circuit = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.circuits.lock().insert(
            circuit,
            Circuit {
                a: from.to_string(),
                b: to.to_string(),
                a_finished: false,
                b_finished: false,
            },
        );
        if target
            .send(RelayFrame::Incoming {
                circuit,
                from: from.to_string(),
            })
            .await
            .is_err()
        {
            self.circuits.lock().remove(&circuit);
            return RelayFrame::Error {
                request: Some(request),
                reason: format!("{to} went away"),
            };
        }
        RelayFrame::Opened { request, circuit }
    }

    async fn forward(&self, from: &str, circuit: u64, payload: Vec<u8>) {
        let other = self
            .circuits
            .lock()
            .get(&circuit)
            .and_then(|c| c.other(from).map(str::to_string));
        if let Some(other) = other {
            self.deliver(&other, RelayFrame::Data { circuit, payload }).await;
        }
    }

    async fn finish(&self, from: &str, circuit: u64) {
        let other = {
            let mut circuits = self.circuits.lock();
            let Some(entry) = circuits.get_mut(&circuit) else {
                return;
            };
            let Some(other) = entry.other(from).map(str::to_string) else {
                return;
            };
            if entry.a == from {
                entry.a_finished = true;
            } else {
                entry.b_finished = true;
            }
            if entry.a_finished && entry.b_finished {
                circuits.remove(&circuit);
            }
            other
        };
        self.deliver(&other, RelayFrame::Finish { circuit }).await;
    }

    /// Drop a client and reset every circuit it was part of
    async fn disconnect(&self, name: &str, session: u64) {
        {
            let mut clients = self.clients.lock();
            if clients.get(name).map(|c| c.session) == Some(session) {
                clients.remove(name);
            }
        }
        let orphaned: Vec<(u64, String)> = {
            let mut circuits = self.circuits.lock();
            let ids: Vec<u64> = circuits
                .iter()
                .filter(|(_, c)| c.other(name).is_some())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    circuits
                        .remove(&id)
                        .and_then(|c| c.other(name).map(|o| (id, o.to_string())))
                })
                .collect()
        };
        for (circuit, other) in orphaned {
            self.deliver(&other, RelayFrame::Reset { circuit }).await;
        }
    }

    fn peers(&self) -> Vec<(String, PeerId)> {
        self.clients
            .lock()
            .iter()
            .map(|(name, c)| (name.clone(), c.peer.clone()))
            .collect()
    }
}

async fn serve_client(stream: TcpStream, state: Arc<ServerState>, server_id: String, presence: Duration) {
    let remote = stream.peer_addr().ok();
    let (mut reader, writer) = stream.into_split();

    let registration = tokio::time::timeout(
        REGISTER_TIMEOUT,
        framing::read_message::<_, RelayFrame>(&mut reader, RELAY_FRAME_MAX),
    )
    .await;
    let (name, peer) = match registration {
        Ok(Ok(Some(RelayFrame::Register { name, peer }))) => (name, peer),
        _ => {
            log::debug!("Relay client {remote:?} did not register");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(256);
    let writer_task = tokio::spawn(write_frames(writer, rx));
    let session = state.next_id.fetch_add(1, Ordering::SeqCst);
    state.clients.lock().insert(
        name.clone(),
        ClientEntry {
            peer,
            session,
            tx: tx.clone(),
        },
    );
    let _ = tx.send(RelayFrame::Registered { server_id }).await;
    log::info!("Relay client {name} registered from {remote:?}");

    loop {
        let frame = match tokio::time::timeout(
            presence,
            framing::read_message::<_, RelayFrame>(&mut reader, RELAY_FRAME_MAX),
        )
        .await
        {
            Err(_) => {
                log::info!("Relay client {name} missed its heartbeats");
                break;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                log::debug!("Relay client {name} sent a bad frame: {e}");
                break;
            }
        };

        match frame {
            RelayFrame::Heartbeat => {
                let _ = tx.send(RelayFrame::HeartbeatAck).await;
            }
            RelayFrame::Open { request, to } => {
                let reply = state.open(&name, request, &to).await;
                let _ = tx.send(reply).await;
            }
            RelayFrame::Data { circuit, payload } => state.forward(&name, circuit, payload).await,
            RelayFrame::Finish { circuit } => state.finish(&name, circuit).await,
            RelayFrame::ListPeers => {
                let entries = state.peers();
                let _ = tx.send(RelayFrame::Peers { entries }).await;
            }
            other => log::debug!("Relay client {name} sent unexpected {other:?}"),
        }
    }

    state.disconnect(&name, session).await;
    drop(tx);
    writer_task.abort();
    log::info!("Relay client {name} left");
}

/// Rendezvous server relaying circuits between registered clients
pub struct RelayServer {
    server_id: String,
    listener: TcpListener,
    presence: Duration,
    state: Arc<ServerState>,
}

impl RelayServer {
    /// Bind a relay server
    ///
    /// # Arguments
    ///
    /// * `addr` - Listen address
    /// * `server_id` - Identifier clients put in relay addresses
    /// * `heartbeat_interval` - Interval clients are expected to heartbeat at
    pub async fn bind(
        addr: SocketAddr,
        server_id: impl Into<String>,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| NetworkError::Transport {
            reason: format!("bind {addr}: {e}"),
        })?;
        Ok(Self {
            server_id: server_id.into(),
            listener,
            presence: heartbeat_interval * MISSED_HEARTBEATS,
            state: Arc::new(ServerState::default()),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the task is dropped or aborted
    pub async fn run(self) {
        log::info!(
            "Relay {} serving on {:?}",
            self.server_id,
            self.listener.local_addr().ok()
        );
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(serve_client(
                        stream,
                        self.state.clone(),
                        self.server_id.clone(),
                        self.presence,
                    ));
                }
                Err(e) => {
                    log::warn!("Relay accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Run on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

// ---------------------------------------------------------------------------
// Client

struct RelaySession {
    server_id: String,
    outbound: mpsc::Sender<RelayFrame>,
    pending_opens: Mutex<HashMap<u64, oneshot::Sender<Result<BoxedIo>>>>,
    pending_peers: Mutex<VecDeque<oneshot::Sender<Vec<(String, PeerId)>>>>,
    circuits: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    next_request: AtomicU64,
    alive: AtomicBool,
    last_ack: Mutex<Instant>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelaySession {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.circuits.lock().clear();
        self.pending_opens.lock().clear();
        self.pending_peers.lock().clear();
    }

    /// Byte stream for a circuit; inbound data is routed to it from now on
    fn bridge(&self, circuit: u64) -> BoxedIo {
        let (app, relay_side) = tokio::io::duplex(CIRCUIT_BUFFER);
        let (mut from_app, mut to_app) = tokio::io::split(relay_side);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        self.circuits.lock().insert(circuit, tx);

        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if to_app.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = to_app.shutdown().await;
        });

        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; CIRCUIT_CHUNK];
            loop {
                match from_app.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = RelayFrame::Data {
                            circuit,
                            payload: buf[..n].to_vec(),
                        };
                        if outbound.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = outbound.send(RelayFrame::Finish { circuit }).await;
        });

        Box::new(app)
    }

    async fn request(&self, frame: RelayFrame) -> Result<()> {
        self.outbound.send(frame).await.map_err(|_| {
            NetworkError::ConnectionClosed {
                peer: format!("relay {}", self.server_id),
            }
            .into()
        })
    }

    async fn open(&self, to: &str) -> Result<BoxedIo> {
        let request = self.next_request.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_opens.lock().insert(request, tx);
        if let Err(e) = self
            .request(RelayFrame::Open {
                request,
                to: to.to_string(),
            })
            .await
        {
            self.pending_opens.lock().remove(&request);
            return Err(e);
        }
        rx.await.map_err(|_| NetworkError::ConnectionClosed {
            peer: format!("relay {}", self.server_id),
        })?
    }

    async fn list_peers(&self, timeout: Duration) -> Result<Vec<(String, PeerId)>> {
        let (tx, rx) = oneshot::channel();
        self.pending_peers.lock().push_back(tx);
        self.request(RelayFrame::ListPeers).await?;
        tokio::time::timeout(timeout, rx)
            .await
            .map_err(|_| NetworkError::Timeout {
                operation: "relay peer list".to_string(),
            })?
            .map_err(|_| {
                NetworkError::ConnectionClosed {
                    peer: format!("relay {}", self.server_id),
                }
                .into()
            })
    }
}

fn open_connection(io: BoxedIo, address: Address, max_frame: usize) -> Result<Connection> {
    let connection = Connection::new(TransportKind::Relay, address);
    connection.add_stream(Stream::new(PAYLOAD_STREAM, io, max_frame));
    connection.transition(ConnectionState::Open)?;
    Ok(connection)
}

async fn read_session(
    session: Arc<RelaySession>,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    max_frame: usize,
) {
    loop {
        let frame = match framing::read_message::<_, RelayFrame>(&mut reader, RELAY_FRAME_MAX).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Relay {} session broke: {e}", session.server_id);
                break;
            }
        };

        match frame {
            RelayFrame::Opened { request, circuit } => {
                let waiter = session.pending_opens.lock().remove(&request);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(session.bridge(circuit)));
                } else {
                    // Dial was cancelled; release the circuit
                    let _ = session.outbound.send(RelayFrame::Finish { circuit }).await;
                }
            }
            RelayFrame::Error {
                request: Some(request),
                reason,
            } => {
                if let Some(waiter) = session.pending_opens.lock().remove(&request) {
                    let _ = waiter.send(Err(NetworkError::ConnectionFailed {
                        peer: format!("relay {}", session.server_id),
                        reason,
                    }
                    .into()));
                }
            }
            RelayFrame::Incoming { circuit, from } => {
                let address = Address::Relay {
                    server_id: session.server_id.clone(),
                    peer: from.clone(),
                };
                match open_connection(session.bridge(circuit), address, max_frame) {
                    Ok(connection) => {
                        log::debug!("Relay circuit {circuit} from {from}");
                        emit(&events, TransportEvent::IncomingConnection(connection)).await;
                    }
                    Err(e) => log::warn!("Relay circuit {circuit} from {from} failed: {e}"),
                }
            }
            RelayFrame::Data { circuit, payload } => {
                let tx = session.circuits.lock().get(&circuit).cloned();
                if let Some(tx) = tx {
                    if tx.send(payload).await.is_err() {
                        session.circuits.lock().remove(&circuit);
                    }
                }
            }
            RelayFrame::Finish { circuit } | RelayFrame::Reset { circuit } => {
                session.circuits.lock().remove(&circuit);
            }
            RelayFrame::HeartbeatAck => *session.last_ack.lock() = Instant::now(),
            RelayFrame::Peers { entries } => {
                if let Some(waiter) = session.pending_peers.lock().pop_front() {
                    let _ = waiter.send(entries);
                }
            }
            other => log::debug!("Relay sent unexpected {other:?}"),
        }
    }

    session.alive.store(false, Ordering::SeqCst);
    session.circuits.lock().clear();
    session.pending_opens.lock().clear();
    session.pending_peers.lock().clear();
}

async fn heartbeat(session: Arc<RelaySession>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let silent_for = session.last_ack.lock().elapsed();
        if silent_for > interval * MISSED_HEARTBEATS {
            log::warn!(
                "Relay {} stopped answering heartbeats; dropping session",
                session.server_id
            );
            session.shutdown();
            return;
        }
        if session.outbound.send(RelayFrame::Heartbeat).await.is_err() {
            return;
        }
    }
}

/// Relay transport
pub struct RelayTransport {
    config: RelayConfig,
    local: PeerId,
    max_frame: usize,
    session: tokio::sync::Mutex<Option<Arc<RelaySession>>>,
    runtime: TransportRuntime,
}

impl RelayTransport {
    /// Create a relay transport
    ///
    /// # Arguments
    ///
    /// * `config` - Relay server and heartbeat settings
    /// * `local` - Identity we register under
    /// * `max_frame` - Largest frame accepted on circuits
    pub fn new(config: RelayConfig, local: PeerId, max_frame: usize) -> Self {
        Self {
            config,
            local,
            max_frame,
            session: tokio::sync::Mutex::new(None),
            runtime: TransportRuntime::new(TransportKind::Relay),
        }
    }

    /// Name we register under on the relay
    pub fn registration_name(&self) -> String {
        self.local.to_string()
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }

    async fn connect(&self) -> Result<Arc<RelaySession>> {
        let events = self.runtime.sender()?;
        let failed = |reason: String| -> MessengerError {
            NetworkError::ConnectionFailed {
                peer: format!("relay {}", self.config.server_id),
                reason,
            }
            .into()
        };

        let stream = tokio::time::timeout(REGISTER_TIMEOUT, TcpStream::connect(&self.config.server_addr))
            .await
            .map_err(|_| failed("connect timed out".to_string()))?
            .map_err(|e| failed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let register = RelayFrame::Register {
            name: self.registration_name(),
            peer: self.local.clone(),
        };
        framing::write_message(&mut writer, &register, RELAY_FRAME_MAX).await?;
        let reply = tokio::time::timeout(
            REGISTER_TIMEOUT,
            framing::read_message::<_, RelayFrame>(&mut reader, RELAY_FRAME_MAX),
        )
        .await
        .map_err(|_| failed("registration timed out".to_string()))??;
        match reply {
            Some(RelayFrame::Registered { server_id }) if server_id == self.config.server_id => {}
            Some(RelayFrame::Registered { server_id }) => {
                return Err(ProtocolError::InvalidMessage {
                    reason: format!(
                        "relay identifies as {server_id}, expected {}",
                        self.config.server_id
                    ),
                }
                .into())
            }
            _ => return Err(failed("registration refused".to_string())),
        }

        let (outbound, rx) = mpsc::channel(256);
        let session = Arc::new(RelaySession {
            server_id: self.config.server_id.clone(),
            outbound,
            pending_opens: Mutex::new(HashMap::new()),
            pending_peers: Mutex::new(VecDeque::new()),
            circuits: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            last_ack: Mutex::new(Instant::now()),
            tasks: Mutex::new(Vec::new()),
        });
        let tasks = vec![
            tokio::spawn(write_frames(writer, rx)),
            tokio::spawn(read_session(session.clone(), reader, events, self.max_frame)),
            tokio::spawn(heartbeat(session.clone(), self.heartbeat_interval())),
        ];
        session.tasks.lock().extend(tasks);
        log::info!(
            "Registered on relay {} as {}",
            self.config.server_id,
            self.registration_name()
        );
        Ok(session)
    }

    /// Live session, reconnecting if the previous one dropped
    async fn session(&self) -> Result<Arc<RelaySession>> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if session.is_alive() {
                return Ok(session.clone());
            }
            session.shutdown();
        }
        let session = self.connect().await?;
        *current = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    async fn init(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.runtime.attach(events);
        Ok(())
    }

    /// Registers right away; if the relay is down the session is retried on
    /// the next dial or discovery.
    async fn start(&self) -> Result<()> {
        if !self.runtime.begin()? {
            return Ok(());
        }
        if let Err(e) = self.session().await {
            log::warn!("Relay {} unavailable: {e}", self.config.server_id);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown();
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown();
        }
        Ok(())
    }

    async fn dial(&self, address: &Address) -> Result<Connection> {
        ensure_kind(TransportKind::Relay, address)?;
        self.runtime.require_started()?;
        let Address::Relay { server_id, peer } = address else {
            return Err(NetworkError::UnsupportedAddress {
                transport: TransportKind::Relay.to_string(),
                address: address.to_string(),
            }
            .into());
        };
        if server_id != &self.config.server_id {
            return Err(NetworkError::UnsupportedAddress {
                transport: format!("relay {}", self.config.server_id),
                address: address.to_string(),
            }
            .into());
        }

        let session = self.session().await?;
        let io = session.open(peer).await?;
        log::debug!("Relay circuit open to {peer}");
        open_connection(io, address.clone(), self.max_frame)
    }

    fn listen_addresses(&self) -> Vec<Address> {
        if !self.runtime.is_started() {
            return Vec::new();
        }
        vec![Address::Relay {
            server_id: self.config.server_id.clone(),
            peer: self.registration_name(),
        }]
    }

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>> {
        self.runtime.require_started()?;
        let events = self.runtime.sender()?;
        let session = self.session().await?;
        let own = self.registration_name();

        let mut found = Vec::new();
        for (name, peer) in session.list_peers(REGISTER_TIMEOUT).await? {
            if name == own {
                continue;
            }
            let address = Address::Relay {
                server_id: self.config.server_id.clone(),
                peer: name,
            };
            let peer = DiscoveredPeer::now(peer, address, None);
            emit(&events, TransportEvent::PeerDiscovered(peer.clone())).await;
            found.push(peer);
        }
        Ok(found)
    }
}
