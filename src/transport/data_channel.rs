//! Peer data-channel transport.
//!
//! Connection setup is negotiated over an out-of-band [`Signaling`] service:
//! the dialer sends an offer, the callee answers, both trade ICE candidates,
//! and then two ordered channels open, one for control and one for payload.
//! The peer-connection machinery itself sits behind [`RtcBackend`].

use crate::identity::{Address, PeerId, TransportKind};
use crate::transport::{
    emit, ensure_kind, BoxedIo, Connection, ConnectionState, DiscoveredPeer, Stream, Transport,
    TransportEvent, TransportRuntime, CONTROL_STREAM, PAYLOAD_STREAM,
};
use crate::utils::{DataChannelConfig, MessengerError, NetworkError, ProtocolError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

const CHANNEL_BUFFER: usize = 64 * 1024;

/// Messages exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalMessage {
    /// Session description from the dialer
    Offer { session: Uuid, sdp: String },
    /// Session description from the callee
    Answer { session: Uuid, sdp: String },
    /// One ICE candidate
    Candidate { session: Uuid, candidate: String },
    /// Callee refused the offer
    Reject { session: Uuid, reason: String },
}

/// A signaling message and its sender
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    /// Signaling id of the sender
    pub from: String,
    /// Payload
    pub message: SignalMessage,
}

/// Out-of-band rendezvous used to negotiate connections
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Register under `id` and receive messages addressed to it
    async fn register(&self, id: &str, peer: &PeerId) -> Result<mpsc::Receiver<SignalEnvelope>>;

    /// Drop the registration
    async fn unregister(&self, id: &str);

    /// Deliver a message to `to`
    async fn send(&self, from: &str, to: &str, message: SignalMessage) -> Result<()>;

    /// Everyone currently registered
    async fn peers(&self) -> Result<Vec<(String, PeerId)>>;
}

/// Peer-connection backend
#[async_trait]
pub trait RtcBackend: Send + Sync {
    /// Local offer for a new session
    async fn create_offer(&self, session: Uuid, ice_servers: &[String]) -> Result<String>;

    /// Apply a remote offer and produce the answer
    async fn accept_offer(&self, session: Uuid, offer: &str, ice_servers: &[String]) -> Result<String>;

    /// Apply the remote answer to a session we offered
    async fn accept_answer(&self, session: Uuid, answer: &str) -> Result<()>;

    /// Candidates gathered for a session
    async fn local_candidates(&self, session: Uuid) -> Result<Vec<String>>;

    /// Apply a remote candidate
    async fn add_remote_candidate(&self, session: Uuid, candidate: &str) -> Result<()>;

    /// Open a labeled channel once connectivity is established
    async fn open_channel(&self, session: Uuid, label: &str) -> Result<BoxedIo>;

    /// Release everything held for a session
    fn close_session(&self, session: Uuid);
}

type PendingAnswers = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<String>>>>>;

/// Negotiation state shared by `dial` and the signaling dispatcher
struct Negotiator {
    local_id: String,
    config: DataChannelConfig,
    signaling: Arc<dyn Signaling>,
    backend: Arc<dyn RtcBackend>,
    max_frame: usize,
    pending: PendingAnswers,
}

impl Negotiator {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.signaling_timeout_ms)
    }

    async fn send_candidates(&self, to: &str, session: Uuid) -> Result<()> {
        for candidate in self.backend.local_candidates(session).await? {
            self.signaling
                .send(&self.local_id, to, SignalMessage::Candidate { session, candidate })
                .await?;
        }
        Ok(())
    }

    /// Open both channels and wrap them in an open connection
    async fn open_channels(&self, session: Uuid, remote_id: &str) -> Result<Connection> {
        let connection = Connection::new(
            TransportKind::DataChannel,
            Address::DataChannel {
                signaling_id: remote_id.to_string(),
            },
        );
        let channels = [
            (CONTROL_STREAM, self.config.control_label.as_str()),
            (PAYLOAD_STREAM, self.config.payload_label.as_str()),
        ];
        for (stream, label) in channels {
            let io = tokio::time::timeout(self.timeout(), self.backend.open_channel(session, label))
                .await
                .map_err(|_| NetworkError::Timeout {
                    operation: format!("data channel '{label}' to {remote_id}"),
                })??;
            connection.add_stream(Stream::new(stream, io, self.max_frame));
        }
        connection.transition(ConnectionState::Open)?;
        Ok(connection)
    }

    async fn offer(&self, remote_id: &str) -> Result<Connection> {
        let session = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(session, tx);

        let result = async {
            let sdp = self
                .backend
                .create_offer(session, &self.config.ice_servers)
                .await?;
            self.signaling
                .send(&self.local_id, remote_id, SignalMessage::Offer { session, sdp })
                .await?;

            let answer = tokio::time::timeout(self.timeout(), rx)
                .await
                .map_err(|_| NetworkError::Timeout {
                    operation: format!("signaling answer from {remote_id}"),
                })?
                .map_err(|_| NetworkError::ConnectionFailed {
                    peer: remote_id.to_string(),
                    reason: "signaling stopped".to_string(),
                })??;

            self.backend.accept_answer(session, &answer).await?;
            self.send_candidates(remote_id, session).await?;
            self.open_channels(session, remote_id).await
        }
        .await;

        if result.is_err() {
            self.pending.lock().remove(&session);
            self.backend.close_session(session);
        }
        result
    }

    async fn answer(&self, remote_id: &str, session: Uuid, offer: &str) -> Result<Connection> {
        let sdp = match self
            .backend
            .accept_offer(session, offer, &self.config.ice_servers)
            .await
        {
            Ok(sdp) => sdp,
            Err(e) => {
                let reject = SignalMessage::Reject {
                    session,
                    reason: e.to_string(),
                };
                if let Err(send_err) = self.signaling.send(&self.local_id, remote_id, reject).await {
                    log::debug!("Could not reject offer from {remote_id}: {send_err}");
                }
                return Err(e);
            }
        };
        self.signaling
            .send(&self.local_id, remote_id, SignalMessage::Answer { session, sdp })
            .await?;
        self.send_candidates(remote_id, session).await?;

        let result = self.open_channels(session, remote_id).await;
        if result.is_err() {
            self.backend.close_session(session);
        }
        result
    }
}

/// Data-channel transport
pub struct DataChannelTransport {
    local: PeerId,
    negotiator: Arc<Negotiator>,
    runtime: TransportRuntime,
}

impl DataChannelTransport {
    /// Create a data-channel transport
    ///
    /// # Arguments
    ///
    /// * `config` - Channel labels, ICE servers and signaling timeout
    /// * `local` - Identity announced on signaling
    /// * `signaling_id` - Our id on the signaling service
    /// * `signaling` - Signaling service
    /// * `backend` - Peer-connection backend
    /// * `max_frame` - Largest frame accepted on either channel
    pub fn new(
        config: DataChannelConfig,
        local: PeerId,
        signaling_id: impl Into<String>,
        signaling: Arc<dyn Signaling>,
        backend: Arc<dyn RtcBackend>,
        max_frame: usize,
    ) -> Self {
        Self {
            local,
            negotiator: Arc::new(Negotiator {
                local_id: signaling_id.into(),
                config,
                signaling,
                backend,
                max_frame,
                pending: Arc::new(Mutex::new(HashMap::new())),
            }),
            runtime: TransportRuntime::new(TransportKind::DataChannel),
        }
    }
}

async fn dispatch(
    negotiator: Arc<Negotiator>,
    mut inbox: mpsc::Receiver<SignalEnvelope>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(SignalEnvelope { from, message }) = inbox.recv().await {
        match message {
            SignalMessage::Offer { session, sdp } => {
                let negotiator = negotiator.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    match negotiator.answer(&from, session, &sdp).await {
                        Ok(connection) => {
                            emit(&events, TransportEvent::IncomingConnection(connection)).await
                        }
                        Err(e) => log::warn!("Offer from {from} failed: {e}"),
                    }
                });
            }
            SignalMessage::Answer { session, sdp } => {
                if let Some(tx) = negotiator.pending.lock().remove(&session) {
                    let _ = tx.send(Ok(sdp));
                }
            }
            SignalMessage::Candidate { session, candidate } => {
                if let Err(e) = negotiator
                    .backend
                    .add_remote_candidate(session, &candidate)
                    .await
                {
                    log::debug!("Dropping candidate from {from}: {e}");
                }
            }
            SignalMessage::Reject { session, reason } => {
                if let Some(tx) = negotiator.pending.lock().remove(&session) {
                    let _ = tx.send(Err(NetworkError::ConnectionFailed {
                        peer: from.clone(),
                        reason,
                    }
                    .into()));
                }
            }
        }
    }
    log::debug!("Signaling inbox closed");
}

#[async_trait]
impl Transport for DataChannelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::DataChannel
    }

    async fn init(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.runtime.attach(events);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.runtime.begin()? {
            return Ok(());
        }
        let inbox = match self
            .negotiator
            .signaling
            .register(&self.negotiator.local_id, &self.local)
            .await
        {
            Ok(inbox) => inbox,
            Err(e) => {
                self.runtime.shutdown();
                return Err(e);
            }
        };
        let events = self.runtime.sender()?;
        self.runtime
            .spawn(dispatch(self.negotiator.clone(), inbox, events));
        log::info!("Data channel signaling as {}", self.negotiator.local_id);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown();
        self.negotiator
            .signaling
            .unregister(&self.negotiator.local_id)
            .await;
        Ok(())
    }

    async fn dial(&self, address: &Address) -> Result<Connection> {
        ensure_kind(TransportKind::DataChannel, address)?;
        self.runtime.require_started()?;
        let Address::DataChannel { signaling_id } = address else {
            return Err(NetworkError::UnsupportedAddress {
                transport: TransportKind::DataChannel.to_string(),
                address: address.to_string(),
            }
            .into());
        };
        self.negotiator.offer(signaling_id).await
    }

    fn listen_addresses(&self) -> Vec<Address> {
        if !self.runtime.is_started() {
            return Vec::new();
        }
        vec![Address::DataChannel {
            signaling_id: self.negotiator.local_id.clone(),
        }]
    }

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>> {
        self.runtime.require_started()?;
        let events = self.runtime.sender()?;
        let mut found = Vec::new();
        for (id, peer) in self.negotiator.signaling.peers().await? {
            if id == self.negotiator.local_id {
                continue;
            }
            let peer = DiscoveredPeer::now(peer, Address::DataChannel { signaling_id: id }, None);
            emit(&events, TransportEvent::PeerDiscovered(peer.clone())).await;
            found.push(peer);
        }
        Ok(found)
    }
}

/// In-process signaling hub
#[derive(Default)]
pub struct MemorySignaling {
    members: Mutex<HashMap<String, (PeerId, mpsc::Sender<SignalEnvelope>)>>,
}

impl MemorySignaling {
    /// Empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn register(&self, id: &str, peer: &PeerId) -> Result<mpsc::Receiver<SignalEnvelope>> {
        let (tx, rx) = mpsc::channel(64);
        self.members
            .lock()
            .insert(id.to_string(), (peer.clone(), tx));
        Ok(rx)
    }

    async fn unregister(&self, id: &str) {
        self.members.lock().remove(id);
    }

    async fn send(&self, from: &str, to: &str, message: SignalMessage) -> Result<()> {
        let inbox = self
            .members
            .lock()
            .get(to)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| NetworkError::ConnectionFailed {
                peer: to.to_string(),
                reason: "not registered on signaling".to_string(),
            })?;
        inbox
            .send(SignalEnvelope {
                from: from.to_string(),
                message,
            })
            .await
            .map_err(|_| {
                NetworkError::ConnectionFailed {
                    peer: to.to_string(),
                    reason: "signaling inbox closed".to_string(),
                }
                .into()
            })
    }

    async fn peers(&self) -> Result<Vec<(String, PeerId)>> {
        Ok(self
            .members
            .lock()
            .iter()
            .map(|(id, (peer, _))| (id.clone(), peer.clone()))
            .collect())
    }
}

/// Where in-process channels meet
#[derive(Default)]
pub struct RtcFabric {
    waiting: Mutex<HashMap<(Uuid, String), DuplexStream>>,
}

impl RtcFabric {
    /// Empty fabric
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn rendezvous(&self, session: Uuid, label: &str) -> DuplexStream {
        let mut waiting = self.waiting.lock();
        if let Some(theirs) = waiting.remove(&(session, label.to_string())) {
            return theirs;
        }
        let (ours, theirs) = tokio::io::duplex(CHANNEL_BUFFER);
        waiting.insert((session, label.to_string()), theirs);
        ours
    }

    fn forget(&self, session: Uuid) {
        self.waiting.lock().retain(|(s, _), _| *s != session);
    }
}

#[derive(Debug, Default)]
struct Negotiation {
    local: Option<String>,
    remote: Option<String>,
    remote_candidates: Vec<String>,
}

impl Negotiation {
    fn connected(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && !self.remote_candidates.is_empty()
    }
}

/// In-process peer-connection backend
pub struct MemoryRtc {
    endpoint: String,
    fabric: Arc<RtcFabric>,
    sessions: Mutex<HashMap<Uuid, Negotiation>>,
    ice_progress: Notify,
}

impl MemoryRtc {
    /// Backend named `endpoint` on a shared fabric
    pub fn new(fabric: Arc<RtcFabric>, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            fabric,
            sessions: Mutex::new(HashMap::new()),
            ice_progress: Notify::new(),
        }
    }

    fn invalid_sdp(reason: &str) -> MessengerError {
        ProtocolError::InvalidMessage {
            reason: format!("session description: {reason}"),
        }
        .into()
    }
}

#[async_trait]
impl RtcBackend for MemoryRtc {
    async fn create_offer(&self, session: Uuid, _ice_servers: &[String]) -> Result<String> {
        let sdp = format!("memory-offer {} {}", self.endpoint, session);
        self.sessions.lock().entry(session).or_default().local = Some(sdp.clone());
        Ok(sdp)
    }

    async fn accept_offer(&self, session: Uuid, offer: &str, _ice_servers: &[String]) -> Result<String> {
        if !offer.starts_with("memory-offer ") || !offer.ends_with(&session.to_string()) {
            return Err(Self::invalid_sdp("offer does not match session"));
        }
        let answer = format!("memory-answer {} {}", self.endpoint, session);
        let mut sessions = self.sessions.lock();
        let negotiation = sessions.entry(session).or_default();
        negotiation.remote = Some(offer.to_string());
        negotiation.local = Some(answer.clone());
        Ok(answer)
    }

    async fn accept_answer(&self, session: Uuid, answer: &str) -> Result<()> {
        if !answer.starts_with("memory-answer ") || !answer.ends_with(&session.to_string()) {
            return Err(Self::invalid_sdp("answer does not match session"));
        }
        let mut sessions = self.sessions.lock();
        let negotiation = sessions
            .get_mut(&session)
            .filter(|n| n.local.is_some())
            .ok_or_else(|| Self::invalid_sdp("answer for a session we never offered"))?;
        negotiation.remote = Some(answer.to_string());
        drop(sessions);
        self.ice_progress.notify_waiters();
        Ok(())
    }

    async fn local_candidates(&self, session: Uuid) -> Result<Vec<String>> {
        if !self.sessions.lock().contains_key(&session) {
            return Err(Self::invalid_sdp("unknown session"));
        }
        Ok(vec![format!(
            "candidate:1 1 memory {} {} typ host",
            self.endpoint, session
        )])
    }

    async fn add_remote_candidate(&self, session: Uuid, candidate: &str) -> Result<()> {
        if !candidate.starts_with("candidate:") {
            return Err(Self::invalid_sdp("malformed candidate"));
        }
        self.sessions
            .lock()
            .entry(session)
            .or_default()
            .remote_candidates
            .push(candidate.to_string());
        self.ice_progress.notify_waiters();
        Ok(())
    }

    async fn open_channel(&self, session: Uuid, label: &str) -> Result<BoxedIo> {
        loop {
            let progressed = self.ice_progress.notified();
            let connected = self
                .sessions
                .lock()
                .get(&session)
                .map(Negotiation::connected)
                .ok_or_else(|| Self::invalid_sdp("unknown session"))?;
            if connected {
                break;
            }
            progressed.await;
        }
        Ok(Box::new(self.fabric.rendezvous(session, label)))
    }

    fn close_session(&self, session: Uuid) {
        self.sessions.lock().remove(&session);
        self.fabric.forget(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChainType;

    fn config() -> DataChannelConfig {
        DataChannelConfig {
            signaling_timeout_ms: 500,
            ..DataChannelConfig::default()
        }
    }

    async fn endpoint(
        hub: &Arc<MemorySignaling>,
        fabric: &Arc<RtcFabric>,
        id: &str,
    ) -> (DataChannelTransport, mpsc::Receiver<TransportEvent>) {
        let peer = PeerId::new(format!("0x{id}"), ChainType::Ethereum, id);
        let transport = DataChannelTransport::new(
            config(),
            peer,
            id,
            hub.clone(),
            Arc::new(MemoryRtc::new(fabric.clone(), id)),
            4096,
        );
        let (tx, rx) = mpsc::channel(16);
        transport.init(tx).await.unwrap();
        transport.start().await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_negotiated_connection_has_two_channels() {
        let hub = MemorySignaling::new();
        let fabric = RtcFabric::new();
        let (alice, _alice_events) = endpoint(&hub, &fabric, "a11ce").await;
        let (_bob, mut bob_events) = endpoint(&hub, &fabric, "b0b").await;

        let found = alice.discover().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].addresses[0].to_string(), "webrtc/b0b");

        let connection = alice.dial(&found[0].addresses[0]).await.unwrap();
        assert!(connection.is_open());
        assert_eq!(
            connection.stream_names(),
            vec![CONTROL_STREAM.to_string(), PAYLOAD_STREAM.to_string()]
        );

        let incoming = match bob_events.recv().await.unwrap() {
            TransportEvent::IncomingConnection(c) => c,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(incoming.remote().to_string(), "webrtc/a11ce");

        let mut a_payload = connection.take_stream(PAYLOAD_STREAM).unwrap();
        let mut b_payload = incoming.take_stream(PAYLOAD_STREAM).unwrap();
        let mut a_control = connection.take_stream(CONTROL_STREAM).unwrap();
        let mut b_control = incoming.take_stream(CONTROL_STREAM).unwrap();

        a_payload.send(b"payload").await.unwrap();
        b_control.send(b"control").await.unwrap();
        assert_eq!(b_payload.recv().await.unwrap().unwrap(), b"payload");
        assert_eq!(a_control.recv().await.unwrap().unwrap(), b"control");
    }

    #[tokio::test]
    async fn test_unregistered_target_fails() {
        let hub = MemorySignaling::new();
        let fabric = RtcFabric::new();
        let (alice, _events) = endpoint(&hub, &fabric, "a11ce").await;

        let err = alice
            .dial(&Address::DataChannel {
                signaling_id: "nobody".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_silent_callee_times_out() {
        let hub = MemorySignaling::new();
        let fabric = RtcFabric::new();
        let (alice, _events) = endpoint(&hub, &fabric, "a11ce").await;
        let silent = PeerId::new("0x5", ChainType::Ethereum, "silent");
        let _inbox = hub.register("silent", &silent).await.unwrap();

        let err = alice
            .dial(&Address::DataChannel {
                signaling_id: "silent".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Network(NetworkError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_channel_waits_for_candidates() {
        let fabric = RtcFabric::new();
        let backend = MemoryRtc::new(fabric, "x");
        let session = Uuid::new_v4();
        backend.create_offer(session, &[]).await.unwrap();
        backend
            .accept_answer(session, &format!("memory-answer y {session}"))
            .await
            .unwrap();

        let pending =
            tokio::time::timeout(Duration::from_millis(20), backend.open_channel(session, "p")).await;
        assert!(pending.is_err());

        backend
            .add_remote_candidate(session, "candidate:1 1 memory y")
            .await
            .unwrap();
        assert!(backend.open_channel(session, "p").await.is_ok());
    }
}
