//! Messaging orchestrator.
//!
//! Sits between the UI and the protocol layers: outbound text is sealed into
//! the message store, ratchet-encrypted by the [`SessionService`] and handed
//! to the [`TransportManager`]; inbound frames flow the other way through a
//! single dispatch loop fed by the manager's event channel. Groups use
//! sender keys distributed over the pairwise sessions.

use super::contacts::{ContactDirectory, KeyChange};
use super::envelope::{Content, Envelope, Payload, ReceiptStatus, MESSAGING_PROTOCOL};
use crate::crypto::primitives::{hkdf_expand, SymmetricKey};
use crate::crypto::{PreKeyBundle, PrekeyManager, UserProfile, KEY_SIZE};
use crate::group::{GroupId, GroupMessage, GroupSession, SenderKeyDistribution};
use crate::identity::{ChainType, PeerId, TransportKind};
use crate::session::{SessionService, SessionStatus};
use crate::store::{
    Direction, GroupSessionStore, MessageId, MessageStatus, MessageStore, PreKeyStore,
    StoredMessage,
};
use crate::transport::{ManagerEvent, TransportManager};
use crate::utils::{
    BoundedCache, CryptoConfig, ErrorKind, GroupError, KeyedGuard, KeyedLocks, MessengerError,
    NetworkError, ProtocolError, Result, StoreError,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;
use zeroize::Zeroize;

const EVENT_QUEUE: usize = 256;

/// One-time prekey ids already handed out over the wire
const ISSUED_PREKEY_CAP: usize = 1024;

const BUNDLE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const STORAGE_KEY_INFO: &[u8] = b"swm-message-store-v1";

/// What the orchestrator reports to the UI
#[derive(Debug, Clone)]
pub enum MessagingEvent {
    /// A transport discovered a peer
    PeerDiscovered {
        /// The peer
        peer: PeerId,
    },
    /// A link to a peer opened
    PeerConnected {
        /// The peer
        peer: PeerId,
        /// Transport carrying the link
        kind: TransportKind,
    },
    /// The link to a peer closed
    PeerDisconnected {
        /// The peer
        peer: PeerId,
    },
    /// A text message arrived and was stored
    MessageReceived {
        /// Shared message id
        id: MessageId,
        /// Conversation, or the group id for group messages
        conversation: String,
        /// Author
        peer: PeerId,
        /// Decrypted body
        text: String,
        /// Group the message was sent to
        group: Option<GroupId>,
    },
    /// A stored message changed status
    StatusChanged {
        /// Message
        id: MessageId,
        /// New status
        status: MessageStatus,
    },
    /// An outbound message could not be delivered; retry with
    /// [`MessagingService::retry_message`]
    DeliveryFailed {
        /// Message
        id: MessageId,
        /// Error category
        kind: ErrorKind,
        /// Error text
        reason: String,
    },
    /// A peer presented an identity key different from the pinned one
    IdentityChanged {
        /// The peer
        peer: PeerId,
    },
    /// We joined a group from a member's sender key
    GroupJoined {
        /// Group
        group: GroupId,
        /// Epoch joined at
        epoch: u64,
    },
    /// An inbound frame was rejected and dropped
    MessageDropped {
        /// Link the frame arrived on
        peer: PeerId,
        /// Error category
        kind: ErrorKind,
        /// Error text
        reason: String,
    },
}

/// Stores the orchestrator writes to directly
pub struct MessagingStores {
    /// Our prekey material
    pub prekeys: Arc<dyn PreKeyStore>,
    /// Group sessions
    pub groups: Arc<dyn GroupSessionStore>,
    /// Message history
    pub messages: Arc<dyn MessageStore>,
}

struct Inner {
    profile: Arc<UserProfile>,
    manager: TransportManager,
    sessions: Arc<SessionService>,
    prekeys: PrekeyManager,
    groups: Arc<dyn GroupSessionStore>,
    messages: Arc<dyn MessageStore>,
    contacts: ContactDirectory,
    storage_key: SymmetricKey,
    config: CryptoConfig,
    bundle_timeout: Duration,
    /// Serializes bootstrap per peer and state changes per group
    locks: KeyedLocks<String>,
    pending_bundles: Mutex<HashMap<Uuid, (PeerId, oneshot::Sender<PreKeyBundle>)>>,
    /// Sender keys that failed to reach a member, by epoch
    pending_distributions: Mutex<HashMap<(GroupId, PeerId), u64>>,
    issued_prekeys: Mutex<BoundedCache<u32, ()>>,
    events: mpsc::Sender<MessagingEvent>,
}

/// Messaging orchestrator; cheap to clone
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<Inner>,
}

fn storage_key(profile: &UserProfile) -> Result<SymmetricKey> {
    let mut secret = profile.export_private_key();
    let key = hkdf_expand::<KEY_SIZE>(None, &secret, STORAGE_KEY_INFO);
    secret.zeroize();
    Ok(SymmetricKey::from_bytes(key?))
}

/// Outbound status order; `Failed` sits outside it
fn rank(status: MessageStatus) -> Option<u8> {
    match status {
        MessageStatus::Sending => Some(0),
        MessageStatus::Sent => Some(1),
        MessageStatus::Delivered => Some(2),
        MessageStatus::Read => Some(3),
        MessageStatus::Failed => None,
    }
}

fn invalid(reason: impl Into<String>) -> MessengerError {
    ProtocolError::InvalidMessage {
        reason: reason.into(),
    }
    .into()
}

impl MessagingService {
    /// Create the orchestrator
    ///
    /// # Arguments
    ///
    /// * `profile` - Local identity
    /// * `manager` - Transport manager used for every frame
    /// * `sessions` - Pairwise session service over the same prekey store
    /// * `stores` - Prekey, group and message stores
    /// * `config` - Prekey pool and group tunables
    ///
    /// Returns the service and its event receiver. Call [`Self::start`] with
    /// the manager's event receiver to begin processing inbound frames.
    pub fn new(
        profile: Arc<UserProfile>,
        manager: TransportManager,
        sessions: Arc<SessionService>,
        stores: MessagingStores,
        config: &CryptoConfig,
    ) -> Result<(Self, mpsc::Receiver<MessagingEvent>)> {
        let (events, receiver) = mpsc::channel(EVENT_QUEUE);
        let inner = Inner {
            storage_key: storage_key(&profile)?,
            profile,
            manager,
            sessions,
            prekeys: PrekeyManager::new(stores.prekeys),
            groups: stores.groups,
            messages: stores.messages,
            contacts: ContactDirectory::new(),
            config: config.clone(),
            bundle_timeout: BUNDLE_REQUEST_TIMEOUT,
            locks: KeyedLocks::new(),
            pending_bundles: Mutex::new(HashMap::new()),
            pending_distributions: Mutex::new(HashMap::new()),
            issued_prekeys: Mutex::new(BoundedCache::new(ISSUED_PREKEY_CAP)),
            events,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        ))
    }

    /// Override how long a bundle request waits for its answer.
    ///
    /// Must be called before the service is cloned or started.
    pub fn with_bundle_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.bundle_timeout = timeout;
        }
        self
    }

    /// Local identity
    pub fn profile(&self) -> &UserProfile {
        &self.inner.profile
    }

    /// Local peer id
    pub fn local_peer(&self) -> &PeerId {
        &self.inner.profile.peer
    }

    /// Transport manager
    pub fn manager(&self) -> &TransportManager {
        &self.inner.manager
    }

    /// Contacts directory
    pub fn contacts(&self) -> &ContactDirectory {
        &self.inner.contacts
    }

    /// Spawn the dispatch loop over the manager's events
    pub fn start(&self, manager_events: mpsc::Receiver<ManagerEvent>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(manager_events))
    }

    /// Handlers never wait on the network here: replies to a peer go out on
    /// their own task.
    async fn run(self, mut manager_events: mpsc::Receiver<ManagerEvent>) {
        while let Some(event) = manager_events.recv().await {
            self.handle_manager_event(event).await;
        }
        log::debug!("Messaging dispatch loop stopped");
    }

    async fn emit(&self, event: MessagingEvent) {
        if self.inner.events.send(event).await.is_err() {
            log::debug!("Messaging event dropped: receiver closed");
        }
    }

    async fn lock(&self, key: String) -> KeyedGuard<'_, String> {
        self.inner.locks.lock(key).await
    }

    async fn handle_manager_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::PeerDiscovered(discovered) => {
                self.emit(MessagingEvent::PeerDiscovered {
                    peer: discovered.peer,
                })
                .await;
            }
            ManagerEvent::PeerConnected { peer, kind } => {
                if self.has_pending_distribution(&peer) {
                    let service = self.clone();
                    let target = peer.clone();
                    tokio::spawn(async move {
                        service.retry_distributions(Some(&target)).await;
                    });
                }
                self.emit(MessagingEvent::PeerConnected { peer, kind }).await;
            }
            ManagerEvent::PeerDisconnected { peer } => {
                self.emit(MessagingEvent::PeerDisconnected { peer }).await;
            }
            ManagerEvent::MessageReceived {
                peer,
                protocol_id,
                payload,
            } => {
                if protocol_id != MESSAGING_PROTOCOL {
                    log::debug!("Ignoring frame for protocol {} from {}", protocol_id, peer);
                    return;
                }
                if let Err(e) = self.handle_frame(&peer, &payload).await {
                    log::warn!("Dropping frame from {}: {}", peer, e);
                    self.emit(MessagingEvent::MessageDropped {
                        peer,
                        kind: e.kind(),
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    async fn handle_frame(&self, peer: &PeerId, bytes: &[u8]) -> Result<()> {
        let envelope = Envelope::from_bytes(bytes)?;
        envelope.validate(peer, self.local_peer())?;
        log::debug!("Received {} envelope from {}", envelope.kind_name(), peer);

        match envelope.payload {
            Payload::Session(message) => {
                let plaintext = self.inner.sessions.decrypt(peer, &message).await?;
                self.pin_session_identity(peer).await;
                let content = Content::from_bytes(&plaintext)?;
                self.handle_content(peer, content).await
            }
            Payload::Group(message) => self.handle_group_message(peer, message).await,
            Payload::BundleRequest { request } => {
                let bundle = self.bundle_for_request();
                let service = self.clone();
                let target = peer.clone();
                tokio::spawn(async move {
                    let response = Payload::BundleResponse { request, bundle };
                    if let Err(e) = service.send_envelope(&target, response).await {
                        log::warn!("Bundle response to {} failed: {}", target, e);
                    }
                });
                Ok(())
            }
            Payload::BundleResponse { request, bundle } => {
                self.complete_bundle_request(peer, request, bundle)
            }
        }
    }

    async fn handle_content(&self, peer: &PeerId, content: Content) -> Result<()> {
        match content {
            Content::Text {
                message_id,
                conversation,
                text,
                sent_at,
            } => {
                self.accept_text(peer, message_id, conversation, text, sent_at, None)
                    .await?;
                // duplicates are acknowledged again; the first receipt may be lost
                let service = self.clone();
                let target = peer.clone();
                tokio::spawn(async move {
                    if let Err(e) = service
                        .send_receipt(&target, message_id, ReceiptStatus::Delivered)
                        .await
                    {
                        log::warn!("Delivery receipt to {} failed: {}", target, e);
                    }
                });
                Ok(())
            }
            Content::Receipt { message_id, status } => {
                self.apply_receipt(peer, message_id, status).await
            }
            Content::SenderKey(distribution) => self.accept_distribution(peer, distribution).await,
        }
    }

    async fn pin_session_identity(&self, peer: &PeerId) {
        if let Some(key) = self.inner.sessions.remote_identity(peer) {
            if self.inner.contacts.pin_identity(peer, key) == KeyChange::Changed {
                self.emit(MessagingEvent::IdentityChanged { peer: peer.clone() })
                    .await;
            }
        }
    }

    /// Store an inbound text. Returns false for a duplicate.
    async fn accept_text(
        &self,
        peer: &PeerId,
        id: MessageId,
        conversation: String,
        text: String,
        sent_at: DateTime<Utc>,
        group: Option<GroupId>,
    ) -> Result<bool> {
        if let Some(existing) = self.inner.messages.get(&id) {
            if existing.direction == Direction::Inbound && &existing.peer == peer {
                log::debug!("Duplicate message {} from {}", id, peer);
                return Ok(false);
            }
            return Err(invalid(format!("message id {id} already in use")));
        }

        let stored = StoredMessage::seal(
            &self.inner.storage_key,
            id,
            conversation.clone(),
            peer.clone(),
            Direction::Inbound,
            sent_at,
            MessageStatus::Delivered,
            &text,
        )?;
        self.inner.messages.put(stored);
        log::info!("Message {} from {}", id, peer);

        self.emit(MessagingEvent::MessageReceived {
            id,
            conversation,
            peer: peer.clone(),
            text,
            group,
        })
        .await;
        Ok(true)
    }

    async fn apply_receipt(&self, peer: &PeerId, id: MessageId, status: ReceiptStatus) -> Result<()> {
        let Some(message) = self.inner.messages.get(&id) else {
            log::debug!("Receipt from {} for unknown message {}", peer, id);
            return Ok(());
        };
        if message.direction != Direction::Outbound || &message.peer != peer {
            return Err(invalid(format!("receipt for message {id} not sent to {peer}")));
        }
        self.advance(&id, status.message_status()).await
    }

    /// Move an outbound message forward, never backwards
    async fn advance(&self, id: &MessageId, target: MessageStatus) -> Result<()> {
        let Some(current) = self.inner.messages.get(id) else {
            return Ok(());
        };
        let forward = matches!(
            (rank(current.status), rank(target)),
            (Some(from), Some(to)) if from < to
        );
        if !forward {
            log::debug!("Message {} stays {} (got {})", id, current.status, target);
            return Ok(());
        }

        let mut steps = Vec::with_capacity(2);
        if current.status == MessageStatus::Sending && target != MessageStatus::Sent {
            steps.push(MessageStatus::Sent);
        }
        steps.push(target);

        for step in steps {
            match self.inner.messages.update_status(id, step) {
                Ok(_) => {
                    self.emit(MessagingEvent::StatusChanged {
                        id: *id,
                        status: step,
                    })
                    .await;
                }
                // a concurrent receipt got there first
                Err(MessengerError::Store(StoreError::InvalidTransition { .. })) => {
                    log::debug!("Message {} already past {}", id, step);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn fail(&self, id: &MessageId, error: &MessengerError) {
        log::warn!("Message {} failed: {}", id, error);
        match self.inner.messages.update_status(id, MessageStatus::Failed) {
            Ok(_) => {
                self.emit(MessagingEvent::StatusChanged {
                    id: *id,
                    status: MessageStatus::Failed,
                })
                .await;
            }
            Err(e) => log::debug!("Message {} not marked failed: {}", id, e),
        }
        self.emit(MessagingEvent::DeliveryFailed {
            id: *id,
            kind: error.kind(),
            reason: error.to_string(),
        })
        .await;
    }

    async fn send_envelope(&self, peer: &PeerId, payload: Payload) -> Result<()> {
        let bytes = Envelope::new(self.local_peer().clone(), peer.clone(), payload).to_bytes()?;
        self.inner.manager.send(peer, MESSAGING_PROTOCOL, bytes).await
    }

    async fn send_content(&self, peer: &PeerId, content: &Content) -> Result<()> {
        let plaintext = content.to_bytes()?;
        let message = self.inner.sessions.encrypt(peer, &plaintext).await?;
        self.send_envelope(peer, Payload::Session(message)).await
    }

    async fn send_receipt(&self, peer: &PeerId, id: MessageId, status: ReceiptStatus) -> Result<()> {
        self.send_content(
            peer,
            &Content::Receipt {
                message_id: id,
                status,
            },
        )
        .await
    }

    // ---- bundles ----

    /// Our bundle as a base64 string for QR code or clipboard transfer
    pub fn export_bundle(&self) -> Result<String> {
        self.inner
            .prekeys
            .published_bundle(&self.inner.profile, self.inner.config.prekey_count)
            .to_transfer_string()
    }

    /// Start a session from a transferred bundle.
    ///
    /// The signature is verified before any key in the bundle is used. The
    /// bundle owner is added to the contacts with its identity key pinned.
    pub async fn import_bundle(&self, encoded: &str) -> Result<PeerId> {
        let bundle = PreKeyBundle::from_transfer_string(encoded)?;
        self.inner.contacts.add(bundle.peer.clone());
        self.start_session(bundle).await
    }

    async fn start_session(&self, bundle: PreKeyBundle) -> Result<PeerId> {
        bundle.verify()?;
        let peer = bundle.peer.clone();
        if self.inner.contacts.pin_identity(&peer, bundle.identity_key) == KeyChange::Changed {
            self.emit(MessagingEvent::IdentityChanged { peer: peer.clone() })
                .await;
        }
        self.inner.sessions.initiate(bundle).await?;
        Ok(peer)
    }

    /// Fetch a fresh bundle from a connected or reachable peer
    ///
    /// # Errors
    ///
    /// * `NetworkError::Unreachable` - the request could not be sent
    /// * `NetworkError::Timeout` - no answer in time
    pub async fn request_bundle(&self, peer: &PeerId) -> Result<PreKeyBundle> {
        let request = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending_bundles
            .lock()
            .insert(request, (peer.clone(), tx));

        if let Err(e) = self
            .send_envelope(peer, Payload::BundleRequest { request })
            .await
        {
            self.inner.pending_bundles.lock().remove(&request);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.bundle_timeout, rx).await {
            Ok(Ok(bundle)) => {
                bundle.verify()?;
                if &bundle.peer != peer {
                    return Err(invalid(format!("bundle for {} answered by {}", bundle.peer, peer)));
                }
                Ok(bundle)
            }
            _ => {
                self.inner.pending_bundles.lock().remove(&request);
                Err(NetworkError::Timeout {
                    operation: format!("bundle request to {peer}"),
                }
                .into())
            }
        }
    }

    fn complete_bundle_request(&self, peer: &PeerId, request: Uuid, bundle: PreKeyBundle) -> Result<()> {
        let mut pending = self.inner.pending_bundles.lock();
        match pending.remove(&request) {
            Some((expected, tx)) if &expected == peer => {
                if tx.send(bundle).is_err() {
                    log::debug!("Bundle from {} arrived after its request gave up", peer);
                }
                Ok(())
            }
            Some(entry) => {
                pending.insert(request, entry);
                Err(invalid(format!("bundle response from unexpected peer {peer}")))
            }
            None => {
                log::debug!("Unsolicited bundle from {}", peer);
                Ok(())
            }
        }
    }

    /// Bundle with a single one-time prekey no other requester was given
    fn bundle_for_request(&self) -> PreKeyBundle {
        let inner = &self.inner;
        let mut bundle = inner
            .prekeys
            .published_bundle(&inner.profile, inner.config.prekey_count);

        let mut issued = inner.issued_prekeys.lock();
        let fresh = bundle
            .one_time_prekeys
            .iter()
            .find(|prekey| !issued.contains(&prekey.id))
            .cloned()
            .or_else(|| inner.prekeys.generate_one_time_prekeys(1).into_iter().next());
        if let Some(prekey) = &fresh {
            issued.insert(prekey.id, ());
        }
        bundle.one_time_prekeys = fresh.into_iter().collect();
        bundle
    }

    /// Make sure a pairwise session exists, fetching a bundle if needed
    async fn ensure_session(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.lock(format!("peer:{peer}")).await;
        if self.inner.sessions.status(peer) != SessionStatus::NoSession {
            return Ok(());
        }
        log::info!("No session with {}, requesting bundle", peer);
        let bundle = self.request_bundle(peer).await?;
        self.start_session(bundle).await?;
        Ok(())
    }

    // ---- direct messages ----

    /// Send a text message to a peer.
    ///
    /// The message is stored as `Sending` before anything else happens and
    /// its id is returned even when delivery fails; failures move it to
    /// `Failed` and are reported through [`MessagingEvent::DeliveryFailed`].
    ///
    /// # Arguments
    ///
    /// * `conversation_id` - Conversation the message belongs to
    /// * `peer_address` - Recipient wallet address
    /// * `chain_type` - Chain of the wallet address
    /// * `text` - Message body
    pub async fn send_message(
        &self,
        conversation_id: &str,
        peer_address: &str,
        chain_type: ChainType,
        text: &str,
    ) -> Result<MessageId> {
        let peer = self
            .inner
            .contacts
            .lookup(peer_address, chain_type)
            .map(|contact| contact.peer)
            .unwrap_or_else(|| PeerId::new(peer_address, chain_type, ""));
        if &peer == self.local_peer() {
            return Err(invalid("cannot message ourselves"));
        }

        let id = self
            .store_outbound(conversation_id, peer, text)
            .await?;
        self.deliver(&id).await?;
        Ok(id)
    }

    async fn store_outbound(&self, conversation: &str, peer: PeerId, text: &str) -> Result<MessageId> {
        let id = Uuid::new_v4();
        let stored = StoredMessage::seal(
            &self.inner.storage_key,
            id,
            conversation,
            peer,
            Direction::Outbound,
            Utc::now(),
            MessageStatus::Sending,
            text,
        )?;
        self.inner.messages.put(stored);
        self.emit(MessagingEvent::StatusChanged {
            id,
            status: MessageStatus::Sending,
        })
        .await;
        Ok(id)
    }

    /// Deliver a stored `Sending` message; returns its resulting status
    async fn deliver(&self, id: &MessageId) -> Result<MessageStatus> {
        let message = self.inner.messages.get(id).ok_or_else(|| StoreError::NotFound {
            key: id.to_string(),
        })?;
        let text = message.open(&self.inner.storage_key)?;

        let attempt = if &message.peer == self.local_peer() {
            self.deliver_group(&message, text).await
        } else {
            self.deliver_direct(&message, text).await
        };

        match attempt {
            Ok(()) => {
                self.advance(id, MessageStatus::Sent).await?;
            }
            Err(e) => self.fail(id, &e).await,
        }
        Ok(self
            .inner
            .messages
            .get(id)
            .map_or(MessageStatus::Failed, |message| message.status))
    }

    async fn deliver_direct(&self, message: &StoredMessage, text: String) -> Result<()> {
        self.ensure_session(&message.peer).await?;
        self.send_content(
            &message.peer,
            &Content::Text {
                message_id: message.id,
                conversation: message.conversation.clone(),
                text,
                sent_at: message.timestamp,
            },
        )
        .await
    }

    /// Retry a `Failed` outbound message
    ///
    /// # Errors
    ///
    /// * `StoreError::NotFound` - unknown message
    /// * `StoreError::InvalidTransition` - the message is not `Failed`
    pub async fn retry_message(&self, id: &MessageId) -> Result<MessageStatus> {
        let message = self.inner.messages.get(id).ok_or_else(|| StoreError::NotFound {
            key: id.to_string(),
        })?;
        if message.direction != Direction::Outbound {
            return Err(invalid(format!("message {id} is inbound")));
        }
        self.inner.messages.update_status(id, MessageStatus::Sending)?;
        log::info!("Retrying message {}", id);
        self.emit(MessagingEvent::StatusChanged {
            id: *id,
            status: MessageStatus::Sending,
        })
        .await;
        self.deliver(id).await
    }

    /// Mark an inbound message read and tell the sender.
    ///
    /// The local status changes even if the receipt cannot be sent; the
    /// send error is still returned. Marking twice is a no-op.
    pub async fn mark_read(&self, id: &MessageId) -> Result<()> {
        let message = self.inner.messages.get(id).ok_or_else(|| StoreError::NotFound {
            key: id.to_string(),
        })?;
        if message.direction != Direction::Inbound {
            return Err(invalid(format!("message {id} is outbound")));
        }
        if message.status == MessageStatus::Read {
            return Ok(());
        }

        self.inner.messages.update_status(id, MessageStatus::Read)?;
        self.emit(MessagingEvent::StatusChanged {
            id: *id,
            status: MessageStatus::Read,
        })
        .await;

        if self.is_group_conversation(&message.conversation) {
            return Ok(());
        }
        self.send_receipt(&message.peer, *id, ReceiptStatus::Read).await
    }

    /// A stored message
    pub fn message(&self, id: &MessageId) -> Option<StoredMessage> {
        self.inner.messages.get(id)
    }

    /// A conversation with decrypted bodies, oldest first
    pub fn conversation(&self, conversation_id: &str) -> Result<Vec<(StoredMessage, String)>> {
        self.inner
            .messages
            .conversation(conversation_id)
            .into_iter()
            .map(|message| {
                let body = message.open(&self.inner.storage_key)?;
                Ok((message, body))
            })
            .collect()
    }

    // ---- groups ----

    fn is_group_conversation(&self, conversation: &str) -> bool {
        self.inner.groups.get(&GroupId::new(conversation)).is_some()
    }

    /// Snapshot of a group session
    pub fn group(&self, group: &GroupId) -> Option<GroupSession> {
        self.inner.groups.get(group)
    }

    /// Create a group and distribute our sender key to the members
    pub async fn create_group(&self, members: Vec<PeerId>) -> Result<GroupId> {
        let group = GroupId::random();
        let (distribution, recipients) = {
            let _guard = self.lock(format!("group:{group}")).await;
            let session = GroupSession::create(
                group.clone(),
                self.local_peer().clone(),
                members,
                self.inner.config.retained_epochs,
                self.inner.config.max_skip,
            );
            let out = (session.distribution(), session.recipients());
            self.inner.groups.put(session);
            out
        };
        self.distribute(&distribution, recipients).await;
        Ok(group)
    }

    /// Add a member; starts a new epoch and distributes our new key
    pub async fn add_member(&self, group: &GroupId, peer: PeerId) -> Result<u64> {
        let (epoch, distribution, recipients) = {
            let _guard = self.lock(format!("group:{group}")).await;
            let mut session = self.load_group(group)?;
            let epoch = session.add_member(peer);
            let out = (epoch, session.distribution(), session.recipients());
            self.inner.groups.put(session);
            out
        };
        self.distribute(&distribution, recipients).await;
        Ok(epoch)
    }

    /// Remove a member; the new epoch's keys only go to those remaining
    pub async fn remove_member(&self, group: &GroupId, peer: &PeerId) -> Result<u64> {
        let (epoch, distribution, recipients) = {
            let _guard = self.lock(format!("group:{group}")).await;
            let mut session = self.load_group(group)?;
            let epoch = session.remove_member(peer)?;
            let out = (epoch, session.distribution(), session.recipients());
            self.inner.groups.put(session);
            out
        };
        self.inner
            .pending_distributions
            .lock()
            .retain(|(pending_group, member), _| !(pending_group == group && member == peer));
        self.distribute(&distribution, recipients).await;
        Ok(epoch)
    }

    /// Send a text to a group
    pub async fn send_group_message(&self, group: &GroupId, text: &str) -> Result<MessageId> {
        if !self.is_group_conversation(group.as_str()) {
            return Err(GroupError::UnknownGroup {
                group: group.to_string(),
            }
            .into());
        }
        let id = self
            .store_outbound(group.as_str(), self.local_peer().clone(), text)
            .await?;
        self.deliver(&id).await?;
        Ok(id)
    }

    fn load_group(&self, group: &GroupId) -> Result<GroupSession> {
        self.inner.groups.get(group).ok_or_else(|| {
            GroupError::UnknownGroup {
                group: group.to_string(),
            }
            .into()
        })
    }

    /// Encrypt once under the group key, then fan out the same ciphertext.
    ///
    /// Succeeds if at least one member received it.
    async fn deliver_group(&self, message: &StoredMessage, text: String) -> Result<()> {
        let group = GroupId::new(message.conversation.as_str());
        let (ciphertext, recipients) = {
            let _guard = self.lock(format!("group:{group}")).await;
            let mut session = self.load_group(&group)?;
            let content = Content::Text {
                message_id: message.id,
                conversation: message.conversation.clone(),
                text,
                sent_at: message.timestamp,
            };
            let ciphertext = session.encrypt(&content.to_bytes()?)?;
            let recipients = session.recipients();
            self.inner.groups.put(session);
            (ciphertext, recipients)
        };
        if recipients.is_empty() {
            return Ok(());
        }

        let results = join_all(
            recipients
                .iter()
                .map(|peer| self.send_envelope(peer, Payload::Group(ciphertext.clone()))),
        )
        .await;

        let mut last_error = None;
        let mut delivered = 0;
        for (peer, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Group message to {} failed: {}", peer, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn handle_group_message(&self, peer: &PeerId, message: GroupMessage) -> Result<()> {
        if &message.sender != peer {
            return Err(invalid(format!(
                "group message by {} relayed by {}",
                message.sender, peer
            )));
        }
        let group = message.group.clone();
        let plaintext = {
            let _guard = self.lock(format!("group:{group}")).await;
            let mut session = self.load_group(&group)?;
            let plaintext = session.decrypt(&message)?;
            self.inner.groups.put(session);
            plaintext
        };

        match Content::from_bytes(&plaintext)? {
            Content::Text {
                message_id,
                conversation,
                text,
                sent_at,
            } if conversation == group.as_str() => {
                self.accept_text(peer, message_id, conversation, text, sent_at, Some(group))
                    .await?;
                Ok(())
            }
            _ => Err(invalid(format!("unexpected content in group {group}"))),
        }
    }

    async fn accept_distribution(&self, peer: &PeerId, distribution: SenderKeyDistribution) -> Result<()> {
        if &distribution.sender != peer {
            return Err(invalid(format!(
                "sender key of {} relayed by {}",
                distribution.sender, peer
            )));
        }
        let group = distribution.group.clone();
        let guard = self.lock(format!("group:{group}")).await;

        let (ours, joined) = match self.inner.groups.get(&group) {
            Some(mut session) => {
                let advanced = session.process_distribution(&distribution)?;
                let ours = advanced.then(|| (session.distribution(), session.recipients()));
                self.inner.groups.put(session);
                (ours, None)
            }
            None => {
                let session = GroupSession::join(
                    self.local_peer().clone(),
                    &distribution,
                    self.inner.config.retained_epochs,
                    self.inner.config.max_skip,
                )?;
                let ours = Some((session.distribution(), session.recipients()));
                let epoch = session.epoch();
                self.inner.groups.put(session);
                (ours, Some(epoch))
            }
        };
        drop(guard);
        log::debug!("Sender key of {} for {} accepted", peer, group);

        if let Some(epoch) = joined {
            self.emit(MessagingEvent::GroupJoined {
                group: group.clone(),
                epoch,
            })
            .await;
        }
        // runs off the dispatch loop: it may need bundles answered by it
        if let Some((distribution, recipients)) = ours {
            let service = self.clone();
            tokio::spawn(async move {
                service.distribute(&distribution, recipients).await;
            });
        }
        Ok(())
    }

    async fn send_distribution(&self, peer: &PeerId, distribution: &SenderKeyDistribution) -> Result<()> {
        self.ensure_session(peer).await?;
        self.send_content(peer, &Content::SenderKey(distribution.clone()))
            .await
    }

    /// Send our sender key to every recipient independently. A failure is
    /// remembered for retry and does not affect the others.
    async fn distribute(&self, distribution: &SenderKeyDistribution, recipients: Vec<PeerId>) -> usize {
        let results = join_all(
            recipients
                .iter()
                .map(|peer| self.send_distribution(peer, distribution)),
        )
        .await;

        let mut delivered = 0;
        let mut pending = self.inner.pending_distributions.lock();
        for (peer, result) in recipients.into_iter().zip(results) {
            let key = (distribution.group.clone(), peer);
            match result {
                Ok(()) => {
                    pending.remove(&key);
                    delivered += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Sender key for {} epoch {} to {} failed: {}",
                        distribution.group,
                        distribution.epoch,
                        key.1,
                        e
                    );
                    pending.insert(key, distribution.epoch);
                }
            }
        }
        delivered
    }

    fn has_pending_distribution(&self, peer: &PeerId) -> bool {
        self.inner
            .pending_distributions
            .lock()
            .keys()
            .any(|(_, member)| member == peer)
    }

    /// Members whose sender key delivery failed, by group
    pub fn pending_distributions(&self) -> Vec<(GroupId, PeerId)> {
        let mut pending: Vec<(GroupId, PeerId)> = self
            .inner
            .pending_distributions
            .lock()
            .keys()
            .cloned()
            .collect();
        pending.sort();
        pending
    }

    /// Resend our current sender key to every member it failed to reach.
    ///
    /// Returns how many deliveries succeeded this time.
    pub async fn retry_pending_distributions(&self) -> usize {
        self.retry_distributions(None).await
    }

    async fn retry_distributions(&self, only: Option<&PeerId>) -> usize {
        let pending: Vec<(GroupId, PeerId)> = self
            .inner
            .pending_distributions
            .lock()
            .keys()
            .filter(|(_, member)| only.map_or(true, |peer| peer == member))
            .cloned()
            .collect();

        let mut delivered = 0;
        for (group, peer) in pending {
            let distribution = match self.inner.groups.get(&group) {
                Some(session) if session.is_member(&peer) => session.distribution(),
                _ => {
                    self.inner
                        .pending_distributions
                        .lock()
                        .remove(&(group, peer));
                    continue;
                }
            };
            delivered += self.distribute(&distribution, vec![peer]).await;
        }
        if delivered > 0 {
            log::info!("Redistributed {} sender keys", delivered);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionService;
    use crate::store::{MemoryGroupSessionStore, MemoryMessageStore, MemoryPreKeyStore, MemorySessionStore};
    use crate::identity::{Address, PeerStore};
    use crate::transport::socket::SocketTransport;
    use crate::utils::{NetworkConfig, SocketConfig};

    struct Node {
        service: MessagingService,
        events: mpsc::Receiver<MessagingEvent>,
        _dispatch: JoinHandle<()>,
    }

    async fn node(name: &str) -> Node {
        let (service, events, manager_events) = parts(name, 2_000).await;
        let dispatch = service.start(manager_events);
        Node {
            service,
            events,
            _dispatch: dispatch,
        }
    }

    /// A service that has not been started yet
    async fn parts(
        name: &str,
        dial_timeout_ms: u64,
    ) -> (MessagingService, mpsc::Receiver<MessagingEvent>, mpsc::Receiver<ManagerEvent>) {
        let peer = PeerId::new(format!("0x{name}"), ChainType::Ethereum, name);
        let profile = Arc::new(UserProfile::new(peer.clone()));
        let network = NetworkConfig {
            transports: Vec::new(),
            dial_timeout_ms,
            dial_attempts: 1,
            backoff_base_ms: 10,
            backoff_max_ms: 20,
            ..NetworkConfig::default()
        };
        let (manager, manager_events) = TransportManager::new(peer.clone(), network, Arc::new(PeerStore::new()));
        let socket = SocketTransport::new(
            SocketConfig {
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                enable_multicast: false,
                ..SocketConfig::default()
            },
            peer,
            crate::MAX_MESSAGE_SIZE,
        );
        manager.register(Arc::new(socket)).await.unwrap();
        manager.start().await.unwrap();

        let crypto = CryptoConfig {
            prekey_count: 5,
            ..CryptoConfig::default()
        };
        let prekeys: Arc<dyn PreKeyStore> = Arc::new(MemoryPreKeyStore::new());
        let sessions = Arc::new(SessionService::new(
            profile.clone(),
            prekeys.clone(),
            Arc::new(MemorySessionStore::new()),
            &crypto,
        ));
        let stores = MessagingStores {
            prekeys,
            groups: Arc::new(MemoryGroupSessionStore::new()),
            messages: Arc::new(MemoryMessageStore::new()),
        };
        let (service, events) =
            MessagingService::new(profile, manager, sessions, stores, &crypto).unwrap();
        let service = service.with_bundle_timeout(Duration::from_secs(5));
        (service, events, manager_events)
    }

    fn introduce(from: &Node, to: &Node) {
        from.service.manager().add_address(
            to.service.local_peer(),
            to.service.manager().local_addresses().remove(0),
        );
    }

    async fn next_event<F, T>(events: &mut mpsc::Receiver<MessagingEvent>, mut pick: F) -> T
    where
        F: FnMut(MessagingEvent) -> Option<T>,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if let Some(found) = pick(event) {
                    return found;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn next_text(events: &mut mpsc::Receiver<MessagingEvent>) -> (MessageId, PeerId, String, Option<GroupId>) {
        next_event(events, |event| match event {
            MessagingEvent::MessageReceived {
                id,
                peer,
                text,
                group,
                ..
            } => Some((id, peer, text, group)),
            _ => None,
        })
        .await
    }

    async fn wait_status(events: &mut mpsc::Receiver<MessagingEvent>, target: MessageId, wanted: MessageStatus) {
        next_event(events, |event| match event {
            MessagingEvent::StatusChanged { id, status } if id == target && status == wanted => Some(()),
            _ => None,
        })
        .await;
    }

    #[tokio::test]
    async fn test_imported_bundle_message_and_receipts() {
        let mut alice = node("a11ce").await;
        let mut bob = node("b0b").await;
        introduce(&alice, &bob);

        let bundle = bob.service.export_bundle().unwrap();
        let bob_peer = alice.service.import_bundle(&bundle).await.unwrap();
        assert_eq!(&bob_peer, bob.service.local_peer());
        assert!(alice.service.contacts().get(&bob_peer).is_some());

        let id = alice
            .service
            .send_message("chat-1", "0xB0B", ChainType::Ethereum, "hello")
            .await
            .unwrap();
        wait_status(&mut alice.events, id, MessageStatus::Sending).await;
        wait_status(&mut alice.events, id, MessageStatus::Sent).await;

        let (received, from, text, group) = next_text(&mut bob.events).await;
        assert_eq!(received, id);
        assert_eq!(&from, alice.service.local_peer());
        assert_eq!(text, "hello");
        assert!(group.is_none());

        wait_status(&mut alice.events, id, MessageStatus::Delivered).await;

        bob.service.mark_read(&id).await.unwrap();
        wait_status(&mut alice.events, id, MessageStatus::Read).await;
        assert_eq!(alice.service.message(&id).unwrap().status, MessageStatus::Read);

        let history = bob.service.conversation("chat-1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].1, "hello");
    }

    #[tokio::test]
    async fn test_bundle_fetched_over_the_wire() {
        let mut alice = node("a11ce").await;
        let mut bob = node("b0b").await;
        introduce(&alice, &bob);

        let id = alice
            .service
            .send_message("c", "0xb0b", ChainType::Ethereum, "first contact")
            .await
            .unwrap();
        let (_, _, text, _) = next_text(&mut bob.events).await;
        assert_eq!(text, "first contact");
        wait_status(&mut alice.events, id, MessageStatus::Delivered).await;

        // Bob answers over the session Alice started
        let reply = bob
            .service
            .send_message("c", "0xa11ce", ChainType::Ethereum, "hi")
            .await
            .unwrap();
        let (got, _, text, _) = next_text(&mut alice.events).await;
        assert_eq!((got, text.as_str()), (reply, "hi"));
        assert_eq!(bob.service.manager().stats().dial_attempts, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_then_retry_succeeds() {
        let mut alice = node("a11ce").await;
        let mut bob = node("b0b").await;

        let id = alice
            .service
            .send_message("c", "0xb0b", ChainType::Ethereum, "are you there")
            .await
            .unwrap();
        let kind = next_event(&mut alice.events, |event| match event {
            MessagingEvent::DeliveryFailed { id: failed, kind, .. } if failed == id => Some(kind),
            _ => None,
        })
        .await;
        assert_eq!(kind, ErrorKind::Unreachable);
        assert_eq!(alice.service.message(&id).unwrap().status, MessageStatus::Failed);

        introduce(&alice, &bob);
        let status = alice.service.retry_message(&id).await.unwrap();
        assert_eq!(status, MessageStatus::Sent);
        let (received, _, text, _) = next_text(&mut bob.events).await;
        assert_eq!((received, text.as_str()), (id, "are you there"));

        // only failed messages can be retried
        assert!(alice.service.retry_message(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_group_messages_and_member_removal() {
        let mut alice = node("a11ce").await;
        let mut bob = node("b0b").await;
        let mut carol = node("ca401").await;
        for (from, to) in [(&alice, &bob), (&alice, &carol), (&bob, &carol), (&carol, &bob)] {
            introduce(from, to);
        }

        let group = alice
            .service
            .create_group(vec![
                bob.service.local_peer().clone(),
                carol.service.local_peer().clone(),
            ])
            .await
            .unwrap();
        for events in [&mut bob.events, &mut carol.events] {
            let joined = next_event(events, |event| match event {
                MessagingEvent::GroupJoined { group, epoch } => Some((group, epoch)),
                _ => None,
            })
            .await;
            assert_eq!(joined, (group.clone(), 0));
        }

        let id = alice.service.send_group_message(&group, "hi all").await.unwrap();
        for events in [&mut bob.events, &mut carol.events] {
            let (received, from, text, in_group) = next_text(events).await;
            assert_eq!(received, id);
            assert_eq!(&from, alice.service.local_peer());
            assert_eq!(text, "hi all");
            assert_eq!(in_group.as_ref(), Some(&group));
        }
        assert_eq!(alice.service.message(&id).unwrap().status, MessageStatus::Sent);

        let epoch = alice
            .service
            .remove_member(&group, carol.service.local_peer())
            .await
            .unwrap();
        assert_eq!(epoch, 1);
        let session = alice.service.group(&group).unwrap();
        assert!(!session.is_member(carol.service.local_peer()));

        // wait until Bob has moved to the new epoch before sending under it
        tokio::time::timeout(Duration::from_secs(10), async {
            while bob.service.group(&group).map(|s| s.epoch()) != Some(1) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        alice.service.send_group_message(&group, "without carol").await.unwrap();
        let (_, _, text, _) = next_text(&mut bob.events).await;
        assert_eq!(text, "without carol");
        assert_eq!(carol.service.group(&group).unwrap().epoch(), 0);
    }

    #[tokio::test]
    async fn test_failed_distribution_retried_independently() {
        let alice = node("a11ce").await;
        let mut bob = node("b0b").await;
        let mut carol = node("ca401").await;
        introduce(&alice, &bob);

        let carol_peer = carol.service.local_peer().clone();
        let group = alice
            .service
            .create_group(vec![bob.service.local_peer().clone(), carol_peer.clone()])
            .await
            .unwrap();

        // Bob got his key even though Carol was unreachable
        next_event(&mut bob.events, |event| match event {
            MessagingEvent::GroupJoined { .. } => Some(()),
            _ => None,
        })
        .await;
        assert_eq!(
            alice.service.pending_distributions(),
            vec![(group.clone(), carol_peer)]
        );

        introduce(&alice, &carol);
        assert_eq!(alice.service.retry_pending_distributions().await, 1);
        assert!(alice.service.pending_distributions().is_empty());
        let joined = next_event(&mut carol.events, |event| match event {
            MessagingEvent::GroupJoined { group, .. } => Some(group),
            _ => None,
        })
        .await;
        assert_eq!(joined, group);
    }

    #[tokio::test]
    async fn test_frame_from_wrong_link_is_dropped() {
        let alice = node("a11ce").await;
        let mut bob = node("b0b").await;
        introduce(&alice, &bob);

        // claims to come from someone else
        let mallory = PeerId::new("0x3a11", ChainType::Ethereum, "mallory");
        let forged = Envelope::new(
            mallory,
            bob.service.local_peer().clone(),
            Payload::BundleRequest {
                request: Uuid::new_v4(),
            },
        );
        alice
            .service
            .manager()
            .send(bob.service.local_peer(), MESSAGING_PROTOCOL, forged.to_bytes().unwrap())
            .await
            .unwrap();

        let (peer, kind) = next_event(&mut bob.events, |event| match event {
            MessagingEvent::MessageDropped { peer, kind, .. } => Some((peer, kind)),
            _ => None,
        })
        .await;
        assert_eq!(&peer, alice.service.local_peer());
        assert_eq!(kind, ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_hanging_reply_does_not_stall_other_peers() {
        let (bob, mut bob_events, mut from_manager) = parts("b0b", 10_000).await;
        let (inject, dispatch_events) = mpsc::channel(16);
        let _dispatch = bob.start(dispatch_events);
        let forward = inject.clone();
        tokio::spawn(async move {
            while let Some(event) = from_manager.recv().await {
                if forward.send(event).await.is_err() {
                    break;
                }
            }
        });

        // accepts TCP but never answers the hello, so replies to ghost hang
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ghost = PeerId::new("0x6405", ChainType::Ethereum, "ghost");
        bob.manager().add_address(
            &ghost,
            Address::Socket {
                host: "127.0.0.1".to_string(),
                port: silent.local_addr().unwrap().port(),
            },
        );
        let request = Envelope::new(
            ghost.clone(),
            bob.local_peer().clone(),
            Payload::BundleRequest {
                request: Uuid::new_v4(),
            },
        );
        inject
            .send(ManagerEvent::MessageReceived {
                peer: ghost,
                protocol_id: MESSAGING_PROTOCOL.to_string(),
                payload: request.to_bytes().unwrap(),
            })
            .await
            .unwrap();

        let carol = node("ca401").await;
        carol
            .service
            .manager()
            .add_address(bob.local_peer(), bob.manager().local_addresses().remove(0));
        carol
            .service
            .import_bundle(&bob.export_bundle().unwrap())
            .await
            .unwrap();
        let id = carol
            .service
            .send_message("carol-bob", "0xb0b", ChainType::Ethereum, "still here")
            .await
            .unwrap();

        let (received, from, text, _) =
            tokio::time::timeout(Duration::from_secs(5), next_text(&mut bob_events))
                .await
                .expect("dispatch stalled behind the reply to ghost");
        assert_eq!(received, id);
        assert_eq!(&from, carol.service.local_peer());
        assert_eq!(text, "still here");
    }
}
