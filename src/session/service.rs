//! Per-peer session service.
//!
//! Owns the handshake state machine
//! (`NoSession -> HandshakeInitiated -> Established`) and serializes every
//! ratchet mutation for a given peer behind that peer's lock. Sessions of
//! different peers proceed in parallel.

use super::ratchet::{RatchetLimits, RatchetMessage, SessionState};
use super::x3dh::{PreKeyHeader, X3DHInitiator, X3DHRecipient};
use crate::crypto::{IdentityPublicKey, PreKeyBundle, UserProfile};
use crate::identity::PeerId;
use crate::store::{PreKeyStore, SessionStore};
use crate::utils::{CryptoConfig, ErrorKind, KeyedGuard, KeyedLocks, MessengerError, Result, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Handshake state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// No usable session
    NoSession,
    /// We sent a prekey message and await the first reply
    HandshakeInitiated,
    /// Both sides hold the ratchet
    Established,
}

/// First messages of a session: handshake header plus ratchet payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMessage {
    /// X3DH fields
    pub header: PreKeyHeader,
    /// Ratchet-encrypted payload
    pub message: RatchetMessage,
}

/// Output of [`SessionService::encrypt`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Sent until the peer answers
    PreKey(PreKeyMessage),
    /// Regular ratchet message
    Ratchet(RatchetMessage),
}

#[derive(Debug, Clone)]
struct PendingHandshake {
    header: PreKeyHeader,
    /// Remaining bundle material for retries with a new ephemeral key
    bundle: PreKeyBundle,
    started_at: DateTime<Utc>,
    attempts: u32,
}

/// Everything stored for one peer
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    active: Option<SessionState>,
    pending: Option<PendingHandshake>,
    /// Superseded sessions kept read-only for in-flight messages, newest first
    previous: VecDeque<SessionState>,
}

impl SessionRecord {
    /// Handshake state
    pub fn status(&self) -> SessionStatus {
        match (&self.active, &self.pending) {
            (None, _) => SessionStatus::NoSession,
            (Some(_), Some(_)) => SessionStatus::HandshakeInitiated,
            (Some(_), None) => SessionStatus::Established,
        }
    }

    /// Active session, if any
    pub fn active(&self) -> Option<&SessionState> {
        self.active.as_ref()
    }

    /// Number of retained read-only sessions
    pub fn previous_count(&self) -> usize {
        self.previous.len()
    }

    fn promote(&mut self, state: SessionState, retain: usize) {
        if let Some(old) = self.active.replace(state) {
            self.previous.push_front(old);
        }
        self.previous.truncate(retain);
    }

    /// Decrypt with the active session, then the retained ones.
    ///
    /// The flag is true when the active session accepted the message.
    fn decrypt(&mut self, message: &RatchetMessage) -> Result<(Vec<u8>, bool)> {
        let active = self.active.as_mut().ok_or_else(|| SessionError::InvalidState {
            state: "no active session".to_string(),
        })?;
        let error = match active.decrypt(message) {
            Ok(plaintext) => return Ok((plaintext, true)),
            Err(e) if e.kind() == ErrorKind::ReplayDetected => return Err(e),
            Err(e) => e,
        };

        for state in self.previous.iter_mut() {
            if let Ok(plaintext) = state.decrypt(message) {
                return Ok((plaintext, false));
            }
        }
        Err(error)
    }
}

/// Session service: handshakes, encryption, decryption, reset
pub struct SessionService {
    profile: Arc<UserProfile>,
    prekeys: Arc<dyn PreKeyStore>,
    sessions: Arc<dyn SessionStore>,
    limits: RatchetLimits,
    handshake_timeout: Duration,
    handshake_max_retries: u32,
    retained_sessions: usize,
    locks: KeyedLocks<PeerId>,
}

impl SessionService {
    /// Create a session service
    ///
    /// # Arguments
    ///
    /// * `profile` - Local identity
    /// * `prekeys` - Our prekey material (responder side)
    /// * `sessions` - Session persistence
    /// * `config` - Ratchet and handshake tunables
    pub fn new(
        profile: Arc<UserProfile>,
        prekeys: Arc<dyn PreKeyStore>,
        sessions: Arc<dyn SessionStore>,
        config: &CryptoConfig,
    ) -> Self {
        Self {
            profile,
            prekeys,
            sessions,
            limits: RatchetLimits {
                max_skip: config.max_skip,
                skipped_key_cap: config.skipped_key_cap,
            },
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            handshake_max_retries: config.handshake_max_retries,
            retained_sessions: config.retained_sessions,
            locks: KeyedLocks::new(),
        }
    }

    /// Override the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Local identity
    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    async fn lock(&self, peer: &PeerId) -> KeyedGuard<'_, PeerId> {
        self.locks.lock(peer.clone()).await
    }

    /// Handshake state for a peer
    pub fn status(&self, peer: &PeerId) -> SessionStatus {
        self.sessions
            .get(peer)
            .map(|record| record.status())
            .unwrap_or(SessionStatus::NoSession)
    }

    /// Identity key the peer used in its session, if any
    pub fn remote_identity(&self, peer: &PeerId) -> Option<IdentityPublicKey> {
        self.sessions
            .get(peer)
            .and_then(|record| record.active.map(|state| *state.remote_identity()))
    }

    /// Start a session from a peer's published bundle.
    ///
    /// The bundle signature is verified first. An existing session is kept
    /// read-only for in-flight messages.
    pub async fn initiate(&self, bundle: PreKeyBundle) -> Result<SessionStatus> {
        let peer = bundle.peer.clone();
        let _guard = self.lock(&peer).await;
        let mut record = self.sessions.get(&peer).unwrap_or_default();
        self.start_handshake(&mut record, bundle, 0)?;
        self.sessions.put(&peer, record);
        log::info!("Initiated session with {}", peer);
        Ok(SessionStatus::HandshakeInitiated)
    }

    fn start_handshake(
        &self,
        record: &mut SessionRecord,
        mut bundle: PreKeyBundle,
        attempts: u32,
    ) -> Result<()> {
        let initiation = X3DHInitiator::new(&self.profile.keypair).initiate(&bundle)?;
        let header = initiation.header.clone();
        // a one-time prekey is only good for one attempt
        if header.one_time_prekey_id.is_some() {
            bundle.take_one_time_prekey();
        }

        record.promote(
            SessionState::new_initiator(initiation, self.limits),
            self.retained_sessions,
        );
        record.pending = Some(PendingHandshake {
            header,
            bundle,
            started_at: Utc::now(),
            attempts,
        });
        Ok(())
    }

    /// Retry a handshake that went unanswered for too long.
    ///
    /// The stale ephemeral key is discarded and a new one derived. Returns
    /// `HandshakeTimeout` once the retries are used up, leaving the peer in
    /// `NoSession`.
    fn refresh_handshake(&self, peer: &PeerId, record: &mut SessionRecord) -> Result<()> {
        let Some(pending) = record.pending.as_ref() else {
            return Ok(());
        };
        let elapsed = Utc::now()
            .signed_duration_since(pending.started_at)
            .to_std()
            .unwrap_or_default();
        if elapsed < self.handshake_timeout {
            return Ok(());
        }

        let attempts = pending.attempts + 1;
        let bundle = pending.bundle.clone();
        // the stale initiator state never saw a reply; drop it entirely
        record.active = None;
        record.pending = None;

        if attempts > self.handshake_max_retries {
            log::warn!("Handshake with {} timed out after {} retries", peer, attempts - 1);
            return Err(SessionError::HandshakeTimeout { peer: peer.to_string() }.into());
        }
        log::info!("Handshake with {} unanswered, retrying ({})", peer, attempts);
        self.start_handshake(record, bundle, attempts)
    }

    /// Encrypt a payload for a peer.
    ///
    /// While the handshake is unanswered every message carries the prekey
    /// header so the peer can build the session from whichever arrives first.
    ///
    /// # Errors
    ///
    /// * `SessionError::NoSession` - no session and no handshake in flight
    /// * `SessionError::HandshakeTimeout` - retries exhausted
    pub async fn encrypt(&self, peer: &PeerId, plaintext: &[u8]) -> Result<SessionMessage> {
        let _guard = self.lock(peer).await;
        let mut record = self.sessions.get(peer).unwrap_or_default();

        if let Err(e) = self.refresh_handshake(peer, &mut record) {
            self.sessions.put(peer, record);
            return Err(e);
        }

        let state = record.active.as_mut().ok_or_else(|| SessionError::NoSession {
            peer: peer.to_string(),
        })?;
        let message = state.encrypt(plaintext)?;
        let output = match &record.pending {
            Some(pending) => SessionMessage::PreKey(PreKeyMessage {
                header: pending.header.clone(),
                message,
            }),
            None => SessionMessage::Ratchet(message),
        };

        self.sessions.put(peer, record);
        Ok(output)
    }

    /// Decrypt a payload from a peer.
    ///
    /// Cryptographic failures leave the stored session unchanged.
    pub async fn decrypt(&self, peer: &PeerId, message: &SessionMessage) -> Result<Vec<u8>> {
        let _guard = self.lock(peer).await;
        let mut record = self.sessions.get(peer).unwrap_or_default();

        let plaintext = match message {
            SessionMessage::PreKey(prekey) => self.decrypt_prekey(peer, &mut record, prekey),
            SessionMessage::Ratchet(message) => record.decrypt(message).map(|(plaintext, active)| {
                // only a reply on the newest handshake completes it
                if active && record.pending.take().is_some() {
                    log::info!("Session with {} established", peer);
                }
                plaintext
            }),
        };

        match plaintext {
            Ok(plaintext) => {
                self.sessions.put(peer, record);
                Ok(plaintext)
            }
            Err(e) => {
                log::warn!("Dropping message from {}: {}", peer, e);
                Err(e)
            }
        }
    }

    fn decrypt_prekey(
        &self,
        peer: &PeerId,
        record: &mut SessionRecord,
        prekey: &PreKeyMessage,
    ) -> Result<Vec<u8>> {
        let known = record
            .active
            .iter()
            .chain(record.previous.iter())
            .any(|state| state.base_key() == &prekey.header.ephemeral_key);
        if known {
            return record.decrypt(&prekey.message).map(|(plaintext, _)| plaintext);
        }

        let reception =
            X3DHRecipient::new(&self.profile.keypair, self.prekeys.as_ref()).receive(&prekey.header)?;
        let mut state =
            SessionState::new_responder(reception, prekey.header.identity_key, self.limits);
        let plaintext = state.decrypt(&prekey.message)?;

        record.promote(state, self.retained_sessions);
        record.pending = None;
        log::info!("Session with {} established by peer", peer);
        Ok(plaintext)
    }

    /// Forget the session with a peer. Only ever called on user request.
    pub async fn reset(&self, peer: &PeerId) -> Result<()> {
        let _guard = self.lock(peer).await;
        match self.sessions.delete(peer) {
            Some(_) => {
                log::info!("Session with {} reset", peer);
                Ok(())
            }
            None => Err(MessengerError::from(SessionError::NoSession {
                peer: peer.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrekeyManager;
    use crate::identity::ChainType;
    use crate::store::{MemoryPreKeyStore, MemorySessionStore};

    struct Party {
        profile: Arc<UserProfile>,
        prekeys: Arc<MemoryPreKeyStore>,
        service: SessionService,
    }

    fn party(address: &str, name: &str, config: &CryptoConfig) -> Party {
        let profile = Arc::new(UserProfile::new(PeerId::new(address, ChainType::Ethereum, name)));
        let prekeys = Arc::new(MemoryPreKeyStore::new());
        let service = SessionService::new(
            profile.clone(),
            prekeys.clone(),
            Arc::new(MemorySessionStore::new()),
            config,
        );
        Party {
            profile,
            prekeys,
            service,
        }
    }

    fn bundle_of(party: &Party) -> PreKeyBundle {
        PrekeyManager::new(party.prekeys.clone()).generate_bundle(&party.profile, 3)
    }

    #[tokio::test]
    async fn test_handshake_state_machine() {
        let config = CryptoConfig::default();
        let alice = party("0xA11CE", "Alice", &config);
        let bob = party("0xB0B", "Bob", &config);
        let a = alice.profile.peer.clone();
        let b = bob.profile.peer.clone();

        assert_eq!(alice.service.status(&b), SessionStatus::NoSession);
        alice.service.initiate(bundle_of(&bob)).await.unwrap();
        assert_eq!(alice.service.status(&b), SessionStatus::HandshakeInitiated);

        let first = alice.service.encrypt(&b, b"hello").await.unwrap();
        assert!(matches!(first, SessionMessage::PreKey(_)));
        assert_eq!(bob.service.decrypt(&a, &first).await.unwrap(), b"hello");
        assert_eq!(bob.service.status(&a), SessionStatus::Established);
        assert_eq!(bob.service.remote_identity(&a), Some(alice.profile.identity_key()));

        let reply = bob.service.encrypt(&a, b"hi").await.unwrap();
        assert!(matches!(reply, SessionMessage::Ratchet(_)));
        assert_eq!(alice.service.decrypt(&b, &reply).await.unwrap(), b"hi");
        assert_eq!(alice.service.status(&b), SessionStatus::Established);

        let next = alice.service.encrypt(&b, b"again").await.unwrap();
        assert!(matches!(next, SessionMessage::Ratchet(_)));
        assert_eq!(bob.service.decrypt(&a, &next).await.unwrap(), b"again");

        // per-peer locks are released with the last operation
        assert!(alice.service.locks.is_empty());
        assert!(bob.service.locks.is_empty());
    }

    #[tokio::test]
    async fn test_prekey_messages_before_reply() {
        let config = CryptoConfig::default();
        let alice = party("0xA11CE", "Alice", &config);
        let bob = party("0xB0B", "Bob", &config);
        let a = alice.profile.peer.clone();
        let b = bob.profile.peer.clone();

        alice.service.initiate(bundle_of(&bob)).await.unwrap();
        let first = alice.service.encrypt(&b, b"1").await.unwrap();
        let second = alice.service.encrypt(&b, b"2").await.unwrap();

        // second arrives first; the one-time prekey is consumed only once
        assert_eq!(bob.service.decrypt(&a, &second).await.unwrap(), b"2");
        assert_eq!(bob.service.decrypt(&a, &first).await.unwrap(), b"1");
        assert_eq!(
            bob.service.decrypt(&a, &first).await.unwrap_err().kind(),
            ErrorKind::ReplayDetected
        );
    }

    #[tokio::test]
    async fn test_invalid_bundle_rejected() {
        let config = CryptoConfig::default();
        let alice = party("0xA11CE", "Alice", &config);
        let bob = party("0xB0B", "Bob", &config);
        let mut bundle = bundle_of(&bob);
        bundle.signed_prekey.signature[0] ^= 1;

        let err = alice.service.initiate(bundle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBundleSignature);
        assert_eq!(alice.service.status(&bob.profile.peer), SessionStatus::NoSession);
    }

    #[tokio::test]
    async fn test_handshake_timeout_retries_with_new_ephemeral() {
        let config = CryptoConfig {
            handshake_max_retries: 1,
            ..CryptoConfig::default()
        };
        let alice = party("0xA11CE", "Alice", &config);
        let alice_service = alice.service.with_handshake_timeout(Duration::ZERO);
        let bob = party("0xB0B", "Bob", &config);
        let b = bob.profile.peer.clone();

        alice_service.initiate(bundle_of(&bob)).await.unwrap();
        let first_header = alice_service
            .sessions
            .get(&b)
            .and_then(|record| record.pending.map(|p| p.header))
            .unwrap();
        let SessionMessage::PreKey(retried) = alice_service.encrypt(&b, b"x").await.unwrap() else {
            panic!("expected a prekey message");
        };
        assert_eq!(alice_service.status(&b), SessionStatus::HandshakeInitiated);
        assert_ne!(retried.header.ephemeral_key, first_header.ephemeral_key);
        assert_ne!(
            retried.header.one_time_prekey_id,
            first_header.one_time_prekey_id
        );

        let err = alice_service.encrypt(&b, b"y").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeTimeout);
        assert_eq!(alice_service.status(&b), SessionStatus::NoSession);
    }

    #[tokio::test]
    async fn test_messages_to_previous_session_still_decrypt() {
        let config = CryptoConfig::default();
        let alice = party("0xA11CE", "Alice", &config);
        let bob = party("0xB0B", "Bob", &config);
        let a = alice.profile.peer.clone();
        let b = bob.profile.peer.clone();

        alice.service.initiate(bundle_of(&bob)).await.unwrap();
        let hello = alice.service.encrypt(&b, b"hello").await.unwrap();
        bob.service.decrypt(&a, &hello).await.unwrap();
        let in_flight = bob.service.encrypt(&a, b"in flight").await.unwrap();

        // Alice re-handshakes before Bob's reply arrives
        alice.service.initiate(bundle_of(&bob)).await.unwrap();
        assert_eq!(alice.service.decrypt(&b, &in_flight).await.unwrap(), b"in flight");
        // the reply belonged to the old session, so the new handshake stays open
        assert_eq!(alice.service.status(&b), SessionStatus::HandshakeInitiated);
    }

    #[tokio::test]
    async fn test_reset_is_explicit() {
        let config = CryptoConfig::default();
        let alice = party("0xA11CE", "Alice", &config);
        let bob = party("0xB0B", "Bob", &config);
        let b = bob.profile.peer.clone();

        assert!(alice.service.reset(&b).await.is_err());
        alice.service.initiate(bundle_of(&bob)).await.unwrap();
        alice.service.reset(&b).await.unwrap();
        assert_eq!(alice.service.status(&b), SessionStatus::NoSession);
        assert!(alice.service.encrypt(&b, b"x").await.is_err());
    }
}
