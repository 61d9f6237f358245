//! Double Ratchet session state.
//!
//! Every message is sealed under a fresh message key taken from a symmetric
//! chain (HMAC-SHA256 step, HKDF expansion). Whenever the peer presents a new
//! ratchet public key the root key is advanced with a Diffie-Hellman output,
//! so compromising the current state reveals neither earlier chains nor
//! chains started after the next round trip.
//!
//! Decryption is transactional: it runs against a copy of the state that is
//! committed only when the ciphertext authenticates.

use crate::crypto::primitives::{self, hkdf_expand, hmac_sha256, SymmetricKey, KEY_SIZE};
use crate::crypto::IdentityPublicKey;
use crate::utils::{BoundedCache, CryptoError, Result, SessionError};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;
use x25519_dalek::{PublicKey, StaticSecret};

/// Maximum number of message keys skipped in a single chain
pub const MAX_SKIP: u32 = 1000;

/// Number of superseded remote ratchet keys remembered for replay detection
const RETIRED_REMOTE_KEYS: usize = 8;

/// HKDF info for root key advancement
const ROOT_KEY_INFO: &[u8] = b"swm-ratchet-root";

/// HKDF info for message key derivation
const MESSAGE_KEY_INFO: &[u8] = b"swm-ratchet-message";

const MESSAGE_KEY_SEED: &[u8] = &[0x01];
const CHAIN_KEY_SEED: &[u8] = &[0x02];

/// Authenticated-but-not-encrypted per-message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetHeader {
    /// Sender's current ratchet public key
    #[serde(with = "serde_bytes")]
    pub ratchet_key: [u8; KEY_SIZE],
    /// Position in the sending chain
    pub counter: u32,
    /// Length of the sender's previous sending chain
    pub previous_counter: u32,
}

impl RatchetHeader {
    fn encode(&self) -> [u8; KEY_SIZE + 8] {
        let mut out = [0u8; KEY_SIZE + 8];
        out[..KEY_SIZE].copy_from_slice(&self.ratchet_key);
        out[KEY_SIZE..KEY_SIZE + 4].copy_from_slice(&self.counter.to_be_bytes());
        out[KEY_SIZE + 4..].copy_from_slice(&self.previous_counter.to_be_bytes());
        out
    }
}

/// Encrypted message with ratchet metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Header, bound into the AEAD as associated data
    pub header: RatchetHeader,
    /// `nonce || ciphertext || tag`
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Advance a chain: returns `(message_key, next_chain_key)`
pub(crate) fn chain_step(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey)> {
    let seed = hmac_sha256(chain_key.as_bytes(), MESSAGE_KEY_SEED)?;
    let message_key = hkdf_expand::<KEY_SIZE>(None, &seed, MESSAGE_KEY_INFO)?;
    let next = hmac_sha256(chain_key.as_bytes(), CHAIN_KEY_SEED)?;
    Ok((SymmetricKey::from_bytes(message_key), SymmetricKey::from_bytes(next)))
}

/// Advance the root with a DH output: returns `(root_key, chain_key)`
fn root_step(root_key: &SymmetricKey, dh_output: &[u8]) -> Result<(SymmetricKey, SymmetricKey)> {
    let okm = hkdf_expand::<{ 2 * KEY_SIZE }>(Some(root_key.as_bytes()), dh_output, ROOT_KEY_INFO)?;
    Ok((
        SymmetricKey::from_slice(&okm[..KEY_SIZE])?,
        SymmetricKey::from_slice(&okm[KEY_SIZE..])?,
    ))
}

/// Per-peer ratchet state
#[derive(Clone)]
pub struct SessionState {
    session_id: Uuid,
    /// Initiator's ephemeral key; identifies the handshake this state came from
    base_key: [u8; KEY_SIZE],
    remote_identity: IdentityPublicKey,
    associated_data: Vec<u8>,
    root_key: SymmetricKey,
    dh_self: StaticSecret,
    dh_remote: PublicKey,
    rotate_on_send: bool,
    sending_chain_key: SymmetricKey,
    sending_counter: u32,
    previous_sending_counter: u32,
    receiving_chain_key: SymmetricKey,
    receiving_counter: u32,
    skipped: BoundedCache<([u8; KEY_SIZE], u32), SymmetricKey>,
    retired_remote_keys: VecDeque<[u8; KEY_SIZE]>,
    max_skip: u32,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("root_key", &"[REDACTED]")
            .field("sending_chain_key", &"[REDACTED]")
            .field("receiving_chain_key", &"[REDACTED]")
            .field("dh_self", &"[REDACTED]")
            .field("dh_remote", &hex::encode(self.dh_remote.as_bytes()))
            .field("sending_counter", &self.sending_counter)
            .field("previous_sending_counter", &self.previous_sending_counter)
            .field("receiving_counter", &self.receiving_counter)
            .field("skipped", &self.skipped.len())
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .finish()
    }
}

/// Tunables shared by every session
#[derive(Debug, Clone, Copy)]
pub struct RatchetLimits {
    /// Largest gap accepted in one chain
    pub max_skip: u32,
    /// Hard cap on cached skipped keys
    pub skipped_key_cap: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skip: MAX_SKIP,
            skipped_key_cap: 2 * MAX_SKIP as usize,
        }
    }
}

impl SessionState {
    #[allow(clippy::too_many_arguments)]
    fn new(
        base_key: [u8; KEY_SIZE],
        remote_identity: IdentityPublicKey,
        associated_data: Vec<u8>,
        root_key: SymmetricKey,
        dh_self: StaticSecret,
        dh_remote: PublicKey,
        rotate_on_send: bool,
        sending_chain_key: SymmetricKey,
        receiving_chain_key: SymmetricKey,
        limits: RatchetLimits,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            base_key,
            remote_identity,
            associated_data,
            root_key,
            dh_self,
            dh_remote,
            rotate_on_send,
            sending_chain_key,
            sending_counter: 0,
            previous_sending_counter: 0,
            receiving_chain_key,
            receiving_counter: 0,
            skipped: BoundedCache::new(limits.skipped_key_cap),
            retired_remote_keys: VecDeque::new(),
            max_skip: limits.max_skip,
            created_at: now,
            last_activity: now,
        }
    }

    /// Initialize a session as the initiator from a completed X3DH
    pub fn new_initiator(initiation: super::x3dh::Initiation, limits: RatchetLimits) -> Self {
        let keys = initiation.keys;
        Self::new(
            initiation.header.ephemeral_key,
            initiation.remote_identity,
            keys.associated_data.clone(),
            keys.root_key.clone(),
            initiation.ephemeral,
            initiation.remote_ratchet_key,
            false,
            keys.initiator_chain.clone(),
            keys.responder_chain.clone(),
            limits,
        )
    }

    /// Initialize a session as the responder from a received X3DH header
    pub fn new_responder(
        reception: super::x3dh::Reception,
        remote_identity: IdentityPublicKey,
        limits: RatchetLimits,
    ) -> Self {
        let keys = reception.keys;
        Self::new(
            reception.remote_ratchet_key.to_bytes(),
            remote_identity,
            keys.associated_data.clone(),
            keys.root_key.clone(),
            reception.signed_prekey,
            reception.remote_ratchet_key,
            // the responder turns the DH ratchet on its first reply
            true,
            keys.responder_chain.clone(),
            keys.initiator_chain.clone(),
            limits,
        )
    }

    /// Session identifier
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Initiator ephemeral key this session was built from
    pub fn base_key(&self) -> &[u8; KEY_SIZE] {
        &self.base_key
    }

    /// Peer's identity key as seen in the handshake
    pub fn remote_identity(&self) -> &IdentityPublicKey {
        &self.remote_identity
    }

    /// Number of cached skipped message keys
    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    /// Time of the last successful send or receive
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    fn aad(&self, header: &RatchetHeader) -> Vec<u8> {
        let mut aad = self.associated_data.clone();
        aad.extend_from_slice(&header.encode());
        aad
    }

    /// Encrypt a message using the ratchet
    ///
    /// # Arguments
    ///
    /// * `plaintext` - The message to encrypt
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<RatchetMessage> {
        if self.rotate_on_send {
            let dh_self = StaticSecret::random_from_rng(OsRng);
            let (root_key, chain_key) =
                root_step(&self.root_key, dh_self.diffie_hellman(&self.dh_remote).as_bytes())?;
            self.root_key = root_key;
            self.sending_chain_key = chain_key;
            self.dh_self = dh_self;
            self.previous_sending_counter = self.sending_counter;
            self.sending_counter = 0;
            self.rotate_on_send = false;
            log::debug!("Session {} turned sending ratchet", self.session_id);
        }

        let header = RatchetHeader {
            ratchet_key: PublicKey::from(&self.dh_self).to_bytes(),
            counter: self.sending_counter,
            previous_counter: self.previous_sending_counter,
        };
        let next_counter = self
            .sending_counter
            .checked_add(1)
            .ok_or_else(|| SessionError::InvalidState {
                state: "sending chain exhausted".to_string(),
            })?;

        let (message_key, next_chain_key) = chain_step(&self.sending_chain_key)?;
        let ciphertext = primitives::encrypt(&message_key, plaintext, &self.aad(&header))?;

        self.sending_chain_key = next_chain_key;
        self.sending_counter = next_counter;
        self.last_activity = Utc::now();

        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypt a message, committing the state change only on success
    ///
    /// # Errors
    ///
    /// * `CryptoError::AuthenticationFailed` - tag mismatch; state untouched
    /// * `SessionError::ReplayDetected` - counter already consumed
    /// * `SessionError::TooFarAhead` - gap larger than the skip bound
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(message)?;
        next.last_activity = Utc::now();
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(&mut self, message: &RatchetMessage) -> Result<Vec<u8>> {
        let header = &message.header;
        let aad = self.aad(header);

        if let Some(message_key) = self.skipped.remove(&(header.ratchet_key, header.counter)) {
            return primitives::decrypt(&message_key, &message.ciphertext, &aad);
        }

        if header.ratchet_key == self.dh_remote.to_bytes() {
            if header.counter < self.receiving_counter {
                return Err(SessionError::ReplayDetected {
                    counter: header.counter,
                }
                .into());
            }
        } else if self.retired_remote_keys.contains(&header.ratchet_key) {
            return Err(SessionError::ReplayDetected {
                counter: header.counter,
            }
            .into());
        } else {
            self.skip_to(header.previous_counter)?;
            self.turn_receiving_ratchet(PublicKey::from(header.ratchet_key))?;
        }

        self.skip_to(header.counter)?;
        let (message_key, next_chain_key) = chain_step(&self.receiving_chain_key)?;
        let plaintext = primitives::decrypt(&message_key, &message.ciphertext, &aad)?;

        self.receiving_chain_key = next_chain_key;
        self.receiving_counter = header.counter.saturating_add(1);
        Ok(plaintext)
    }

    fn turn_receiving_ratchet(&mut self, remote: PublicKey) -> Result<()> {
        let dh = self.dh_self.diffie_hellman(&remote);
        if !dh.was_contributory() {
            return Err(CryptoError::InvalidKey {
                reason: "low-order ratchet key".to_string(),
            }
            .into());
        }
        let (root_key, chain_key) = root_step(&self.root_key, dh.as_bytes())?;

        self.retired_remote_keys.push_back(self.dh_remote.to_bytes());
        while self.retired_remote_keys.len() > RETIRED_REMOTE_KEYS {
            self.retired_remote_keys.pop_front();
        }

        self.root_key = root_key;
        self.receiving_chain_key = chain_key;
        self.receiving_counter = 0;
        self.dh_remote = remote;
        self.rotate_on_send = true;
        Ok(())
    }

    /// Derive and cache keys for counters `receiving_counter..until`
    fn skip_to(&mut self, until: u32) -> Result<()> {
        if until <= self.receiving_counter {
            return Ok(());
        }
        if until - self.receiving_counter > self.max_skip {
            return Err(SessionError::TooFarAhead {
                counter: until,
                current: self.receiving_counter,
                max_skip: self.max_skip,
            }
            .into());
        }

        let remote = self.dh_remote.to_bytes();
        while self.receiving_counter < until {
            let (message_key, next_chain_key) = chain_step(&self.receiving_chain_key)?;
            if let Some(((_, lost), _)) = self
                .skipped
                .insert((remote, self.receiving_counter), message_key)
            {
                log::warn!(
                    "Session {} skipped-key cache full, dropped key {}",
                    self.session_id,
                    lost
                );
            }
            self.receiving_chain_key = next_chain_key;
            self.receiving_counter += 1;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn chain_keys(&self) -> (SymmetricKey, SymmetricKey) {
        (self.sending_chain_key.clone(), self.receiving_chain_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{PrekeyManager, UserProfile};
    use crate::identity::{ChainType, PeerId};
    use crate::session::x3dh::{X3DHInitiator, X3DHRecipient};
    use crate::store::MemoryPreKeyStore;
    use crate::utils::ErrorKind;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pair() -> (SessionState, SessionState) {
        pair_with(RatchetLimits::default())
    }

    fn pair_with(limits: RatchetLimits) -> (SessionState, SessionState) {
        let alice = UserProfile::new(PeerId::new("0xA11CE", ChainType::Ethereum, "Alice"));
        let bob = UserProfile::new(PeerId::new("0xB0B", ChainType::Ethereum, "Bob"));
        let store = Arc::new(MemoryPreKeyStore::new());
        let bundle = PrekeyManager::new(store.clone()).generate_bundle(&bob, 1);

        let initiation = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap();
        let header = initiation.header.clone();
        let reception = X3DHRecipient::new(&bob.keypair, store.as_ref())
            .receive(&header)
            .unwrap();

        (
            SessionState::new_initiator(initiation, limits),
            SessionState::new_responder(reception, header.identity_key, limits),
        )
    }

    #[test]
    fn test_initial_chain_keys_match() {
        let (alice, bob) = pair();
        let (alice_send, alice_recv) = alice.chain_keys();
        let (bob_send, bob_recv) = bob.chain_keys();
        assert_eq!(alice_send, bob_recv);
        assert_eq!(alice_recv, bob_send);
    }

    #[test]
    fn test_in_order_messages() {
        let (mut alice, mut bob) = pair();
        for i in 0..20 {
            let text = format!("message {i}");
            let message = alice.encrypt(text.as_bytes()).unwrap();
            assert_eq!(message.header.counter, i);
            assert_eq!(bob.decrypt(&message).unwrap(), text.as_bytes());
        }
    }

    #[test]
    fn test_message_keys_never_repeat() {
        let mut chain = SymmetricKey::random();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let (message_key, next) = chain_step(&chain).unwrap();
            assert!(seen.insert(*message_key.as_bytes()));
            assert!(seen.insert(*next.as_bytes()));
            chain = next;
        }
    }

    #[test]
    fn test_ping_pong_turns_ratchet() {
        let (mut alice, mut bob) = pair();
        let mut ratchet_keys = HashSet::new();

        for round in 0..5 {
            let a = alice.encrypt(format!("a{round}").as_bytes()).unwrap();
            assert_eq!(bob.decrypt(&a).unwrap(), format!("a{round}").as_bytes());
            ratchet_keys.insert(a.header.ratchet_key);

            let b = bob.encrypt(format!("b{round}").as_bytes()).unwrap();
            assert_eq!(alice.decrypt(&b).unwrap(), format!("b{round}").as_bytes());
            ratchet_keys.insert(b.header.ratchet_key);
        }
        // every turn of the conversation uses a new key pair
        assert_eq!(ratchet_keys.len(), 10);
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut alice, mut bob) = pair();
        let messages: Vec<_> = (1..=5)
            .map(|i| alice.encrypt(format!("m{i}").as_bytes()).unwrap())
            .collect();

        for i in [1usize, 3, 2, 5, 4] {
            let plaintext = bob.decrypt(&messages[i - 1]).unwrap();
            assert_eq!(plaintext, format!("m{i}").as_bytes());
        }
        assert_eq!(bob.skipped_keys(), 0);
    }

    #[test]
    fn test_out_of_order_across_ratchet_turn() {
        let (mut alice, mut bob) = pair();
        let early = alice.encrypt(b"early").unwrap();
        let first = alice.encrypt(b"first").unwrap();
        bob.decrypt(&first).unwrap();

        let reply = bob.encrypt(b"reply").unwrap();
        alice.decrypt(&reply).unwrap();
        let later = alice.encrypt(b"later").unwrap();

        assert_eq!(bob.decrypt(&later).unwrap(), b"later");
        assert_eq!(bob.decrypt(&early).unwrap(), b"early");
    }

    #[test]
    fn test_replay_detected() {
        let (mut alice, mut bob) = pair();
        let first = alice.encrypt(b"one").unwrap();
        let second = alice.encrypt(b"two").unwrap();
        bob.decrypt(&first).unwrap();
        bob.decrypt(&second).unwrap();

        for replayed in [&first, &second] {
            let err = bob.decrypt(replayed).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ReplayDetected);
        }
    }

    #[test]
    fn test_replay_from_retired_chain() {
        let (mut alice, mut bob) = pair();
        let first = alice.encrypt(b"one").unwrap();
        bob.decrypt(&first).unwrap();
        alice.decrypt(&bob.encrypt(b"ack").unwrap()).unwrap();
        bob.decrypt(&alice.encrypt(b"two").unwrap()).unwrap();

        assert_eq!(bob.decrypt(&first).unwrap_err().kind(), ErrorKind::ReplayDetected);
    }

    #[test]
    fn test_too_far_ahead() {
        let limits = RatchetLimits {
            max_skip: 5,
            skipped_key_cap: 10,
        };
        let (mut alice, mut bob) = pair_with(limits);
        let mut last = None;
        for _ in 0..7 {
            last = Some(alice.encrypt(b"x").unwrap());
        }
        let err = bob.decrypt(&last.unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooFarAhead);
    }

    #[test]
    fn test_tampering_fails_and_keeps_state() {
        let (mut alice, mut bob) = pair();
        let message = alice.encrypt(b"secret").unwrap();

        for bit in [0usize, 100, message.ciphertext.len() * 8 - 1] {
            let mut tampered = message.clone();
            tampered.ciphertext[bit / 8] ^= 1 << (bit % 8);
            let err = bob.decrypt(&tampered).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        }

        let mut tampered_header = message.clone();
        tampered_header.header.previous_counter ^= 1;
        assert!(bob.decrypt(&tampered_header).is_err());

        // the genuine message still decrypts after the failures
        assert_eq!(bob.decrypt(&message).unwrap(), b"secret");
    }
}
