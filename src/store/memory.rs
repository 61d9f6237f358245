//! In-memory store implementations.

use super::{GroupSessionStore, MessageStore, PreKeyStore, SessionStore};
use crate::crypto::{OneTimePrekey, SignedPrekey};
use crate::group::{GroupId, GroupSession};
use crate::identity::PeerId;
use crate::session::SessionRecord;
use crate::store::message::{MessageId, MessageStatus, StoredMessage};
use crate::utils::{Result, SessionError, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use x25519_dalek::StaticSecret;

/// Signed prekeys kept after rotation so late handshakes still complete
const RETAINED_SIGNED_PREKEYS: usize = 3;

#[derive(Default)]
struct PreKeyState {
    next_signed_id: u32,
    next_one_time_id: u32,
    current_signed: Option<u32>,
    signed: BTreeMap<u32, (SignedPrekey, StaticSecret)>,
    one_time: BTreeMap<u32, (OneTimePrekey, StaticSecret)>,
}

/// In-memory [`PreKeyStore`]
#[derive(Default)]
pub struct MemoryPreKeyStore {
    state: Mutex<PreKeyState>,
}

impl MemoryPreKeyStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn next_signed_prekey_id(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_signed_id += 1;
        state.next_signed_id
    }

    fn next_one_time_prekey_id(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_one_time_id += 1;
        state.next_one_time_id
    }

    fn put_signed(&self, prekey: SignedPrekey, secret: StaticSecret) {
        let mut state = self.state.lock();
        state.current_signed = Some(prekey.id);
        state.signed.insert(prekey.id, (prekey, secret));
        while state.signed.len() > RETAINED_SIGNED_PREKEYS {
            let oldest = state.signed.keys().next().copied();
            if let Some(oldest) = oldest {
                state.signed.remove(&oldest);
            }
        }
    }

    fn current_signed(&self) -> Option<SignedPrekey> {
        let state = self.state.lock();
        state
            .current_signed
            .and_then(|id| state.signed.get(&id))
            .map(|(prekey, _)| prekey.clone())
    }

    fn signed_secret(&self, id: u32) -> Option<StaticSecret> {
        self.state.lock().signed.get(&id).map(|(_, secret)| secret.clone())
    }

    fn put_one_time(&self, prekey: OneTimePrekey, secret: StaticSecret) {
        self.state.lock().one_time.insert(prekey.id, (prekey, secret));
    }

    fn get_one_time(&self, id: u32) -> Option<OneTimePrekey> {
        self.state.lock().one_time.get(&id).map(|(prekey, _)| prekey.clone())
    }

    fn one_time_public_keys(&self) -> Vec<OneTimePrekey> {
        self.state
            .lock()
            .one_time
            .values()
            .map(|(prekey, _)| prekey.clone())
            .collect()
    }

    fn consume_one_time(&self, id: u32) -> Result<StaticSecret> {
        self.state
            .lock()
            .one_time
            .remove(&id)
            .map(|(_, secret)| secret)
            .ok_or_else(|| SessionError::OneTimePrekeyExhausted { id }.into())
    }

    fn delete_one_time(&self, id: u32) -> bool {
        self.state.lock().one_time.remove(&id).is_some()
    }
}

/// In-memory [`SessionStore`]
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<PeerId, SessionRecord>>,
}

impl MemorySessionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, peer: &PeerId) -> Option<SessionRecord> {
        self.records.lock().get(peer).cloned()
    }

    fn put(&self, peer: &PeerId, record: SessionRecord) {
        self.records.lock().insert(peer.clone(), record);
    }

    fn delete(&self, peer: &PeerId) -> Option<SessionRecord> {
        self.records.lock().remove(peer)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.records.lock().keys().cloned().collect()
    }
}

/// In-memory [`GroupSessionStore`]
#[derive(Default)]
pub struct MemoryGroupSessionStore {
    groups: Mutex<HashMap<GroupId, GroupSession>>,
}

impl MemoryGroupSessionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupSessionStore for MemoryGroupSessionStore {
    fn get(&self, group: &GroupId) -> Option<GroupSession> {
        self.groups.lock().get(group).cloned()
    }

    fn put(&self, session: GroupSession) {
        self.groups.lock().insert(session.id().clone(), session);
    }

    fn delete(&self, group: &GroupId) -> Option<GroupSession> {
        self.groups.lock().remove(group)
    }
}

/// In-memory [`MessageStore`]
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<HashMap<MessageId, StoredMessage>>,
}

impl MemoryMessageStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn put(&self, message: StoredMessage) {
        self.messages.lock().insert(message.id, message);
    }

    fn get(&self, id: &MessageId) -> Option<StoredMessage> {
        self.messages.lock().get(id).cloned()
    }

    fn delete(&self, id: &MessageId) -> Option<StoredMessage> {
        self.messages.lock().remove(id)
    }

    fn conversation(&self, conversation: &str) -> Vec<StoredMessage> {
        let mut messages: Vec<_> = self
            .messages
            .lock()
            .values()
            .filter(|m| m.conversation == conversation)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        messages
    }

    fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<StoredMessage> {
        let mut messages = self.messages.lock();
        let message = messages.get_mut(id).ok_or_else(|| StoreError::NotFound {
            key: id.to_string(),
        })?;
        message.transition(status)?;
        Ok(message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{PrekeyManager, SymmetricKey, UserProfile};
    use crate::identity::ChainType;
    use crate::store::Direction;
    use crate::utils::ErrorKind;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_consume_one_time_is_take_once() {
        let store = Arc::new(MemoryPreKeyStore::new());
        let profile = UserProfile::new(PeerId::new("0xB0B", ChainType::Ethereum, "Bob"));
        let bundle = PrekeyManager::new(store.clone()).generate_bundle(&profile, 2);
        let id = bundle.one_time_prekeys[0].id;

        assert!(store.get_one_time(id).is_some());
        assert!(store.consume_one_time(id).is_ok());
        assert!(store.get_one_time(id).is_none());
        assert_eq!(
            store.consume_one_time(id).err().unwrap().kind(),
            ErrorKind::OneTimePrekeyExhausted
        );
        assert_eq!(store.one_time_public_keys().len(), 1);
    }

    #[test]
    fn test_concurrent_consume_has_single_winner() {
        let store = Arc::new(MemoryPreKeyStore::new());
        let profile = UserProfile::new(PeerId::new("0xB0B", ChainType::Ethereum, "Bob"));
        let bundle = PrekeyManager::new(store.clone()).generate_bundle(&profile, 1);
        let id = bundle.one_time_prekeys[0].id;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.consume_one_time(id).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_signed_prekeys_are_retained_after_rotation() {
        let store = Arc::new(MemoryPreKeyStore::new());
        let profile = UserProfile::new(PeerId::new("0xB0B", ChainType::Ethereum, "Bob"));
        let manager = PrekeyManager::new(store.clone());

        let first = manager.generate_signed_prekey(&profile);
        let second = manager.generate_signed_prekey(&profile);
        assert_eq!(store.current_signed().unwrap().id, second.id);
        assert!(store.signed_secret(first.id).is_some());

        for _ in 0..RETAINED_SIGNED_PREKEYS {
            manager.generate_signed_prekey(&profile);
        }
        assert!(store.signed_secret(first.id).is_none());
    }

    #[test]
    fn test_message_store_status_updates() {
        let store = MemoryMessageStore::new();
        let key = SymmetricKey::random();
        let id = Uuid::new_v4();
        store.put(
            StoredMessage::seal(
                &key,
                id,
                "conv",
                PeerId::new("0xB0B", ChainType::Ethereum, "Bob"),
                Direction::Outbound,
                chrono::Utc::now(),
                MessageStatus::Sending,
                "hi",
            )
            .unwrap(),
        );

        assert_eq!(
            store.update_status(&id, MessageStatus::Sent).unwrap().status,
            MessageStatus::Sent
        );
        assert!(store.update_status(&id, MessageStatus::Sending).is_err());
        assert!(store.update_status(&Uuid::new_v4(), MessageStatus::Sent).is_err());
        assert_eq!(store.conversation("conv").len(), 1);
        assert!(store.delete(&id).is_some());
        assert!(store.get(&id).is_none());
    }
}
