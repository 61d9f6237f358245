//! Scoped persistence for prekeys, sessions, group sessions and messages.
//!
//! Every mutating call is atomic with respect to a single peer or group key;
//! nothing spans keys. The in-memory implementations in [`memory`] guard
//! each map with one lock, which is enough for that guarantee.

pub mod memory;
pub mod message;

pub use memory::{MemoryGroupSessionStore, MemoryMessageStore, MemoryPreKeyStore, MemorySessionStore};
pub use message::{Direction, MessageId, MessageStatus, StoredMessage};

use crate::crypto::{OneTimePrekey, SignedPrekey};
use crate::group::{GroupId, GroupSession};
use crate::identity::PeerId;
use crate::session::SessionRecord;
use crate::utils::Result;
use x25519_dalek::StaticSecret;

/// Private prekey material
pub trait PreKeyStore: Send + Sync {
    /// Allocate the next signed prekey id
    fn next_signed_prekey_id(&self) -> u32;
    /// Allocate the next one-time prekey id
    fn next_one_time_prekey_id(&self) -> u32;

    /// Store a signed prekey and make it current
    fn put_signed(&self, prekey: SignedPrekey, secret: StaticSecret);
    /// Current signed prekey
    fn current_signed(&self) -> Option<SignedPrekey>;
    /// Private half of a signed prekey (current or retained)
    fn signed_secret(&self, id: u32) -> Option<StaticSecret>;

    /// Store a one-time prekey
    fn put_one_time(&self, prekey: OneTimePrekey, secret: StaticSecret);
    /// Public half of an unconsumed one-time prekey
    fn get_one_time(&self, id: u32) -> Option<OneTimePrekey>;
    /// Public halves of all unconsumed one-time prekeys, by id
    fn one_time_public_keys(&self) -> Vec<OneTimePrekey>;
    /// Atomically take and invalidate a one-time prekey.
    ///
    /// Fails with `OneTimePrekeyExhausted` if it was already consumed.
    fn consume_one_time(&self, id: u32) -> Result<StaticSecret>;
    /// Discard a one-time prekey without using it
    fn delete_one_time(&self, id: u32) -> bool;
}

/// Ratchet sessions, one record per peer
pub trait SessionStore: Send + Sync {
    /// Load a peer's session record
    fn get(&self, peer: &PeerId) -> Option<SessionRecord>;
    /// Replace a peer's session record
    fn put(&self, peer: &PeerId, record: SessionRecord);
    /// Remove a peer's session record
    fn delete(&self, peer: &PeerId) -> Option<SessionRecord>;
    /// Peers with a stored record
    fn peers(&self) -> Vec<PeerId>;
}

/// Group sessions, one per group
pub trait GroupSessionStore: Send + Sync {
    /// Load a group session
    fn get(&self, group: &GroupId) -> Option<GroupSession>;
    /// Replace a group session
    fn put(&self, session: GroupSession);
    /// Remove a group session
    fn delete(&self, group: &GroupId) -> Option<GroupSession>;
}

/// Sealed message history
pub trait MessageStore: Send + Sync {
    /// Insert or replace a message
    fn put(&self, message: StoredMessage);
    /// Load a message
    fn get(&self, id: &MessageId) -> Option<StoredMessage>;
    /// Remove a message
    fn delete(&self, id: &MessageId) -> Option<StoredMessage>;
    /// Messages of a conversation, oldest first
    fn conversation(&self, conversation: &str) -> Vec<StoredMessage>;
    /// Atomically move a message to a new status.
    ///
    /// Fails if the transition is not allowed from the current status.
    fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<StoredMessage>;
}
