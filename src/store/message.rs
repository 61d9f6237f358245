//! Stored message records.
//!
//! Bodies are sealed with AES-256-GCM under the local storage key before a
//! record is built, so a [`StoredMessage`] never holds plaintext. The record
//! metadata is bound to the body as associated data.

use crate::crypto::primitives::{self, SymmetricKey};
use crate::identity::PeerId;
use crate::utils::{MessengerError, Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Message identifier
pub type MessageId = Uuid;

/// Direction relative to the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by us
    Outbound,
    /// Received from a peer
    Inbound,
}

/// Delivery status.
///
/// Outbound: `Sending -> Sent -> Delivered -> Read`, or `Failed` from
/// `Sending`/`Sent`; `Failed -> Sending` on user retry. Inbound messages
/// start at `Delivered` and may move to `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Queued for encryption and delivery
    Sending,
    /// Handed to the transport
    Sent,
    /// Acknowledged by the recipient
    Delivered,
    /// Read by the recipient
    Read,
    /// Delivery failed; user may retry
    Failed,
}

impl MessageStatus {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: Self) -> bool {
        use MessageStatus::{Delivered, Failed, Read, Sending, Sent};
        matches!(
            (self, next),
            (Sending, Sent)
                | (Sending, Failed)
                | (Sent, Delivered)
                | (Sent, Read)
                | (Sent, Failed)
                | (Delivered, Read)
                | (Failed, Sending)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A message at rest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Identifier, shared with the peer for receipts
    pub id: MessageId,
    /// Conversation the message belongs to
    pub conversation: String,
    /// The other party (sender for inbound, recipient for outbound)
    pub peer: PeerId,
    /// Direction
    pub direction: Direction,
    /// Creation time at the sender
    pub timestamp: DateTime<Utc>,
    /// Current status
    pub status: MessageStatus,
    /// `nonce || ciphertext || tag` of the body
    #[serde(with = "serde_bytes")]
    sealed_body: Vec<u8>,
}

impl StoredMessage {
    fn aad(id: &MessageId, conversation: &str, peer: &PeerId, direction: Direction) -> Vec<u8> {
        let mut aad = id.as_bytes().to_vec();
        aad.extend_from_slice(conversation.as_bytes());
        aad.push(0);
        aad.extend_from_slice(peer.to_string().as_bytes());
        aad.push(match direction {
            Direction::Outbound => 0,
            Direction::Inbound => 1,
        });
        aad
    }

    /// Seal a plaintext body into a new record
    #[allow(clippy::too_many_arguments)]
    pub fn seal(
        key: &SymmetricKey,
        id: MessageId,
        conversation: impl Into<String>,
        peer: PeerId,
        direction: Direction,
        timestamp: DateTime<Utc>,
        status: MessageStatus,
        body: &str,
    ) -> Result<Self> {
        let conversation = conversation.into();
        let aad = Self::aad(&id, &conversation, &peer, direction);
        let sealed_body = primitives::encrypt(key, body.as_bytes(), &aad)?;
        Ok(Self {
            id,
            conversation,
            peer,
            direction,
            timestamp,
            status,
            sealed_body,
        })
    }

    /// Verify and decrypt the body
    pub fn open(&self, key: &SymmetricKey) -> Result<String> {
        let aad = Self::aad(&self.id, &self.conversation, &self.peer, self.direction);
        let body = primitives::decrypt(key, &self.sealed_body, &aad)?;
        String::from_utf8(body).map_err(|e| MessengerError::Serialization(e.to_string()))
    }

    /// Apply a status transition in place
    pub fn transition(&mut self, next: MessageStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        self.status = next;
        Ok(())
    }
}
