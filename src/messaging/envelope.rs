//! Wire envelope for the messaging protocol.
//!
//! Every frame the orchestrator hands to the transport manager is one
//! bincode-encoded [`Envelope`]. Confidential content only ever travels inside
//! [`Payload::Session`] (pairwise ratchet) or [`Payload::Group`] (sender key);
//! the envelope header is routing metadata and is checked against the
//! identity of the link it arrived on.

use crate::crypto::PreKeyBundle;
use crate::group::{GroupMessage, SenderKeyDistribution};
use crate::identity::PeerId;
use crate::session::SessionMessage;
use crate::store::{MessageId, MessageStatus};
use crate::utils::{ProtocolError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol id the orchestrator registers its frames under
pub const MESSAGING_PROTOCOL: &str = "/swm/messaging/1";

/// How far in the future a sender clock may run
const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Oldest envelope still accepted
const MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Routing header plus payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    pub version: u32,
    /// Unique envelope identifier
    pub id: Uuid,
    /// Author, must match the link identity
    pub sender: PeerId,
    /// Intended recipient
    pub recipient: PeerId,
    /// Creation time at the sender
    pub timestamp: DateTime<Utc>,
    /// Payload
    pub payload: Payload,
}

/// What an envelope carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Pairwise ratchet ciphertext of a bincode-encoded [`Content`]
    Session(SessionMessage),
    /// Sender-key ciphertext of a bincode-encoded [`Content::Text`]
    Group(GroupMessage),
    /// Ask the recipient for a fresh prekey bundle
    BundleRequest {
        /// Correlates the response
        request: Uuid,
    },
    /// Answer to a [`Payload::BundleRequest`]; the bundle is self-signed
    BundleResponse {
        /// Request being answered
        request: Uuid,
        /// The bundle
        bundle: PreKeyBundle,
    },
}

/// Plaintext inside an encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    /// User text
    Text {
        /// Id shared by both sides, referenced by receipts
        message_id: MessageId,
        /// Conversation or group id
        conversation: String,
        /// Body
        text: String,
        /// Creation time at the sender
        sent_at: DateTime<Utc>,
    },
    /// Delivery or read acknowledgment
    Receipt {
        /// Acknowledged message
        message_id: MessageId,
        /// How far it got
        status: ReceiptStatus,
    },
    /// A member's sender key for a group epoch
    SenderKey(SenderKeyDistribution),
}

/// Acknowledgment levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    /// Received and decrypted
    Delivered,
    /// Shown to the user
    Read,
}

impl ReceiptStatus {
    /// Status the acknowledged message moves to
    pub fn message_status(self) -> MessageStatus {
        match self {
            Self::Delivered => MessageStatus::Delivered,
            Self::Read => MessageStatus::Read,
        }
    }
}

impl Content {
    /// Serialize for encryption
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a decrypted payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Envelope {
    /// Wrap a payload, stamped now
    pub fn new(sender: PeerId, recipient: PeerId, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            sender,
            recipient,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Serialize for the transport
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MessageTooLarge` above [`crate::MAX_MESSAGE_SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;

        if serialized.len() > crate::MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: serialized.len(),
                max: crate::MAX_MESSAGE_SIZE,
            }
            .into());
        }

        Ok(serialized)
    }

    /// Deserialize and check the protocol version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > crate::MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: crate::MAX_MESSAGE_SIZE,
            }
            .into());
        }

        let envelope: Self = bincode::deserialize(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: envelope.version,
            }
            .into());
        }

        Ok(envelope)
    }

    /// Check routing fields against the link and our identity
    ///
    /// # Arguments
    ///
    /// * `link_peer` - Identity the transport manager authenticated the link as
    /// * `local` - Our identity
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidMessage` for a spoofed sender, a
    /// misrouted recipient, or a timestamp outside the accepted window.
    pub fn validate(&self, link_peer: &PeerId, local: &PeerId) -> Result<()> {
        if &self.sender != link_peer {
            return Err(invalid(format!(
                "sender {} does not match link peer {}",
                self.sender, link_peer
            )));
        }
        if &self.recipient != local {
            return Err(invalid(format!("addressed to {}", self.recipient)));
        }

        let now = Utc::now();
        if self.timestamp > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return Err(invalid("timestamp is in the future".to_string()));
        }
        if self.timestamp < now - Duration::seconds(MAX_AGE_SECS) {
            return Err(invalid("timestamp is too old".to_string()));
        }

        Ok(())
    }

    /// Payload name for logs
    pub fn kind_name(&self) -> &'static str {
        match &self.payload {
            Payload::Session(SessionMessage::PreKey(_)) => "prekey",
            Payload::Session(SessionMessage::Ratchet(_)) => "ratchet",
            Payload::Group(_) => "group",
            Payload::BundleRequest { .. } => "bundle-request",
            Payload::BundleResponse { .. } => "bundle-response",
        }
    }
}

fn invalid(reason: String) -> crate::utils::MessengerError {
    ProtocolError::InvalidMessage { reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChainType;
    use crate::utils::MessengerError;

    fn alice() -> PeerId {
        PeerId::new("0xA11CE", ChainType::Ethereum, "Alice")
    }

    fn bob() -> PeerId {
        PeerId::new("0xB0B", ChainType::Ethereum, "Bob")
    }

    #[test]
    fn test_envelope_bytes_keep_payload() {
        let request = Uuid::new_v4();
        let envelope = Envelope::new(alice(), bob(), Payload::BundleRequest { request });
        let decoded = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.sender, alice());
        assert_eq!(decoded.kind_name(), "bundle-request");
        assert!(matches!(decoded.payload, Payload::BundleRequest { request: r } if r == request));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut envelope = Envelope::new(alice(), bob(), Payload::BundleRequest { request: Uuid::new_v4() });
        envelope.version = PROTOCOL_VERSION + 1;
        let bytes = bincode::serialize(&envelope).unwrap();

        let err = Envelope::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Protocol(ProtocolError::UnsupportedVersion { version }) if version == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn test_oversized_input_rejected_before_parsing() {
        let bytes = vec![0u8; crate::MAX_MESSAGE_SIZE + 1];
        let err = Envelope::from_bytes(&bytes).unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Protocol(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_checks_routing_and_clock() {
        let envelope = Envelope::new(alice(), bob(), Payload::BundleRequest { request: Uuid::new_v4() });
        assert!(envelope.validate(&alice(), &bob()).is_ok());
        // display names do not take part in identity
        let renamed = PeerId::new("0xa11ce", ChainType::Ethereum, "someone else");
        assert!(envelope.validate(&renamed, &bob()).is_ok());

        assert!(envelope.validate(&bob(), &bob()).is_err());
        assert!(envelope.validate(&alice(), &alice()).is_err());

        let mut future = envelope.clone();
        future.timestamp = Utc::now() + Duration::hours(1);
        assert!(future.validate(&alice(), &bob()).is_err());

        let mut stale = envelope;
        stale.timestamp = Utc::now() - Duration::days(2);
        assert!(stale.validate(&alice(), &bob()).is_err());
    }

    #[test]
    fn test_receipt_status_maps_to_message_status() {
        assert_eq!(ReceiptStatus::Delivered.message_status(), MessageStatus::Delivered);
        assert_eq!(ReceiptStatus::Read.message_status(), MessageStatus::Read);

        let content = Content::Receipt {
            message_id: Uuid::new_v4(),
            status: ReceiptStatus::Read,
        };
        assert_eq!(Content::from_bytes(&content.to_bytes().unwrap()).unwrap(), content);
    }
}
