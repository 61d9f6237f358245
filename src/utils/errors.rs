//! Error types and handling for the messaging core.
//!
//! Every failure is raised as a [`MessengerError`]. The nested enums keep the
//! area that produced the error, while [`MessengerError::kind`] collapses them
//! onto the flat taxonomy that UI collaborators switch on.

use thiserror::Error;

/// Result type alias for the messenger library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Flat error taxonomy exposed to callers of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// An address string did not parse
    MalformedAddress,
    /// Every registered transport failed to dial the peer
    Unreachable,
    /// A handshake received no response in time
    HandshakeTimeout,
    /// A prekey bundle signature did not verify against its identity key
    InvalidBundleSignature,
    /// AEAD tag mismatch or tampered ciphertext
    AuthenticationFailed,
    /// A message counter was delivered twice
    ReplayDetected,
    /// A message counter is beyond the skipped-key bound
    TooFarAhead,
    /// A one-time prekey was already consumed or never existed
    OneTimePrekeyExhausted,
    /// A group message references an epoch we hold no key for
    GroupEpochMismatch,
    /// Anything outside the protocol taxonomy (I/O, config, serialization)
    Other,
}

/// Comprehensive error type for all messenger operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Session management errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Group session errors
    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    /// Store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Key, nonce or tag had the wrong length
    #[error("Invalid length for {what}: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Invalid key encoding
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Decryption failed closed
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Prekey bundle signature did not verify
    #[error("Invalid prekey bundle signature")]
    InvalidBundleSignature,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Address string did not parse
    #[error("Malformed address '{address}': {reason}")]
    MalformedAddress { address: String, reason: String },

    /// All transports failed
    #[error("Peer unreachable: {peer}")]
    Unreachable { peer: String },

    /// Connection establishment failure on one transport
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Network transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Address handed to a transport that does not speak its protocol
    #[error("Unsupported address for {transport}: {address}")]
    UnsupportedAddress { transport: String, address: String },

    /// Operation on a connection that is no longer open
    #[error("Connection closed: {peer}")]
    ConnectionClosed { peer: String },

    /// Pairing code was rejected or timed out
    #[error("Pairing rejected with {device}")]
    PairingRejected { device: String },

    /// Transport used before `init`/`start`
    #[error("Transport not started: {transport}")]
    NotStarted { transport: String },
}

/// Session management errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// No session exists for the peer
    #[error("No session with {peer}")]
    NoSession { peer: String },

    /// Handshake went unanswered after all retries
    #[error("Handshake with {peer} timed out")]
    HandshakeTimeout { peer: String },

    /// Counter already consumed
    #[error("Replay detected: counter {counter}")]
    ReplayDetected { counter: u32 },

    /// Counter too far beyond the receiving chain
    #[error("Message counter {counter} too far ahead of {current} (max skip {max_skip})")]
    TooFarAhead {
        counter: u32,
        current: u32,
        max_skip: u32,
    },

    /// A one-time prekey id was not available
    #[error("One-time prekey {id} exhausted")]
    OneTimePrekeyExhausted { id: u32 },

    /// Signed prekey referenced by a handshake is unknown
    #[error("Unknown signed prekey {id}")]
    UnknownSignedPrekey { id: u32 },

    /// Invalid session state for operation
    #[error("Invalid session state: {state}")]
    InvalidState { state: String },
}

/// Group session errors
#[derive(Error, Debug, Clone)]
pub enum GroupError {
    /// Message epoch unknown or retired beyond the history window
    #[error("Group {group} epoch mismatch: message {message_epoch}, current {current_epoch}")]
    EpochMismatch {
        group: String,
        message_epoch: u64,
        current_epoch: u64,
    },

    /// Group not known locally
    #[error("Unknown group: {group}")]
    UnknownGroup { group: String },

    /// Sender has no key registered for this epoch
    #[error("No sender key from {sender} in group {group}")]
    MissingSenderKey { group: String, sender: String },

    /// Operation requires membership
    #[error("{peer} is not a member of {group}")]
    NotMember { group: String, peer: String },
}

/// Store errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Record not found
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Status transition not allowed
    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Unsupported protocol version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u32 },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Frame larger than the configured maximum
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// No handler for protocol id
    #[error("Unknown protocol: {protocol_id}")]
    UnknownProtocol { protocol_id: String },
}

impl MessengerError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Maps this error onto the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(NetworkError::MalformedAddress { .. }) => ErrorKind::MalformedAddress,
            Self::Network(NetworkError::Unreachable { .. }) => ErrorKind::Unreachable,
            Self::Session(SessionError::HandshakeTimeout { .. }) => ErrorKind::HandshakeTimeout,
            Self::Crypto(CryptoError::InvalidBundleSignature) => ErrorKind::InvalidBundleSignature,
            Self::Crypto(CryptoError::AuthenticationFailed) => ErrorKind::AuthenticationFailed,
            Self::Session(SessionError::ReplayDetected { .. }) => ErrorKind::ReplayDetected,
            Self::Session(SessionError::TooFarAhead { .. }) => ErrorKind::TooFarAhead,
            Self::Session(SessionError::OneTimePrekeyExhausted { .. }) => {
                ErrorKind::OneTimePrekeyExhausted
            }
            Self::Group(GroupError::EpochMismatch { .. }) => ErrorKind::GroupEpochMismatch,
            _ => ErrorKind::Other,
        }
    }

    /// Returns true if this error is a transport failure worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::ConnectionClosed { .. })
                | Self::Network(NetworkError::Transport { .. })
        )
    }

    /// Returns true if this error indicates corruption or an attack
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::InvalidBundleSignature)
                | Self::Crypto(CryptoError::AuthenticationFailed)
                | Self::Session(SessionError::ReplayDetected { .. })
                | Self::Session(SessionError::TooFarAhead { .. })
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MessengerError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<tokio::time::error::Elapsed> for MessengerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Network(NetworkError::Timeout {
            operation: "elapsed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MessengerError::Crypto(CryptoError::InvalidLength {
            what: "key",
            expected: 32,
            actual: 31,
        });
        assert!(error.to_string().contains("expected 32, got 31"));
    }

    #[test]
    fn test_kind_mapping() {
        let replay: MessengerError = SessionError::ReplayDetected { counter: 3 }.into();
        assert_eq!(replay.kind(), ErrorKind::ReplayDetected);

        let unreachable: MessengerError = NetworkError::Unreachable {
            peer: "x".to_string(),
        }
        .into();
        assert_eq!(unreachable.kind(), ErrorKind::Unreachable);

        let epoch: MessengerError = GroupError::EpochMismatch {
            group: "g".to_string(),
            message_epoch: 2,
            current_epoch: 1,
        }
        .into();
        assert_eq!(epoch.kind(), ErrorKind::GroupEpochMismatch);

        let io: MessengerError = std::io::Error::other("disk").into();
        assert_eq!(io.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_error_recovery() {
        let timeout_error = MessengerError::Network(NetworkError::Timeout {
            operation: "connect".to_string(),
        });
        assert!(timeout_error.is_recoverable());

        let crypto_error = MessengerError::Crypto(CryptoError::AuthenticationFailed);
        assert!(!crypto_error.is_recoverable());
    }

    #[test]
    fn test_security_violations() {
        let auth = MessengerError::Crypto(CryptoError::AuthenticationFailed);
        assert!(auth.is_security_violation());

        let network_error = MessengerError::Network(NetworkError::Timeout {
            operation: "connect".to_string(),
        });
        assert!(!network_error.is_security_violation());
    }
}
