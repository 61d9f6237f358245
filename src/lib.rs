//! # Secure Wallet Messenger
//!
//! A transport-agnostic peer-to-peer messaging core. Peers are identified by
//! wallet addresses, sessions are bootstrapped with X3DH and protected by the
//! Double Ratchet, and groups use per-sender keys that rotate with membership.
//!
//! ## Features
//!
//! - **End-to-End Encryption**: Double Ratchet sessions with forward secrecy
//! - **Key Agreement**: X3DH over signed prekey bundles
//! - **Multi-Transport**: radio, data channel, direct socket and relay links
//!   behind one manager that dials in priority order
//! - **Group Messaging**: sender keys with epochs on membership change
//! - **Identity Verification**: pinned identity keys and safety numbers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use secure_wallet_messenger::{App, ChainType, MessengerConfig, PeerId, Platform, UserProfile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = UserProfile::new(PeerId::new("0xA11CE", ChainType::Ethereum, "Alice"));
//!     let platform = Platform::standalone(&profile.peer);
//!     let app = App::new(MessengerConfig::default(), profile, platform).await?;
//!     app.start().await?;
//!
//!     println!("{}", app.messaging().export_bundle()?);
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`identity`]: Peer identities, transport addresses and the peer table
//! - [`crypto`]: Primitives, identity keys and prekey bundles
//! - [`session`]: X3DH and the Double Ratchet
//! - [`group`]: Sender-key groups
//! - [`store`]: Storage traits and in-memory stores
//! - [`transport`]: Concrete transports and the transport manager
//! - [`messaging`]: Envelopes, contacts and the messaging orchestrator
//! - [`app`]: Wiring of all of the above
//! - [`utils`]: Configuration, errors and caches

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod group;
pub mod identity;
pub mod messaging;
pub mod session;
pub mod store;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{App, Platform};
pub use crypto::{IdentityKeyPair, PreKeyBundle, UserProfile};
pub use group::GroupId;
pub use identity::{Address, ChainType, PeerId, TransportKind};
pub use messaging::{MessagingEvent, MessagingService, PROTOCOL_VERSION};
pub use session::SessionService;
pub use store::{MessageId, MessageStatus};
pub use transport::TransportManager;
pub use utils::{MessengerConfig, MessengerError, Result};

/// Maximum message size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default port for direct socket links
    pub const DEFAULT_PORT: u16 = 4001;

    /// Default port of a relay server
    pub const DEFAULT_RELAY_PORT: u16 = 4002;

    /// Default maximum number of live links
    pub const DEFAULT_MAX_PEERS: usize = 50;

    /// Default session handshake timeout in seconds
    pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 30;
}
