//! Cryptographic primitives and identity management.
//!
//! This module provides the symmetric primitives, the long-term identity
//! keys, and prekey generation used by the handshake.

pub mod identity;
pub mod prekeys;
pub mod primitives;

pub use identity::*;
pub use prekeys::*;
pub use primitives::{SymmetricKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
