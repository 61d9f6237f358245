//! Pairwise session protocol: X3DH bootstrap and the Double Ratchet.

pub mod ratchet;
pub mod service;
pub mod x3dh;

pub use ratchet::{RatchetHeader, RatchetLimits, RatchetMessage, SessionState, MAX_SKIP};
pub use service::{PreKeyMessage, SessionMessage, SessionRecord, SessionService, SessionStatus};
pub use x3dh::{InitialKeys, PreKeyHeader, X3DHInitiator, X3DHRecipient};
