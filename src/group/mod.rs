//! Sender-key group messaging.
//!
//! Each member distributes a symmetric sender key to every other member over
//! the pairwise sessions and then encrypts group content once with it.
//! Membership changes start a new epoch.

pub mod sender_key;
pub mod session;

pub use sender_key::{GroupMessage, SenderKeyDistribution};
pub use session::GroupSession;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Group identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
