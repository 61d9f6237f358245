//! Sender-key chains and the messages that carry them.

use super::GroupId;
use crate::crypto::primitives::{self, SymmetricKey};
use crate::crypto::{IdentityKeyPair, IdentityPublicKey};
use crate::identity::PeerId;
use crate::session::ratchet::chain_step;
use crate::utils::{BoundedCache, GroupError, Result, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;

const GROUP_MESSAGE_CONTEXT: &[u8] = b"swm-group-message-v1";

/// A member's sender key for one epoch, sent pairwise-encrypted to every
/// other member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyDistribution {
    /// Group
    pub group: GroupId,
    /// Epoch the key belongs to
    pub epoch: u64,
    /// Owner of the key
    pub sender: PeerId,
    /// Membership of the epoch as seen by the sender
    pub members: Vec<PeerId>,
    /// Chain key at `iteration`
    pub chain_key: SymmetricKey,
    /// Next iteration the sender will use
    pub iteration: u32,
    /// Key that signs the sender's group messages
    pub signing_key: IdentityPublicKey,
    /// Epoch the sender last sent under and the iteration its chain stopped
    /// at; receivers stop that retired chain there
    #[serde(default)]
    pub retired_chain: Option<(u64, u32)>,
}

/// Encrypted group payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Group
    pub group: GroupId,
    /// Epoch of the sender key used
    pub epoch: u64,
    /// Author
    pub sender: PeerId,
    /// Position in the sender chain
    pub iteration: u32,
    /// `nonce || ciphertext || tag`
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// Signature by the sender key's signing key
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
}

impl GroupMessage {
    fn header_bytes(group: &GroupId, epoch: u64, sender: &PeerId, iteration: u32) -> Vec<u8> {
        let group = group.as_str().as_bytes();
        let sender = sender.to_string();
        let mut out = Vec::with_capacity(GROUP_MESSAGE_CONTEXT.len() + group.len() + sender.len() + 16);
        out.extend_from_slice(GROUP_MESSAGE_CONTEXT);
        out.extend_from_slice(&(group.len() as u32).to_be_bytes());
        out.extend_from_slice(group);
        out.extend_from_slice(&epoch.to_be_bytes());
        out.extend_from_slice(sender.as_bytes());
        out.push(0);
        out.extend_from_slice(&iteration.to_be_bytes());
        out
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Self::header_bytes(&self.group, self.epoch, &self.sender, self.iteration);
        out.extend_from_slice(&self.ciphertext);
        out
    }
}

/// Our own sending chain for the current epoch
#[derive(Clone)]
pub(crate) struct SenderChain {
    pub(crate) epoch: u64,
    chain_key: SymmetricKey,
    iteration: u32,
    signing: IdentityKeyPair,
    retired: Option<(u64, u32)>,
}

impl fmt::Debug for SenderChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderChain")
            .field("epoch", &self.epoch)
            .field("iteration", &self.iteration)
            .field("chain_key", &"[REDACTED]")
            .finish()
    }
}

impl SenderChain {
    pub(crate) fn generate(epoch: u64) -> Self {
        Self {
            epoch,
            chain_key: SymmetricKey::random(),
            iteration: 0,
            signing: IdentityKeyPair::generate(),
            retired: None,
        }
    }

    /// Fresh chain for `epoch`, remembering where this one stopped
    pub(crate) fn rotate(&self, epoch: u64) -> Self {
        Self {
            retired: Some((self.epoch, self.iteration)),
            ..Self::generate(epoch)
        }
    }

    pub(crate) fn distribution(
        &self,
        group: &GroupId,
        sender: &PeerId,
        members: Vec<PeerId>,
    ) -> SenderKeyDistribution {
        SenderKeyDistribution {
            group: group.clone(),
            epoch: self.epoch,
            sender: sender.clone(),
            members,
            chain_key: self.chain_key.clone(),
            iteration: self.iteration,
            signing_key: self.signing.public_key(),
            retired_chain: self.retired,
        }
    }

    pub(crate) fn encrypt(
        &mut self,
        group: &GroupId,
        sender: &PeerId,
        plaintext: &[u8],
    ) -> Result<GroupMessage> {
        let iteration = self.iteration;
        let next_iteration = iteration.checked_add(1).ok_or_else(|| SessionError::InvalidState {
            state: "sender chain exhausted".to_string(),
        })?;
        let (message_key, next_chain_key) = chain_step(&self.chain_key)?;
        let aad = GroupMessage::header_bytes(group, self.epoch, sender, iteration);
        let ciphertext = primitives::encrypt(&message_key, plaintext, &aad)?;

        let mut message = GroupMessage {
            group: group.clone(),
            epoch: self.epoch,
            sender: sender.clone(),
            iteration,
            ciphertext,
            signature: [0u8; 64],
        };
        message.signature = self.signing.sign(&message.signed_bytes());

        self.chain_key = next_chain_key;
        self.iteration = next_iteration;
        Ok(message)
    }
}

/// A peer's chain as seen by a receiver
#[derive(Clone)]
pub(crate) struct ReceiverChain {
    chain_key: SymmetricKey,
    iteration: u32,
    signing_key: IdentityPublicKey,
    skipped: BoundedCache<u32, SymmetricKey>,
    /// Set when the epoch is retired: iterations at or past it are rejected
    frozen_at: Option<u32>,
}

impl fmt::Debug for ReceiverChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverChain")
            .field("iteration", &self.iteration)
            .field("skipped", &self.skipped.len())
            .field("frozen_at", &self.frozen_at)
            .finish()
    }
}

impl ReceiverChain {
    pub(crate) fn from_distribution(distribution: &SenderKeyDistribution, max_skip: u32) -> Self {
        Self {
            chain_key: distribution.chain_key.clone(),
            iteration: distribution.iteration,
            signing_key: distribution.signing_key,
            skipped: BoundedCache::new(max_skip as usize),
            frozen_at: None,
        }
    }

    pub(crate) fn signing_key(&self) -> &IdentityPublicKey {
        &self.signing_key
    }

    pub(crate) fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Stop accepting iterations we have not seen yet. Keys already
    /// skipped stay usable.
    pub(crate) fn freeze(&mut self) {
        if self.frozen_at.is_none() {
            self.frozen_at = Some(self.iteration);
        }
    }

    /// Move the freeze point up to where the sender says its chain stopped
    pub(crate) fn extend_freeze(&mut self, final_iteration: u32) {
        if let Some(frozen_at) = self.frozen_at.as_mut() {
            *frozen_at = (*frozen_at).max(final_iteration);
        }
    }

    /// Verify and decrypt. Callers run this on a copy and commit on success.
    pub(crate) fn decrypt(
        &mut self,
        message: &GroupMessage,
        max_skip: u32,
        current_epoch: u64,
    ) -> Result<Vec<u8>> {
        self.signing_key
            .verify(&message.signed_bytes(), &message.signature)?;
        let aad = GroupMessage::header_bytes(
            &message.group,
            message.epoch,
            &message.sender,
            message.iteration,
        );

        if let Some(message_key) = self.skipped.remove(&message.iteration) {
            return primitives::decrypt(&message_key, &message.ciphertext, &aad);
        }
        if message.iteration < self.iteration {
            return Err(SessionError::ReplayDetected {
                counter: message.iteration,
            }
            .into());
        }
        if let Some(frozen_at) = self.frozen_at {
            if message.iteration >= frozen_at {
                return Err(GroupError::EpochMismatch {
                    group: message.group.to_string(),
                    message_epoch: message.epoch,
                    current_epoch,
                }
                .into());
            }
        }
        if message.iteration - self.iteration > max_skip {
            return Err(SessionError::TooFarAhead {
                counter: message.iteration,
                current: self.iteration,
                max_skip,
            }
            .into());
        }

        while self.iteration < message.iteration {
            let (message_key, next_chain_key) = chain_step(&self.chain_key)?;
            self.skipped.insert(self.iteration, message_key);
            self.chain_key = next_chain_key;
            self.iteration += 1;
        }
        let (message_key, next_chain_key) = chain_step(&self.chain_key)?;
        let plaintext = primitives::decrypt(&message_key, &message.ciphertext, &aad)?;
        self.chain_key = next_chain_key;
        self.iteration = message.iteration.saturating_add(1);
        Ok(plaintext)
    }
}
