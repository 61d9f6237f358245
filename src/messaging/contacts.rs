//! Contacts directory with out-of-band identity verification.
//!
//! A contact pins the identity key first seen for a peer. The verification
//! flag is only set by comparing safety numbers, and is cleared whenever the
//! pinned key changes.

use crate::crypto::{safety_number, IdentityPublicKey, UserProfile};
use crate::identity::{ChainType, PeerId};
use crate::utils::{Result, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    /// Identity, carrying the display name
    pub peer: PeerId,
    /// Identity key pinned for this contact
    pub identity_key: Option<IdentityPublicKey>,
    /// Safety number confirmed out of band
    pub verified: bool,
    /// When the contact was added
    pub added_at: DateTime<Utc>,
}

/// Outcome of pinning an identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChange {
    /// First key seen for the contact
    Pinned,
    /// Same key as before
    Unchanged,
    /// A different key replaced the pinned one; verification was cleared
    Changed,
}

/// Contacts keyed by [`PeerId`]
#[derive(Debug, Default)]
pub struct ContactDirectory {
    contacts: RwLock<HashMap<PeerId, Contact>>,
}

impl ContactDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact, or refresh the display name of an existing one
    pub fn add(&self, peer: PeerId) -> Contact {
        let mut contacts = self.contacts.write();
        let contact = contacts.entry(peer.clone()).or_insert_with(|| Contact {
            peer: peer.clone(),
            identity_key: None,
            verified: false,
            added_at: Utc::now(),
        });
        if !peer.display_name().is_empty() {
            contact.peer = peer;
        }
        contact.clone()
    }

    /// Remove a contact
    pub fn remove(&self, peer: &PeerId) -> Option<Contact> {
        self.contacts.write().remove(peer)
    }

    /// Contact for an identity
    pub fn get(&self, peer: &PeerId) -> Option<Contact> {
        self.contacts.read().get(peer).cloned()
    }

    /// Contact by wallet address and chain
    pub fn lookup(&self, address: &str, chain_type: ChainType) -> Option<Contact> {
        self.get(&PeerId::new(address, chain_type, ""))
    }

    /// All contacts, sorted by identity
    pub fn all(&self) -> Vec<Contact> {
        let mut all: Vec<Contact> = self.contacts.read().values().cloned().collect();
        all.sort_by(|a, b| a.peer.to_string().cmp(&b.peer.to_string()));
        all
    }

    /// Pin the identity key a peer presented, adding the contact if needed
    pub fn pin_identity(&self, peer: &PeerId, key: IdentityPublicKey) -> KeyChange {
        let mut contacts = self.contacts.write();
        let contact = contacts.entry(peer.clone()).or_insert_with(|| Contact {
            peer: peer.clone(),
            identity_key: None,
            verified: false,
            added_at: Utc::now(),
        });

        match contact.identity_key {
            None => {
                contact.identity_key = Some(key);
                KeyChange::Pinned
            }
            Some(known) if known == key => KeyChange::Unchanged,
            Some(_) => {
                log::warn!("Identity key of {} changed; verification cleared", peer);
                contact.identity_key = Some(key);
                contact.verified = false;
                KeyChange::Changed
            }
        }
    }

    /// Safety number between us and a contact's pinned key
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` when no key is pinned for the peer.
    pub fn safety_number(&self, local: &UserProfile, peer: &PeerId) -> Result<String> {
        let key = self
            .get(peer)
            .and_then(|contact| contact.identity_key)
            .ok_or_else(|| StoreError::NotFound {
                key: format!("identity key of {peer}"),
            })?;
        Ok(safety_number(
            (&local.peer, &local.identity_key()),
            (peer, &key),
        ))
    }

    /// Compare a safety number read out of band and set the flag on a match.
    ///
    /// Spaces in `presented` are ignored. Returns whether it matched; a
    /// mismatch leaves the contact unverified.
    pub fn verify(&self, local: &UserProfile, peer: &PeerId, presented: &str) -> Result<bool> {
        let expected = self.safety_number(local, peer)?;
        let presented: String = presented.chars().filter(|c| !c.is_whitespace()).collect();
        let matched = presented == expected;

        if let Some(contact) = self.contacts.write().get_mut(peer) {
            contact.verified = matched;
        }
        if matched {
            log::info!("Verified identity of {}", peer);
        } else {
            log::warn!("Safety number mismatch for {}", peer);
        }
        Ok(matched)
    }
}
