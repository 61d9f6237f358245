//! Signal-style prekey generation and the transferable prekey bundle.
//!
//! A bundle carries the long-term identity key, one signed prekey and zero or
//! more one-time prekeys. It is exchanged out of band (QR code, clipboard) as
//! base64 text or fetched from a connected peer. The private halves never
//! leave the [`PreKeyStore`].

use crate::crypto::identity::{IdentityPublicKey, UserProfile};
use crate::identity::PeerId;
use crate::store::PreKeyStore;
use crate::utils::{CryptoError, Result};
use base64::{engine::general_purpose, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

/// Number of one-time prekeys to generate by default
pub const DEFAULT_PREKEY_COUNT: usize = 100;

/// Maximum age of a signed prekey before rotation (30 days in seconds)
pub const SIGNED_PREKEY_MAX_AGE: i64 = 30 * 24 * 60 * 60;

/// Refill threshold for the one-time prekey pool
pub const PREKEY_LOW_WATER: usize = 10;

/// Domain separator for the signed-prekey signature
const SIGNED_PREKEY_CONTEXT: &[u8] = b"swm-signed-prekey-v1";

/// A one-time prekey for X3DH key agreement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekey {
    /// Unique identifier for this prekey
    pub id: u32,
    /// X25519 public key
    #[serde(with = "serde_bytes")]
    pub public_key: [u8; 32],
}

impl OneTimePrekey {
    /// Get the public key as an X25519 PublicKey
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.public_key)
    }
}

/// A signed prekey that proves ownership by the identity key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekey {
    /// Unique identifier for this signed prekey
    pub id: u32,
    /// X25519 public key
    #[serde(with = "serde_bytes")]
    pub public_key: [u8; 32],
    /// Ed25519 signature binding the key to the owning peer
    #[serde(with = "serde_bytes")]
    pub signature: [u8; 64],
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl SignedPrekey {
    fn signed_bytes(peer: &PeerId, id: u32, public_key: &[u8; 32]) -> Vec<u8> {
        let peer = peer.to_string();
        let mut bytes = Vec::with_capacity(SIGNED_PREKEY_CONTEXT.len() + 4 + 32 + peer.len());
        bytes.extend_from_slice(SIGNED_PREKEY_CONTEXT);
        bytes.extend_from_slice(&id.to_be_bytes());
        bytes.extend_from_slice(public_key);
        bytes.extend_from_slice(peer.as_bytes());
        bytes
    }

    /// Create a new signed prekey and its private half
    pub fn generate(id: u32, profile: &UserProfile) -> (Self, StaticSecret) {
        let private_key = StaticSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&private_key).to_bytes();
        let signature = profile.sign(&Self::signed_bytes(&profile.peer, id, &public_key));

        let signed_prekey = Self {
            id,
            public_key,
            signature,
            created_at: chrono::Utc::now(),
        };

        (signed_prekey, private_key)
    }

    /// Get the public key as an X25519 PublicKey
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.public_key)
    }

    /// Check if this signed prekey should be rotated
    pub fn should_rotate(&self) -> bool {
        chrono::Utc::now()
            .signed_duration_since(self.created_at)
            .num_seconds()
            > SIGNED_PREKEY_MAX_AGE
    }
}

/// Published public key material for asynchronous session setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Owner of the bundle
    pub peer: PeerId,
    /// Long-term identity key
    pub identity_key: IdentityPublicKey,
    /// Current signed prekey
    pub signed_prekey: SignedPrekey,
    /// Available one-time prekeys
    pub one_time_prekeys: Vec<OneTimePrekey>,
}

impl PreKeyBundle {
    /// Check the signed prekey signature against the identity key.
    ///
    /// Nothing in the bundle may be trusted before this succeeds.
    pub fn verify(&self) -> Result<()> {
        let signed = SignedPrekey::signed_bytes(
            &self.peer,
            self.signed_prekey.id,
            &self.signed_prekey.public_key,
        );
        self.identity_key
            .verify(&signed, &self.signed_prekey.signature)
            .map_err(|_| CryptoError::InvalidBundleSignature.into())
    }

    /// First available one-time prekey, if any
    pub fn first_one_time_prekey(&self) -> Option<&OneTimePrekey> {
        self.one_time_prekeys.first()
    }

    /// Take a one-time prekey out of the bundle
    pub fn take_one_time_prekey(&mut self) -> Option<OneTimePrekey> {
        if self.one_time_prekeys.is_empty() {
            None
        } else {
            Some(self.one_time_prekeys.remove(0))
        }
    }

    /// Encode for QR code or clipboard transfer
    pub fn to_transfer_string(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    /// Decode a transferred bundle and verify its signature
    pub fn from_transfer_string(encoded: &str) -> Result<Self> {
        let json = general_purpose::URL_SAFE_NO_PAD.decode(encoded.trim())?;
        let bundle: Self = serde_json::from_slice(&json)?;
        bundle.verify()?;
        Ok(bundle)
    }
}

/// Generates prekeys and keeps their private halves in a [`PreKeyStore`]
pub struct PrekeyManager {
    store: Arc<dyn PreKeyStore>,
}

impl PrekeyManager {
    /// Create a new prekey manager over a store
    pub fn new(store: Arc<dyn PreKeyStore>) -> Self {
        Self { store }
    }

    /// Generate and store a new signed prekey, making it current
    pub fn generate_signed_prekey(&self, profile: &UserProfile) -> SignedPrekey {
        let id = self.store.next_signed_prekey_id();
        let (signed_prekey, private_key) = SignedPrekey::generate(id, profile);
        self.store.put_signed(signed_prekey.clone(), private_key);
        log::debug!("Generated signed prekey {}", id);
        signed_prekey
    }

    /// Generate and store multiple one-time prekeys
    pub fn generate_one_time_prekeys(&self, count: usize) -> Vec<OneTimePrekey> {
        (0..count)
            .map(|_| {
                let id = self.store.next_one_time_prekey_id();
                let private_key = StaticSecret::random_from_rng(OsRng);
                let prekey = OneTimePrekey {
                    id,
                    public_key: PublicKey::from(&private_key).to_bytes(),
                };
                self.store.put_one_time(prekey.clone(), private_key);
                prekey
            })
            .collect()
    }

    /// Current signed prekey, rotating it when missing or too old
    pub fn current_signed_prekey(&self, profile: &UserProfile) -> SignedPrekey {
        match self.store.current_signed() {
            Some(current) if !current.should_rotate() => current,
            _ => self.generate_signed_prekey(profile),
        }
    }

    /// Generate a complete prekey bundle with `count` fresh one-time prekeys
    pub fn generate_bundle(&self, profile: &UserProfile, count: usize) -> PreKeyBundle {
        PreKeyBundle {
            peer: profile.peer.clone(),
            identity_key: profile.identity_key(),
            signed_prekey: self.current_signed_prekey(profile),
            one_time_prekeys: self.generate_one_time_prekeys(count),
        }
    }

    /// Bundle over the keys already in the pool, topping it up when low
    pub fn published_bundle(&self, profile: &UserProfile, target: usize) -> PreKeyBundle {
        let available = self.store.one_time_public_keys();
        if available.len() < PREKEY_LOW_WATER.min(target) {
            log::info!(
                "One-time prekey pool low ({} left), generating {}",
                available.len(),
                target - available.len()
            );
            self.generate_one_time_prekeys(target - available.len());
        }

        PreKeyBundle {
            peer: profile.peer.clone(),
            identity_key: profile.identity_key(),
            signed_prekey: self.current_signed_prekey(profile),
            one_time_prekeys: self.store.one_time_public_keys(),
        }
    }
}
