//! Identity keys and Ed25519 cryptographic operations.
//!
//! Each wallet identity owns one long-term Ed25519 key pair. The same key is
//! used to sign prekeys and, converted to its Montgomery form, as the X25519
//! identity key inside the handshake.

use crate::crypto::primitives::{fixed, sha256};
use crate::identity::PeerId;
use crate::utils::{CryptoError, Result};
use curve25519_dalek::MontgomeryPoint;
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

/// Number of SHA-256 iterations behind a safety-number half
const SAFETY_NUMBER_ITERATIONS: usize = 5200;

/// Ed25519 key pair for cryptographic identity operations
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key())
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create an identity key pair from a secret key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidLength` if the secret is not 32 bytes
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let bytes = fixed::<SECRET_KEY_LENGTH>("identity secret", secret_bytes)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Public half of this identity
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Sign a message with this identity
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }

    /// X25519 secret equivalent of the signing key, for Diffie-Hellman
    pub fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }
}

/// Public Ed25519 identity key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityPublicKey(#[serde(with = "serde_bytes")] pub [u8; PUBLIC_KEY_LENGTH]);

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({})", &hex::encode(self.0)[..16])
    }
}

impl IdentityPublicKey {
    /// Validate length and wrap
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(fixed::<PUBLIC_KEY_LENGTH>("identity public key", bytes)?))
    }

    fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| {
            CryptoError::InvalidKey {
                reason: "identity key is not a valid Ed25519 point".to_string(),
            }
            .into()
        })
    }

    /// Verify a signature made by this identity
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature = fixed::<SIGNATURE_LENGTH>("signature", signature)
            .map_err(|_| CryptoError::SignatureVerification)?;
        self.verifying_key()?
            .verify(message, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::SignatureVerification.into())
    }

    /// X25519 public equivalent, matching [`IdentityKeyPair::to_x25519`]
    pub fn to_x25519(&self) -> Result<PublicKey> {
        let point: MontgomeryPoint = self.verifying_key()?.to_montgomery();
        Ok(PublicKey::from(point.to_bytes()))
    }

    /// SHA-256 fingerprint of the key
    pub fn fingerprint(&self) -> [u8; 32] {
        sha256(&self.0)
    }
}

/// Compute the 30-digit half of a safety number for one side
fn safety_number_half(key: &IdentityPublicKey, stable_id: &str) -> String {
    let mut digest = sha256(&[&key.0[..], stable_id.as_bytes()].concat());
    for _ in 1..SAFETY_NUMBER_ITERATIONS {
        digest = sha256(&[&digest[..], &key.0[..]].concat());
    }

    digest
        .chunks(5)
        .take(6)
        .map(|chunk| {
            let value = chunk
                .iter()
                .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
            format!("{:05}", value % 100_000)
        })
        .collect()
}

/// Order-independent 60-digit safety number for two identities.
///
/// Both peers compute the same string; comparing it out of band confirms
/// neither identity key was substituted.
pub fn safety_number(
    a: (&PeerId, &IdentityPublicKey),
    b: (&PeerId, &IdentityPublicKey),
) -> String {
    let mut halves = [
        safety_number_half(a.1, &a.0.to_string()),
        safety_number_half(b.1, &b.0.to_string()),
    ];
    halves.sort();
    halves.concat()
}

/// Local identity: who we are plus the private key material
#[derive(Debug, Clone)]
pub struct UserProfile {
    /// Public peer identity
    pub peer: PeerId,
    /// The private key pair for this user
    pub keypair: IdentityKeyPair,
}

impl UserProfile {
    /// Create a new user profile with a generated key pair
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            keypair: IdentityKeyPair::generate(),
        }
    }

    /// Create a user profile from existing key material
    pub fn from_keypair(peer: PeerId, keypair: IdentityKeyPair) -> Self {
        Self { peer, keypair }
    }

    /// Public identity key
    pub fn identity_key(&self) -> IdentityPublicKey {
        self.keypair.public_key()
    }

    /// Sign a message with this user's private key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.keypair.sign(message)
    }

    /// Export the private key material for backup/storage
    pub fn export_private_key(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.keypair.secret_key_bytes()
    }
}
