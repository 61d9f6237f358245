//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! X3DH lets two parties that have never communicated agree on a shared
//! secret while the responder is offline: the initiator combines its identity
//! and a fresh ephemeral key with the responder's published prekey bundle,
//! and the responder repeats the combination from its private prekeys once
//! the first message arrives. The secret is expanded through HKDF into the
//! root key and the two initial chain keys of the ratchet.

use crate::crypto::primitives::{hkdf_expand, SymmetricKey, KEY_SIZE};
use crate::crypto::{IdentityKeyPair, IdentityPublicKey, PreKeyBundle};
use crate::store::PreKeyStore;
use crate::utils::{CryptoError, Result, SessionError};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

/// HKDF info for the X3DH master secret
const X3DH_INFO: &[u8] = b"swm-x3dh-v1";

/// HKDF info for splitting the master secret into ratchet keys
const INITIAL_KEYS_INFO: &[u8] = b"swm-x3dh-initial-keys";

/// Curve25519 discontinuity prefix mixed in front of the DH outputs
const X3DH_PREFIX: [u8; 32] = [0xFF; 32];

/// Handshake fields carried in front of the initiator's first messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyHeader {
    /// Initiator's long-term identity key
    pub identity_key: IdentityPublicKey,
    /// Initiator's ephemeral X25519 key (the session base key)
    #[serde(with = "serde_bytes")]
    pub ephemeral_key: [u8; KEY_SIZE],
    /// Signed prekey the initiator used
    pub signed_prekey_id: u32,
    /// One-time prekey the initiator used, if the bundle had one
    pub one_time_prekey_id: Option<u32>,
}

/// Keys derived from the X3DH master secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialKeys {
    /// First root key
    pub root_key: SymmetricKey,
    /// Chain the initiator sends on
    pub initiator_chain: SymmetricKey,
    /// Chain the responder sends on
    pub responder_chain: SymmetricKey,
    /// `IK_initiator || IK_responder`, bound into every message
    pub associated_data: Vec<u8>,
}

impl InitialKeys {
    fn derive(
        master: &SymmetricKey,
        initiator: &IdentityPublicKey,
        responder: &IdentityPublicKey,
    ) -> Result<Self> {
        let okm = hkdf_expand::<{ 3 * KEY_SIZE }>(None, master.as_bytes(), INITIAL_KEYS_INFO)?;
        let mut associated_data = Vec::with_capacity(2 * KEY_SIZE);
        associated_data.extend_from_slice(&initiator.0);
        associated_data.extend_from_slice(&responder.0);

        Ok(Self {
            root_key: SymmetricKey::from_slice(&okm[..KEY_SIZE])?,
            initiator_chain: SymmetricKey::from_slice(&okm[KEY_SIZE..2 * KEY_SIZE])?,
            responder_chain: SymmetricKey::from_slice(&okm[2 * KEY_SIZE..])?,
            associated_data,
        })
    }
}

/// Outcome of [`X3DHInitiator::initiate`]
pub struct Initiation {
    /// Header to attach to outgoing messages until the responder answers
    pub header: PreKeyHeader,
    /// Derived ratchet keys
    pub keys: InitialKeys,
    /// Ephemeral secret, reused as the first ratchet key pair
    pub ephemeral: StaticSecret,
    /// Responder's signed prekey, the first remote ratchet key
    pub remote_ratchet_key: PublicKey,
    /// Responder's identity
    pub remote_identity: IdentityPublicKey,
}

/// Outcome of [`X3DHRecipient::receive`]
pub struct Reception {
    /// Derived ratchet keys
    pub keys: InitialKeys,
    /// Private half of the signed prekey, the first local ratchet key pair
    pub signed_prekey: StaticSecret,
    /// Initiator's ephemeral key, the first remote ratchet key
    pub remote_ratchet_key: PublicKey,
}

fn contributory(secret: SharedSecret) -> Result<SharedSecret> {
    if secret.was_contributory() {
        Ok(secret)
    } else {
        Err(CryptoError::InvalidKey {
            reason: "low-order point in key agreement".to_string(),
        }
        .into())
    }
}

fn master_secret(dh_outputs: &[SharedSecret]) -> Result<SymmetricKey> {
    let mut ikm = X3DH_PREFIX.to_vec();
    for dh in dh_outputs {
        ikm.extend_from_slice(dh.as_bytes());
    }
    let secret = hkdf_expand::<KEY_SIZE>(Some(&[0u8; KEY_SIZE]), &ikm, X3DH_INFO);
    zeroize::Zeroize::zeroize(&mut ikm);
    Ok(SymmetricKey::from_bytes(secret?))
}

/// X3DH key agreement initiator
pub struct X3DHInitiator<'a> {
    identity: &'a IdentityKeyPair,
    ephemeral: StaticSecret,
}

impl<'a> X3DHInitiator<'a> {
    /// Create an initiator with a fresh ephemeral key
    ///
    /// # Arguments
    ///
    /// * `identity` - The initiator's identity key pair
    pub fn new(identity: &'a IdentityKeyPair) -> Self {
        Self {
            identity,
            ephemeral: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Perform the key agreement against a responder's bundle
    ///
    /// The bundle signature is verified before any key in it is used. The
    /// first one-time prekey of the bundle is used when present.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidBundleSignature` if the bundle does not
    /// verify, or `CryptoError::InvalidKey` for unusable key material.
    pub fn initiate(self, bundle: &PreKeyBundle) -> Result<Initiation> {
        bundle.verify()?;

        let identity_secret = self.identity.to_x25519();
        let remote_identity = bundle.identity_key.to_x25519()?;
        let signed_prekey = bundle.signed_prekey.public_key();
        let one_time = bundle.first_one_time_prekey();

        let mut outputs = vec![
            // DH1 = DH(IK_A, SPK_B)
            contributory(identity_secret.diffie_hellman(&signed_prekey))?,
            // DH2 = DH(EK_A, IK_B)
            contributory(self.ephemeral.diffie_hellman(&remote_identity))?,
            // DH3 = DH(EK_A, SPK_B)
            contributory(self.ephemeral.diffie_hellman(&signed_prekey))?,
        ];
        if let Some(otk) = one_time {
            // DH4 = DH(EK_A, OPK_B)
            outputs.push(contributory(self.ephemeral.diffie_hellman(&otk.public_key()))?);
        }

        let master = master_secret(&outputs)?;
        let keys = InitialKeys::derive(&master, &self.identity.public_key(), &bundle.identity_key)?;

        let header = PreKeyHeader {
            identity_key: self.identity.public_key(),
            ephemeral_key: PublicKey::from(&self.ephemeral).to_bytes(),
            signed_prekey_id: bundle.signed_prekey.id,
            one_time_prekey_id: one_time.map(|otk| otk.id),
        };

        Ok(Initiation {
            header,
            keys,
            ephemeral: self.ephemeral,
            remote_ratchet_key: signed_prekey,
            remote_identity: bundle.identity_key,
        })
    }
}

/// X3DH key agreement responder
pub struct X3DHRecipient<'a> {
    identity: &'a IdentityKeyPair,
    prekeys: &'a dyn PreKeyStore,
}

impl<'a> X3DHRecipient<'a> {
    /// Create a responder over the local identity and prekey store
    pub fn new(identity: &'a IdentityKeyPair, prekeys: &'a dyn PreKeyStore) -> Self {
        Self { identity, prekeys }
    }

    /// Derive the initiator's keys from our private prekeys.
    ///
    /// The referenced one-time prekey is consumed atomically, so a second
    /// handshake naming the same key fails.
    ///
    /// # Errors
    ///
    /// * `SessionError::UnknownSignedPrekey` - the signed prekey is not retained
    /// * `SessionError::OneTimePrekeyExhausted` - the one-time prekey is gone
    pub fn receive(&self, header: &PreKeyHeader) -> Result<Reception> {
        let signed_prekey = self
            .prekeys
            .signed_secret(header.signed_prekey_id)
            .ok_or(SessionError::UnknownSignedPrekey {
                id: header.signed_prekey_id,
            })?;
        let one_time = header
            .one_time_prekey_id
            .map(|id| self.prekeys.consume_one_time(id))
            .transpose()?;

        let identity_secret = self.identity.to_x25519();
        let remote_identity = header.identity_key.to_x25519()?;
        let remote_ephemeral = PublicKey::from(header.ephemeral_key);

        let mut outputs = vec![
            contributory(signed_prekey.diffie_hellman(&remote_identity))?,
            contributory(identity_secret.diffie_hellman(&remote_ephemeral))?,
            contributory(signed_prekey.diffie_hellman(&remote_ephemeral))?,
        ];
        if let Some(otk) = one_time {
            outputs.push(contributory(otk.diffie_hellman(&remote_ephemeral))?);
        }

        let master = master_secret(&outputs)?;
        let keys = InitialKeys::derive(&master, &header.identity_key, &self.identity.public_key())?;

        Ok(Reception {
            keys,
            signed_prekey,
            remote_ratchet_key: remote_ephemeral,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{PrekeyManager, UserProfile};
    use crate::identity::{ChainType, PeerId};
    use crate::store::MemoryPreKeyStore;
    use crate::utils::ErrorKind;
    use std::sync::Arc;

    fn setup(one_time: usize) -> (UserProfile, UserProfile, Arc<MemoryPreKeyStore>, PreKeyBundle) {
        let alice = UserProfile::new(PeerId::new("0xA11CE", ChainType::Ethereum, "Alice"));
        let bob = UserProfile::new(PeerId::new("0xB0B", ChainType::Ethereum, "Bob"));
        let store = Arc::new(MemoryPreKeyStore::new());
        let bundle = PrekeyManager::new(store.clone()).generate_bundle(&bob, one_time);
        (alice, bob, store, bundle)
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let (alice, bob, store, bundle) = setup(1);

        let initiation = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap();
        assert_eq!(initiation.header.one_time_prekey_id, Some(bundle.one_time_prekeys[0].id));

        let reception = X3DHRecipient::new(&bob.keypair, store.as_ref())
            .receive(&initiation.header)
            .unwrap();

        assert_eq!(initiation.keys, reception.keys);
        assert_ne!(initiation.keys.initiator_chain, initiation.keys.responder_chain);
        assert_eq!(
            reception.remote_ratchet_key.to_bytes(),
            initiation.header.ephemeral_key
        );
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let (alice, bob, store, bundle) = setup(0);

        let initiation = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap();
        assert!(initiation.header.one_time_prekey_id.is_none());

        let reception = X3DHRecipient::new(&bob.keypair, store.as_ref())
            .receive(&initiation.header)
            .unwrap();
        assert_eq!(initiation.keys, reception.keys);
    }

    #[test]
    fn test_one_time_prekey_single_use() {
        let (alice, bob, store, bundle) = setup(1);
        let initiation = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap();
        let recipient = X3DHRecipient::new(&bob.keypair, store.as_ref());

        assert!(recipient.receive(&initiation.header).is_ok());
        let err = recipient.receive(&initiation.header).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::OneTimePrekeyExhausted);
    }

    #[test]
    fn test_x3dh_invalid_bundle() {
        let (alice, _bob, _store, mut bundle) = setup(1);
        let mallory = UserProfile::new(PeerId::new("0xBAD", ChainType::Ethereum, "Mallory"));
        bundle.identity_key = mallory.identity_key();

        let err = X3DHInitiator::new(&alice.keypair).initiate(&bundle).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidBundleSignature);
    }

    #[test]
    fn test_unknown_signed_prekey() {
        let (alice, bob, store, bundle) = setup(0);
        let mut header = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap().header;
        header.signed_prekey_id += 100;

        assert!(X3DHRecipient::new(&bob.keypair, store.as_ref()).receive(&header).is_err());
    }

    #[test]
    fn test_fresh_ephemeral_per_initiation() {
        let (alice, _bob, _store, bundle) = setup(0);
        let first = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap();
        let second = X3DHInitiator::new(&alice.keypair).initiate(&bundle).unwrap();

        assert_ne!(first.header.ephemeral_key, second.header.ephemeral_key);
        assert_ne!(first.keys.root_key, second.keys.root_key);
    }
}
