//! Symmetric primitives shared by the session and group layers.
//!
//! - AES-256-GCM with a fresh random 96-bit nonce per call. The nonce is
//!   prepended to the ciphertext so the output is `nonce || ciphertext || tag`.
//! - HKDF-SHA256 for expanding shared secrets into directional keys.
//! - HMAC-SHA256 for chain-key advancement.
//! - SHA-256 for fingerprints.
//!
//! All key material is fixed length. Anything else is rejected with
//! [`CryptoError::InvalidLength`] before it reaches a cipher.

use crate::utils::{CryptoError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Symmetric key length in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM tag length in bytes
pub const TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// A 256-bit symmetric key, wiped on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey([REDACTED])")
    }
}

impl SymmetricKey {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Validate length and wrap
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(fixed::<KEY_SIZE>("key", bytes)?))
    }

    /// Fresh random key from OS entropy
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Copy `bytes` into a fixed array, failing on any other length
pub fn fixed<const N: usize>(what: &'static str, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        CryptoError::InvalidLength {
            what,
            expected: N,
            actual: bytes.len(),
        }
        .into()
    })
}

/// Encrypt with AES-256-GCM under a fresh random nonce.
///
/// Returns `nonce || ciphertext || tag`.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption {
            reason: "AES-256-GCM encryption failed".to_string(),
        })?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt `nonce || ciphertext || tag`. Fails closed on any tag mismatch.
pub fn decrypt(key: &SymmetricKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::AuthenticationFailed.into());
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

    cipher
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed.into())
}

/// HKDF-SHA256 extract-and-expand into `N` bytes
pub fn hkdf_expand<const N: usize>(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<[u8; N]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hkdf.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation {
            reason: format!("HKDF expansion to {N} bytes failed"),
        })?;
    Ok(okm)
}

/// HMAC-SHA256 over `data`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| {
        CryptoError::KeyDerivation {
            reason: format!("HMAC-SHA256 key init failed: {e}"),
        }
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Fill a fixed array from OS entropy
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{ErrorKind, MessengerError};

    #[test]
    fn test_roundtrip_with_aad() {
        let key = SymmetricKey::random();
        for plaintext in [&b""[..], b"x", b"hello world", &[0u8; 4096][..]] {
            let sealed = encrypt(&key, plaintext, b"header").unwrap();
            assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
            assert_eq!(decrypt(&key, &sealed, b"header").unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = SymmetricKey::random();
        let a = encrypt(&key, b"same", b"").unwrap();
        let b = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_every_bit_flip_fails_closed() {
        let key = SymmetricKey::random();
        let sealed = encrypt(&key, b"attack at dawn", b"ad").unwrap();

        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                let err = decrypt(&key, &tampered, b"ad").unwrap_err();
                assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
            }
        }
    }

    #[test]
    fn test_wrong_aad_or_key_fails() {
        let key = SymmetricKey::random();
        let sealed = encrypt(&key, b"payload", b"ad").unwrap();
        assert!(decrypt(&key, &sealed, b"other").is_err());
        assert!(decrypt(&SymmetricKey::random(), &sealed, b"ad").is_err());
        assert!(decrypt(&key, &sealed[..NONCE_SIZE + TAG_SIZE - 1], b"ad").is_err());
    }

    #[test]
    fn test_length_validation() {
        assert!(SymmetricKey::from_slice(&[0u8; 31]).is_err());
        assert!(SymmetricKey::from_slice(&[0u8; 33]).is_err());
        assert!(SymmetricKey::from_slice(&[0u8; 32]).is_ok());

        let err = fixed::<NONCE_SIZE>("nonce", &[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Crypto(CryptoError::InvalidLength {
                expected: 12,
                actual: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_hkdf_rfc5869_case_1() {
        let ikm = [0x0bu8; 22];
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let info = hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap();
        let okm: [u8; 42] = hkdf_expand(Some(&salt), &ikm, &info).unwrap();
        assert_eq!(
            hex::encode(okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let tag = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sha256_empty() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
