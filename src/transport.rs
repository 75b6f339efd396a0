//! Asymmetric transport of the content-encryption key
//!
//! The CEK travels to the device encrypted under the device's RSA wrapping
//! key with OAEP padding. The parameter set is fixed: SHA-256 as the OAEP
//! digest, SHA-1 for MGF1 and an empty label. This is what hardware
//! keystores expect when unwrapping a secure-import structure; using
//! MGF1-SHA-256 instead produces ciphertext the device cannot open.

use crate::types::ContentEncryptionKey;
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

/// Smallest wrapping key accepted; OAEP-SHA256 needs room for a 256-bit key
pub const MIN_WRAPPING_KEY_BITS: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Key wrapping failed: {0}")]
    WrapError(String),

    #[error("Key unwrapping failed: {0}")]
    UnwrapError(String),

    #[error("Invalid ciphertext length: expected {expected} bytes (modulus size), got {actual}")]
    InvalidCiphertextLength { expected: usize, actual: usize },

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Wrapping key too small: {0} bits")]
    KeyTooSmall(usize),
}

/// Trait for key encapsulation mechanisms
///
/// Implemented by the RSA-OAEP transport; the associated types keep the
/// key representation up to the implementation.
pub trait KeyEncapsulation {
    /// Public key type
    type PublicKey;

    /// Private key type
    type PrivateKey;

    /// Wrapped key type (ciphertext)
    type WrappedKey;

    /// Wrap a symmetric key with a public key
    fn wrap(
        &self,
        key: &[u8],
        public_key: &Self::PublicKey,
    ) -> Result<Self::WrappedKey, TransportError>;

    /// Unwrap a symmetric key with a private key
    fn unwrap(
        &self,
        wrapped: &Self::WrappedKey,
        private_key: &Self::PrivateKey,
    ) -> Result<Vec<u8>, TransportError>;
}

/// RSA-OAEP with SHA-256 digest and MGF1-SHA-1
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaOaepTransport;

impl RsaOaepTransport {
    pub fn new() -> Self {
        RsaOaepTransport
    }

    fn padding() -> Oaep {
        Oaep::new_with_mgf_hash::<Sha256, Sha1>()
    }
}

impl KeyEncapsulation for RsaOaepTransport {
    type PublicKey = RsaPublicKey;
    type PrivateKey = RsaPrivateKey;
    type WrappedKey = Vec<u8>;

    fn wrap(&self, key: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, TransportError> {
        public_key
            .encrypt(&mut OsRng, Self::padding(), key)
            .map_err(|e| TransportError::WrapError(format!("RSA-OAEP encryption failed: {}", e)))
    }

    fn unwrap(
        &self,
        wrapped: &Vec<u8>,
        private_key: &RsaPrivateKey,
    ) -> Result<Vec<u8>, TransportError> {
        let expected = private_key.size();
        if wrapped.len() != expected {
            return Err(TransportError::InvalidCiphertextLength {
                expected,
                actual: wrapped.len(),
            });
        }

        private_key
            .decrypt(Self::padding(), wrapped)
            .map_err(|e| TransportError::UnwrapError(format!("RSA-OAEP decryption failed: {}", e)))
    }
}

/// Encrypt the CEK to the recipient's wrapping key
pub fn encrypt_cek(
    cek: &ContentEncryptionKey,
    recipient: &RsaPublicKey,
) -> Result<Vec<u8>, TransportError> {
    RsaOaepTransport.wrap(cek.key().as_slice(), recipient)
}

/// Generate an RSA wrapping key pair of `bits` modulus length
pub fn generate_wrapping_key(bits: usize) -> Result<RsaPrivateKey, TransportError> {
    if bits < MIN_WRAPPING_KEY_BITS {
        return Err(TransportError::KeyTooSmall(bits));
    }
    RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| TransportError::KeyGeneration(e.to_string()))
}
