//! Cryptographic helper functions
//!
//! Randomness, nonce generation and AES-GCM cipher dispatch over the
//! three AES key sizes.

use aes_gcm::aead::{consts::U12, Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// AES-192 in GCM mode with a 96-bit nonce
pub type Aes192Gcm = AesGcm<aes::Aes192, U12>;

/// GCM nonce length in bytes (96 bits)
pub const GCM_NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes (128 bits)
pub const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("AEAD encryption failed")]
    EncryptionFailed,

    #[error("AEAD authentication failed")]
    AuthenticationFailed,
}

/// Fill a fresh buffer with bytes from the OS RNG
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Generate a random 96-bit nonce for AES-GCM
pub fn generate_nonce() -> [u8; GCM_NONCE_LEN] {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// AES-GCM encrypt; the returned buffer is `ciphertext || tag`
pub fn gcm_seal(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        16 => seal_with::<Aes128Gcm>(key, nonce, plaintext, aad),
        24 => seal_with::<Aes192Gcm>(key, nonce, plaintext, aad),
        32 => seal_with::<Aes256Gcm>(key, nonce, plaintext, aad),
        other => Err(CryptoError::InvalidKeyLength(other)),
    }
}

/// AES-GCM decrypt of `ciphertext || tag`
pub fn gcm_open(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    sealed: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match key.len() {
        16 => open_with::<Aes128Gcm>(key, nonce, sealed, aad),
        24 => open_with::<Aes192Gcm>(key, nonce, sealed, aad),
        32 => open_with::<Aes256Gcm>(key, nonce, sealed, aad),
        other => Err(CryptoError::InvalidKeyLength(other)),
    }
}

fn seal_with<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .encrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

fn open_with<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), Payload { msg, aad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_nonce() {
        let nonce1 = generate_nonce();
        let nonce2 = generate_nonce();
        // Nonces should be different (with overwhelming probability)
        assert_ne!(nonce1, nonce2);
    }

    #[test]
    fn test_random_bytes_len() {
        assert_eq!(random_bytes(24).len(), 24);
        assert_ne!(random_bytes(32), random_bytes(32));
    }

    #[test]
    fn test_seal_open_all_sizes() {
        for len in [16, 24, 32] {
            let key = random_bytes(len);
            let nonce = generate_nonce();
            let sealed = gcm_seal(&key, &nonce, b"payload", b"header").unwrap();
            assert_eq!(sealed.len(), b"payload".len() + GCM_TAG_LEN);
            let opened = gcm_open(&key, &nonce, &sealed, b"header").unwrap();
            assert_eq!(opened, b"payload");
        }
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = random_bytes(32);
        let nonce = generate_nonce();
        let sealed = gcm_seal(&key, &nonce, b"payload", b"header").unwrap();
        assert!(matches!(
            gcm_open(&key, &nonce, &sealed, b"other"),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_bad_key_length() {
        let nonce = generate_nonce();
        assert!(matches!(
            gcm_seal(&[0u8; 20], &nonce, b"x", b""),
            Err(CryptoError::InvalidKeyLength(20))
        ));
    }
}
