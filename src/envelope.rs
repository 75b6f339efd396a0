//! Authenticated envelope engine
//!
//! Two symmetric schemes live here:
//!
//! - [`wrap_key`] / [`unwrap_key`]: AES-GCM wrapping of a transport key under
//!   an ephemeral CEK, with the key description bound as AAD. The 128-bit tag
//!   is split from the ciphertext so the DER encoder can place it in its own
//!   field.
//! - [`encrypt_message`] / [`decrypt_message`]: AES-CBC with PKCS7 padding and
//!   a random 16-byte IV prepended to the output. Confidentiality only; used
//!   for plain message round-trips with an imported key.

use crate::helpers::{gcm_open, gcm_seal, generate_nonce, random_bytes, CryptoError};
use crate::helpers::{GCM_NONCE_LEN, GCM_TAG_LEN};
use crate::types::{AesKeySize, KeyError, SymmetricKey};
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

/// AES block size, also the CBC IV length
pub const CBC_IV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Integrity check failed: authentication tag mismatch")]
    IntegrityViolation,

    #[error("Invalid authentication tag length: expected 16, got {0}")]
    InvalidTagLength(usize),

    #[error("Ciphertext too short: {0} bytes")]
    TruncatedCiphertext(usize),

    #[error("Invalid PKCS7 padding")]
    InvalidPadding,

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Cipher error: {0}")]
    Cipher(String),
}

impl From<CryptoError> for EnvelopeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => EnvelopeError::IntegrityViolation,
            other => EnvelopeError::Cipher(other.to_string()),
        }
    }
}

/// Output of AES-GCM wrapping a transport key under a CEK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedTekWrapper {
    /// Encrypted key bytes, tag removed
    pub ciphertext: Vec<u8>,
    /// Detached 128-bit authentication tag
    pub tag: Vec<u8>,
    /// 96-bit GCM nonce
    pub iv: [u8; GCM_NONCE_LEN],
}

/// Wrap `tek` under `cek` with AES-GCM, authenticating `aad`
///
/// A fresh random IV is drawn for every call.
pub fn wrap_key(
    tek: &SymmetricKey,
    aad: &[u8],
    cek: &SymmetricKey,
) -> Result<EncryptedTekWrapper, EnvelopeError> {
    let iv = generate_nonce();
    let mut sealed = gcm_seal(cek.as_slice(), &iv, tek.as_slice(), aad)?;

    // The AEAD output is ciphertext || tag; split the tag off
    let tag = sealed.split_off(sealed.len() - GCM_TAG_LEN);

    Ok(EncryptedTekWrapper {
        ciphertext: sealed,
        tag,
        iv,
    })
}

/// Reverse of [`wrap_key`]; fails closed on any tampering
pub fn unwrap_key(
    wrapper: &EncryptedTekWrapper,
    aad: &[u8],
    cek: &SymmetricKey,
) -> Result<SymmetricKey, EnvelopeError> {
    if wrapper.tag.len() != GCM_TAG_LEN {
        return Err(EnvelopeError::InvalidTagLength(wrapper.tag.len()));
    }

    let mut sealed = Vec::with_capacity(wrapper.ciphertext.len() + GCM_TAG_LEN);
    sealed.extend_from_slice(&wrapper.ciphertext);
    sealed.extend_from_slice(&wrapper.tag);

    let mut plaintext = gcm_open(cek.as_slice(), &wrapper.iv, &sealed, aad)?;
    let key = SymmetricKey::from_slice(&plaintext);
    zeroize::Zeroize::zeroize(&mut plaintext);
    Ok(key?)
}

/// AES-CBC/PKCS7 encrypt; output is `iv || ciphertext`
pub fn encrypt_message(plaintext: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, EnvelopeError> {
    let iv = random_bytes(CBC_IV_LEN);
    let k = key.as_slice();
    let ciphertext = match key.size() {
        AesKeySize::Aes128 => cbc::Encryptor::<aes::Aes128>::new_from_slices(k, &iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        AesKeySize::Aes192 => cbc::Encryptor::<aes::Aes192>::new_from_slices(k, &iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
        AesKeySize::Aes256 => cbc::Encryptor::<aes::Aes256>::new_from_slices(k, &iv)
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(plaintext)),
    }
    .map_err(|e| EnvelopeError::Cipher(e.to_string()))?;

    let mut out = iv;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Split the 16-byte IV off the front and AES-CBC/PKCS7 decrypt the rest
pub fn decrypt_message(data: &[u8], key: &SymmetricKey) -> Result<Vec<u8>, EnvelopeError> {
    // Needs the IV plus at least one full block
    if data.len() < CBC_IV_LEN * 2 || data.len() % CBC_IV_LEN != 0 {
        return Err(EnvelopeError::TruncatedCiphertext(data.len()));
    }
    let (iv, ciphertext) = data.split_at(CBC_IV_LEN);
    let k = key.as_slice();

    let padded = match key.size() {
        AesKeySize::Aes128 => cbc::Decryptor::<aes::Aes128>::new_from_slices(k, iv)
            .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)),
        AesKeySize::Aes192 => cbc::Decryptor::<aes::Aes192>::new_from_slices(k, iv)
            .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)),
        AesKeySize::Aes256 => cbc::Decryptor::<aes::Aes256>::new_from_slices(k, iv)
            .map(|c| c.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)),
    }
    .map_err(|e| EnvelopeError::Cipher(e.to_string()))?;

    padded.map_err(|_| EnvelopeError::InvalidPadding)
}
