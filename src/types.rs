//! Zeroizing symmetric key types
//!
//! Transport keys (TEK) and content-encryption keys (CEK) are held in
//! wrappers that clear their memory on drop.

use crate::helpers::random_bytes;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES key sizes accepted by the envelope engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AesKeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl AesKeySize {
    /// Map a key size in bits to an AES variant
    pub fn from_bits(bits: usize) -> Result<Self, KeyError> {
        if bits % 8 != 0 {
            return Err(KeyError::UnalignedKeySize(bits));
        }
        match bits {
            128 => Ok(AesKeySize::Aes128),
            192 => Ok(AesKeySize::Aes192),
            256 => Ok(AesKeySize::Aes256),
            other => Err(KeyError::UnsupportedKeySize(other)),
        }
    }

    pub fn bits(self) -> usize {
        match self {
            AesKeySize::Aes128 => 128,
            AesKeySize::Aes192 => 192,
            AesKeySize::Aes256 => 256,
        }
    }

    pub fn bytes(self) -> usize {
        self.bits() / 8
    }
}

/// AES key material (128, 192 or 256 bits) that zeroizes on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey(Vec<u8>);

impl SymmetricKey {
    /// Create a key from raw bytes; only AES key lengths are accepted
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        AesKeySize::from_bits(bytes.len() * 8)?;
        Ok(SymmetricKey(bytes.to_vec()))
    }

    /// Generate a fresh random key of the given size in bits
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let size = AesKeySize::from_bits(bits)?;
        Ok(SymmetricKey(random_bytes(size.bytes())))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn size(&self) -> AesKeySize {
        // Length is validated on construction
        match self.0.len() {
            16 => AesKeySize::Aes128,
            24 => AesKeySize::Aes192,
            _ => AesKeySize::Aes256,
        }
    }

    pub fn size_bits(&self) -> usize {
        self.0.len() * 8
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SymmetricKey {}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({} bits, redacted)", self.size_bits())
    }
}

/// Ephemeral content-encryption key used to wrap exactly one TEK
///
/// Not `Clone`: the key lives for one wrap operation and is dropped
/// (and zeroized) right after.
pub struct ContentEncryptionKey(SymmetricKey);

impl ContentEncryptionKey {
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        Ok(ContentEncryptionKey(SymmetricKey::generate(bits)?))
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.0
    }
}

impl fmt::Debug for ContentEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentEncryptionKey({} bits, redacted)", self.0.size_bits())
    }
}

/// The long-lived transport encryption key shared by both parties
pub type TransportKey = SymmetricKey;

/// Key-related errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key size {0} bits is not a whole number of bytes")]
    UnalignedKeySize(usize),

    #[error("unsupported AES key size: {0} bits")]
    UnsupportedKeySize(usize),
}
