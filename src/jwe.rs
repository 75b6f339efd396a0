//! JWE compact serialization with direct AES-GCM encryption
//!
//! Only the `"dir"` key management algorithm is supported: the shared key is
//! used directly as the content-encryption key, so the encrypted-key segment
//! of the compact form is always empty. The encryption method is chosen from
//! the key length (`A128GCM`, `A192GCM`, `A256GCM`).
//!
//! ```text
//! BASE64URL(header) . "" . BASE64URL(iv) . BASE64URL(ciphertext) . BASE64URL(tag)
//! ```
//!
//! The ASCII bytes of the encoded protected header are the AAD.

use crate::helpers::{gcm_open, gcm_seal, generate_nonce, CryptoError};
use crate::helpers::{GCM_NONCE_LEN, GCM_TAG_LEN};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The only supported key management algorithm
pub const ALG_DIRECT: &str = "dir";

#[derive(Debug, Error)]
pub enum JweError {
    #[error("Unsupported key size for JWE: {0} bits")]
    UnsupportedKeySize(usize),

    #[error("Malformed JWE compact serialization: {0}")]
    Malformed(String),

    #[error("Unsupported JWE algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Encryption method {header} does not match a {key_bits}-bit key")]
    EncryptionMethodMismatch { header: EncryptionMethod, key_bits: usize },

    #[error("Integrity check failed: authentication tag mismatch")]
    IntegrityViolation,

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cipher error: {0}")]
    Cipher(String),
}

impl From<CryptoError> for JweError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => JweError::IntegrityViolation,
            other => JweError::Cipher(other.to_string()),
        }
    }
}

/// AES-GCM content encryption methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    A128Gcm,
    A192Gcm,
    A256Gcm,
}

impl EncryptionMethod {
    /// Select the method for a key of `bits` length
    pub fn for_key_size_bits(bits: usize) -> Result<Self, JweError> {
        match bits {
            128 => Ok(EncryptionMethod::A128Gcm),
            192 => Ok(EncryptionMethod::A192Gcm),
            256 => Ok(EncryptionMethod::A256Gcm),
            other => Err(JweError::UnsupportedKeySize(other)),
        }
    }

    pub fn key_size_bits(self) -> usize {
        match self {
            EncryptionMethod::A128Gcm => 128,
            EncryptionMethod::A192Gcm => 192,
            EncryptionMethod::A256Gcm => 256,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "A128GCM" => Some(EncryptionMethod::A128Gcm),
            "A192GCM" => Some(EncryptionMethod::A192Gcm),
            "A256GCM" => Some(EncryptionMethod::A256Gcm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMethod::A128Gcm => "A128GCM",
            EncryptionMethod::A192Gcm => "A192GCM",
            EncryptionMethod::A256Gcm => "A256GCM",
        }
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JOSE protected header
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProtectedHeader {
    alg: String,
    enc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    zip: Option<String>,
}

/// Encrypt `plaintext` under `key` into a JWE compact string
pub fn encrypt_compact(plaintext: &[u8], key: &[u8]) -> Result<String, JweError> {
    let enc = EncryptionMethod::for_key_size_bits(key.len() * 8)?;

    let header = ProtectedHeader {
        alg: ALG_DIRECT.to_string(),
        enc: enc.as_str().to_string(),
        zip: None,
    };
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);

    let iv = generate_nonce();
    let mut ciphertext = gcm_seal(key, &iv, plaintext, header_b64.as_bytes())?;
    let tag = ciphertext.split_off(ciphertext.len() - GCM_TAG_LEN);

    Ok(format!(
        "{}..{}.{}.{}",
        header_b64,
        URL_SAFE_NO_PAD.encode(iv),
        URL_SAFE_NO_PAD.encode(&ciphertext),
        URL_SAFE_NO_PAD.encode(&tag)
    ))
}

/// Decrypt a JWE compact string produced with direct AES-GCM encryption
///
/// Anything other than `alg: "dir"` with the method matching the key length
/// is rejected before any decryption is attempted.
pub fn decrypt_compact(compact: &str, key: &[u8]) -> Result<Vec<u8>, JweError> {
    let key_bits = key.len() * 8;
    let expected = EncryptionMethod::for_key_size_bits(key_bits)?;

    let parts: Vec<&str> = compact.trim().split('.').collect();
    if parts.len() != 5 {
        return Err(JweError::Malformed(format!(
            "expected 5 parts, found {}",
            parts.len()
        )));
    }

    let header_b64 = parts[0];
    let header: ProtectedHeader = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;

    if header.alg != ALG_DIRECT {
        return Err(JweError::UnsupportedAlgorithm(header.alg));
    }
    if let Some(zip) = header.zip {
        return Err(JweError::UnsupportedAlgorithm(format!("zip={}", zip)));
    }
    let enc = EncryptionMethod::from_name(&header.enc)
        .ok_or_else(|| JweError::UnsupportedAlgorithm(header.enc.clone()))?;
    if enc != expected {
        return Err(JweError::EncryptionMethodMismatch {
            header: enc,
            key_bits,
        });
    }

    if !parts[1].is_empty() {
        return Err(JweError::Malformed(
            "direct encryption must not carry an encrypted key".to_string(),
        ));
    }

    let iv_bytes = URL_SAFE_NO_PAD.decode(parts[2])?;
    let iv: [u8; GCM_NONCE_LEN] = iv_bytes
        .as_slice()
        .try_into()
        .map_err(|_| JweError::Malformed(format!("IV must be 12 bytes, got {}", iv_bytes.len())))?;

    let mut sealed = URL_SAFE_NO_PAD.decode(parts[3])?;
    let tag = URL_SAFE_NO_PAD.decode(parts[4])?;
    if tag.len() != GCM_TAG_LEN {
        return Err(JweError::Malformed(format!(
            "tag must be 16 bytes, got {}",
            tag.len()
        )));
    }
    sealed.extend_from_slice(&tag);

    Ok(gcm_open(key, &iv, &sealed, header_b64.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::random_bytes;

    #[test]
    fn test_method_selection() {
        assert_eq!(
            EncryptionMethod::for_key_size_bits(128).unwrap(),
            EncryptionMethod::A128Gcm
        );
        assert_eq!(
            EncryptionMethod::for_key_size_bits(192).unwrap(),
            EncryptionMethod::A192Gcm
        );
        assert_eq!(
            EncryptionMethod::for_key_size_bits(256).unwrap(),
            EncryptionMethod::A256Gcm
        );
        for bits in [0, 64, 160, 384, 512] {
            assert!(matches!(
                EncryptionMethod::for_key_size_bits(bits),
                Err(JweError::UnsupportedKeySize(b)) if b == bits
            ));
        }
    }

    #[test]
    fn test_roundtrip_all_sizes() {
        for len in [16, 24, 32] {
            let key = random_bytes(len);
            let jwe = encrypt_compact(b"Hello from Server!", &key).unwrap();
            assert_eq!(jwe.split('.').count(), 5);
            assert_eq!(decrypt_compact(&jwe, &key).unwrap(), b"Hello from Server!");
        }
    }

    #[test]
    fn test_header_contents() {
        let key = random_bytes(32);
        let jwe = encrypt_compact(b"x", &key).unwrap();
        let header = URL_SAFE_NO_PAD.decode(jwe.split('.').next().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&header).unwrap();
        assert_eq!(value["alg"], "dir");
        assert_eq!(value["enc"], "A256GCM");
    }

    #[test]
    fn test_unsupported_key_size() {
        assert!(matches!(
            encrypt_compact(b"x", &[0u8; 20]),
            Err(JweError::UnsupportedKeySize(160))
        ));
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        let jwe = encrypt_compact(b"x", &random_bytes(16)).unwrap();
        assert!(matches!(
            decrypt_compact(&jwe, &random_bytes(32)),
            Err(JweError::EncryptionMethodMismatch { .. })
        ));
    }

    #[test]
    fn test_non_direct_algorithm_rejected() {
        let key = random_bytes(32);
        let jwe = encrypt_compact(b"x", &key).unwrap();
        let parts: Vec<&str> = jwe.split('.').collect();
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RSA-OAEP-256","enc":"A256GCM"}"#);
        let forged = format!("{}.{}.{}.{}.{}", header, parts[1], parts[2], parts[3], parts[4]);
        assert!(matches!(
            decrypt_compact(&forged, &key),
            Err(JweError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_encrypted_key_segment_rejected() {
        let key = random_bytes(32);
        let jwe = encrypt_compact(b"x", &key).unwrap();
        let forged = jwe.replacen("..", ".AAAA.", 1);
        assert!(matches!(
            decrypt_compact(&forged, &key),
            Err(JweError::Malformed(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let key = random_bytes(32);
        let jwe = encrypt_compact(b"attack at dawn", &key).unwrap();
        let mut parts: Vec<String> = jwe.split('.').map(str::to_string).collect();
        let mut ct = URL_SAFE_NO_PAD.decode(&parts[3]).unwrap();
        ct[0] ^= 0x01;
        parts[3] = URL_SAFE_NO_PAD.encode(&ct);
        assert!(matches!(
            decrypt_compact(&parts.join("."), &key),
            Err(JweError::IntegrityViolation)
        ));
    }

    #[test]
    fn test_wrong_part_count() {
        assert!(matches!(
            decrypt_compact("a.b.c", &random_bytes(32)),
            Err(JweError::Malformed(_))
        ));
    }
}
