//! In-memory keystore
//!
//! Performs the same secure-import checks a hardware keystore does: the CEK
//! is recovered with the wrapping private key, the transport key is opened
//! with AES-GCM using the encoded key description as AAD, and the declared
//! key parameters are compared against the recovered key.

use super::{KeystoreError, ProtectionTier, SecureKeystore, SecurityLevel};
use crate::envelope::{self, EncryptedTekWrapper};
use crate::helpers::{GCM_NONCE_LEN, GCM_TAG_LEN};
use crate::jwe;
use crate::transport::{generate_wrapping_key, KeyEncapsulation, RsaOaepTransport};
use crate::types::SymmetricKey;
use crate::wrapper::{SecureKeyWrapper, KM_ALGORITHM_AES, KM_KEY_FORMAT_RAW, WRAPPED_FORMAT_VERSION};
use der::Encode;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

enum Entry {
    Wrapping {
        key: RsaPrivateKey,
        tier: ProtectionTier,
    },
    Secret {
        key: SymmetricKey,
        level: SecurityLevel,
    },
}

/// Software stand-in for a hardware-backed keystore
pub struct SoftwareKeystore {
    supported_tiers: Vec<ProtectionTier>,
    secure_import: bool,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for SoftwareKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareKeystore {
    /// Keystore supporting every tier and secure import
    pub fn new() -> Self {
        SoftwareKeystore {
            supported_tiers: ProtectionTier::FALLBACK_ORDER.to_vec(),
            secure_import: true,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Restrict the tiers wrapping keys can be generated at
    pub fn with_tiers(mut self, tiers: &[ProtectionTier]) -> Self {
        self.supported_tiers = tiers.to_vec();
        self
    }

    /// Decline every import as categorically unsupported
    pub fn without_secure_import(mut self) -> Self {
        self.secure_import = false;
        self
    }

    pub fn supports(&self, tier: ProtectionTier) -> bool {
        self.supported_tiers.contains(&tier)
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, KeystoreError> {
        self.entries.lock().map_err(|_| KeystoreError::Poisoned)
    }

    fn with_secret<R>(
        &self,
        alias: &str,
        operation: &'static str,
        f: impl FnOnce(&SymmetricKey) -> Result<R, KeystoreError>,
    ) -> Result<R, KeystoreError> {
        let entries = self.entries()?;
        match entries.get(alias) {
            Some(Entry::Secret { key, .. }) => f(key),
            Some(Entry::Wrapping { .. }) => Err(KeystoreError::WrongKeyType {
                alias: alias.to_string(),
                operation,
            }),
            None => Err(KeystoreError::KeyNotFound(alias.to_string())),
        }
    }

    fn with_wrapping<R>(
        &self,
        alias: &str,
        operation: &'static str,
        f: impl FnOnce(&RsaPrivateKey) -> Result<R, KeystoreError>,
    ) -> Result<R, KeystoreError> {
        let entries = self.entries()?;
        match entries.get(alias) {
            Some(Entry::Wrapping { key, .. }) => f(key),
            Some(Entry::Secret { .. }) => Err(KeystoreError::WrongKeyType {
                alias: alias.to_string(),
                operation,
            }),
            None => Err(KeystoreError::KeyNotFound(alias.to_string())),
        }
    }

    /// Validate and open a secure-import structure
    fn unwrap_import(
        wrapping_key: &RsaPrivateKey,
        structure: &SecureKeyWrapper,
    ) -> Result<SymmetricKey, KeystoreError> {
        if structure.version != WRAPPED_FORMAT_VERSION {
            return Err(KeystoreError::ImportRejected(format!(
                "unsupported wrapper version {}",
                structure.version
            )));
        }

        let description = &structure.key_description;
        if description.key_format != KM_KEY_FORMAT_RAW {
            return Err(KeystoreError::ImportRejected(format!(
                "unsupported key format {}",
                description.key_format
            )));
        }
        if description.authorization_list.algorithm != KM_ALGORITHM_AES {
            return Err(KeystoreError::ImportRejected(format!(
                "unsupported algorithm {}",
                description.authorization_list.algorithm
            )));
        }

        let cek_bytes = RsaOaepTransport
            .unwrap(&structure.encrypted_transport_key, wrapping_key)
            .map_err(|e| KeystoreError::ImportRejected(e.to_string()))?;
        let cek = SymmetricKey::from_slice(&cek_bytes)
            .map_err(|e| KeystoreError::ImportRejected(format!("transport key: {}", e)))?;

        let iv: [u8; GCM_NONCE_LEN] = structure
            .initialization_vector
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::ImportRejected("IV must be 12 bytes".to_string()))?;
        if structure.tag.len() != GCM_TAG_LEN {
            return Err(KeystoreError::ImportRejected(
                "tag must be 16 bytes".to_string(),
            ));
        }

        let aad = description
            .to_der()
            .map_err(|e| KeystoreError::ImportRejected(e.to_string()))?;
        let wrapped = EncryptedTekWrapper {
            ciphertext: structure.encrypted_key.clone(),
            tag: structure.tag.clone(),
            iv,
        };
        let key = envelope::unwrap_key(&wrapped, &aad, &cek)?;

        let declared = description.authorization_list.key_size_bits as usize;
        if declared != key.size_bits() {
            return Err(KeystoreError::ImportRejected(format!(
                "declared key size {} bits, actual {} bits",
                declared,
                key.size_bits()
            )));
        }

        Ok(key)
    }
}

impl SecureKeystore for SoftwareKeystore {
    fn generate_wrapping_key(
        &self,
        alias: &str,
        tier: ProtectionTier,
        bits: usize,
    ) -> Result<RsaPublicKey, KeystoreError> {
        if !self.supports(tier) {
            return Err(KeystoreError::CapabilityUnsupported(tier));
        }

        let key = generate_wrapping_key(bits)?;
        let public_key = key.to_public_key();
        self.entries()?
            .insert(alias.to_string(), Entry::Wrapping { key, tier });

        debug!(alias, %tier, bits, "Generated wrapping key");
        Ok(public_key)
    }

    fn import_wrapped_key(
        &self,
        wrapped_der: &[u8],
        wrapping_alias: &str,
        import_alias: &str,
    ) -> Result<(), KeystoreError> {
        if !self.secure_import {
            return Err(KeystoreError::ImportUnavailable(
                "keystore does not support secure key import".to_string(),
            ));
        }

        let structure = SecureKeyWrapper::from_der_bytes(wrapped_der)
            .map_err(|e| KeystoreError::ImportRejected(e.to_string()))?;

        let mut entries = self.entries()?;
        let (key, level) = match entries.get(wrapping_alias) {
            Some(Entry::Wrapping { key, tier }) => {
                (Self::unwrap_import(key, &structure)?, tier.security_level())
            }
            Some(Entry::Secret { .. }) => {
                return Err(KeystoreError::WrongKeyType {
                    alias: wrapping_alias.to_string(),
                    operation: "unwrapping",
                })
            }
            None => return Err(KeystoreError::KeyNotFound(wrapping_alias.to_string())),
        };

        entries.insert(import_alias.to_string(), Entry::Secret { key, level });
        debug!(import_alias, ?level, "Imported wrapped key");
        Ok(())
    }

    fn security_level(&self, alias: &str) -> Result<SecurityLevel, KeystoreError> {
        match self.entries()?.get(alias) {
            Some(Entry::Secret { level, .. }) => Ok(*level),
            Some(Entry::Wrapping { tier, .. }) => Ok(tier.security_level()),
            None => Err(KeystoreError::KeyNotFound(alias.to_string())),
        }
    }

    fn encrypt_message(&self, alias: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.with_secret(alias, "encryption", |key| {
            Ok(envelope::encrypt_message(plaintext, key)?)
        })
    }

    fn decrypt_message(&self, alias: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.with_secret(alias, "decryption", |key| {
            Ok(envelope::decrypt_message(ciphertext, key)?)
        })
    }

    fn encrypt_jwe(&self, alias: &str, plaintext: &[u8]) -> Result<String, KeystoreError> {
        self.with_secret(alias, "JWE encryption", |key| {
            Ok(jwe::encrypt_compact(plaintext, key.as_slice())?)
        })
    }

    fn decrypt_jwe(&self, alias: &str, compact: &str) -> Result<Vec<u8>, KeystoreError> {
        self.with_secret(alias, "JWE decryption", |key| {
            Ok(jwe::decrypt_compact(compact, key.as_slice())?)
        })
    }

    fn encrypt_with_wrapping_key(
        &self,
        alias: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.with_wrapping(alias, "RSA encryption", |key| {
            Ok(RsaOaepTransport.wrap(plaintext, &key.to_public_key())?)
        })
    }

    fn decrypt_with_wrapping_key(
        &self,
        alias: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError> {
        self.with_wrapping(alias, "RSA decryption", |key| {
            Ok(RsaOaepTransport.unwrap(&ciphertext.to_vec(), key)?)
        })
    }

    fn contains_alias(&self, alias: &str) -> bool {
        match self.entries() {
            Ok(entries) => entries.contains_key(alias),
            Err(e) => {
                warn!("Keystore lookup failed: {}", e);
                false
            }
        }
    }

    fn delete_entry(&self, alias: &str) -> Result<(), KeystoreError> {
        self.entries()?.remove(alias);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::wrap_key;
    use crate::transport::encrypt_cek;
    use crate::types::ContentEncryptionKey;
    use crate::wrapper::{build_import_metadata, encode, AuthorizationList};

    const WRAPPING: &str = "wrapping";
    const IMPORTED: &str = "imported";

    fn wrapped_for(
        public_key: &RsaPublicKey,
        tek: &SymmetricKey,
        declared_bits: u32,
    ) -> Vec<u8> {
        let description = build_import_metadata(
            AuthorizationList::for_import(declared_bits, KM_ALGORITHM_AES).unwrap(),
        );
        let aad = description.to_der().unwrap();
        let cek = ContentEncryptionKey::generate(256).unwrap();
        let wrapped = wrap_key(tek, &aad, cek.key()).unwrap();
        let encrypted_cek = encrypt_cek(&cek, public_key).unwrap();
        encode(&wrapped, &encrypted_cek, &description).unwrap()
    }

    #[test]
    fn test_import_and_use() {
        let keystore = SoftwareKeystore::new();
        let public_key = keystore
            .generate_wrapping_key(WRAPPING, ProtectionTier::StrongBox, 2048)
            .unwrap();
        let tek = SymmetricKey::generate(256).unwrap();
        let der = wrapped_for(&public_key, &tek, 256);

        keystore.import_wrapped_key(&der, WRAPPING, IMPORTED).unwrap();
        assert_eq!(
            keystore.security_level(IMPORTED).unwrap(),
            SecurityLevel::StrongBox
        );

        let compact = jwe::encrypt_compact(b"hello", tek.as_slice()).unwrap();
        assert_eq!(keystore.decrypt_jwe(IMPORTED, &compact).unwrap(), b"hello");

        let cbc = keystore.encrypt_message(IMPORTED, b"hello").unwrap();
        assert_eq!(envelope::decrypt_message(&cbc, &tek).unwrap(), b"hello");
    }

    #[test]
    fn test_unsupported_tier() {
        let keystore = SoftwareKeystore::new().with_tiers(&[ProtectionTier::Software]);
        assert!(matches!(
            keystore.generate_wrapping_key(WRAPPING, ProtectionTier::StrongBox, 1024),
            Err(KeystoreError::CapabilityUnsupported(ProtectionTier::StrongBox))
        ));
        assert!(!keystore.contains_alias(WRAPPING));
    }

    #[test]
    fn test_import_unavailable() {
        let keystore = SoftwareKeystore::new().without_secure_import();
        assert!(matches!(
            keystore.import_wrapped_key(&[0x30, 0x00], WRAPPING, IMPORTED),
            Err(KeystoreError::ImportUnavailable(_))
        ));
    }

    #[test]
    fn test_declared_size_mismatch_rejected() {
        let keystore = SoftwareKeystore::new();
        let public_key = keystore
            .generate_wrapping_key(WRAPPING, ProtectionTier::Software, 2048)
            .unwrap();
        let tek = SymmetricKey::generate(128).unwrap();
        let der = wrapped_for(&public_key, &tek, 256);

        assert!(matches!(
            keystore.import_wrapped_key(&der, WRAPPING, IMPORTED),
            Err(KeystoreError::ImportRejected(_))
        ));
        assert!(!keystore.contains_alias(IMPORTED));
    }

    #[test]
    fn test_wrong_wrapping_key_rejected() {
        let keystore = SoftwareKeystore::new();
        keystore
            .generate_wrapping_key(WRAPPING, ProtectionTier::Software, 2048)
            .unwrap();
        let other = generate_wrapping_key(2048).unwrap().to_public_key();
        let tek = SymmetricKey::generate(256).unwrap();
        let der = wrapped_for(&other, &tek, 256);

        assert!(matches!(
            keystore.import_wrapped_key(&der, WRAPPING, IMPORTED),
            Err(KeystoreError::ImportRejected(_))
        ));
    }

    #[test]
    fn test_unknown_alias() {
        let keystore = SoftwareKeystore::new();
        assert!(keystore
            .encrypt_jwe("missing", b"x")
            .unwrap_err()
            .is_key_not_found());
        assert!(matches!(
            keystore.security_level("missing"),
            Err(KeystoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_wrapping_key_roundtrip_and_type_check() {
        let keystore = SoftwareKeystore::new();
        keystore
            .generate_wrapping_key(WRAPPING, ProtectionTier::TrustedEnvironment, 1024)
            .unwrap();
        let ciphertext = keystore.encrypt_with_wrapping_key(WRAPPING, b"ping").unwrap();
        assert_eq!(
            keystore.decrypt_with_wrapping_key(WRAPPING, &ciphertext).unwrap(),
            b"ping"
        );
        assert!(matches!(
            keystore.encrypt_jwe(WRAPPING, b"x"),
            Err(KeystoreError::WrongKeyType { .. })
        ));

        keystore.delete_entry(WRAPPING).unwrap();
        assert!(!keystore.contains_alias(WRAPPING));
    }
}
