//! Device keystore collaborator
//!
//! The client side of the protocol talks to a protected keystore through
//! [`SecureKeystore`]. On a device this is the hardware-backed keystore; the
//! in-process [`SoftwareKeystore`] stands in for it when exercising the
//! protocol on a host.

use crate::envelope::EnvelopeError;
use crate::jwe::JweError;
use crate::transport::TransportError;
use crate::wrapper::WrapperError;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod software;

pub use software::SoftwareKeystore;

/// Where a wrapping key is generated, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionTier {
    /// Dedicated secure element
    StrongBox,
    /// Hardware-isolated trusted environment without a secure element
    TrustedEnvironment,
    /// No hardware isolation
    Software,
}

impl ProtectionTier {
    /// Order in which key generation is attempted
    pub const FALLBACK_ORDER: [ProtectionTier; 3] = [
        ProtectionTier::StrongBox,
        ProtectionTier::TrustedEnvironment,
        ProtectionTier::Software,
    ];

    pub fn security_level(self) -> SecurityLevel {
        match self {
            ProtectionTier::StrongBox => SecurityLevel::StrongBox,
            ProtectionTier::TrustedEnvironment => SecurityLevel::TrustedEnvironment,
            ProtectionTier::Software => SecurityLevel::Software,
        }
    }
}

impl fmt::Display for ProtectionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtectionTier::StrongBox => "strongbox",
            ProtectionTier::TrustedEnvironment => "trusted-environment",
            ProtectionTier::Software => "software",
        };
        f.write_str(name)
    }
}

/// Reported protection level of a stored key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityLevel {
    StrongBox,
    TrustedEnvironment,
    Software,
    Unknown,
}

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("Protection tier {0} is not supported by this keystore")]
    CapabilityUnsupported(ProtectionTier),

    #[error("Secure key import is unavailable: {0}")]
    ImportUnavailable(String),

    #[error("No key found for alias '{0}'")]
    KeyNotFound(String),

    #[error("Key '{alias}' cannot be used for {operation}")]
    WrongKeyType {
        alias: String,
        operation: &'static str,
    },

    #[error("Wrapped key rejected: {0}")]
    ImportRejected(String),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("JWE error: {0}")]
    Jwe(#[from] JweError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Wrapper error: {0}")]
    Wrapper(#[from] WrapperError),

    #[error("Keystore state poisoned")]
    Poisoned,
}

impl KeystoreError {
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, KeystoreError::KeyNotFound(_))
    }
}

/// Protected keystore operations needed by the client side
///
/// Implementations must keep imported key material inside the keystore:
/// callers only ever refer to keys by alias.
pub trait SecureKeystore: Send + Sync {
    /// Generate an RSA wrapping key at `tier`, returning its public half
    ///
    /// Fails with [`KeystoreError::CapabilityUnsupported`] when the tier is
    /// not available; callers may retry at a weaker tier.
    fn generate_wrapping_key(
        &self,
        alias: &str,
        tier: ProtectionTier,
        bits: usize,
    ) -> Result<RsaPublicKey, KeystoreError>;

    /// Unwrap and store a secure-import structure under `import_alias`
    fn import_wrapped_key(
        &self,
        wrapped_der: &[u8],
        wrapping_alias: &str,
        import_alias: &str,
    ) -> Result<(), KeystoreError>;

    /// Protection level of the key stored under `alias`
    fn security_level(&self, alias: &str) -> Result<SecurityLevel, KeystoreError>;

    /// AES-CBC encrypt with an imported key (IV prepended)
    fn encrypt_message(&self, alias: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeystoreError>;

    fn decrypt_message(&self, alias: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KeystoreError>;

    /// JWE compact (dir + AES-GCM) encrypt with an imported key
    fn encrypt_jwe(&self, alias: &str, plaintext: &[u8]) -> Result<String, KeystoreError>;

    fn decrypt_jwe(&self, alias: &str, compact: &str) -> Result<Vec<u8>, KeystoreError>;

    /// RSA-OAEP encrypt with the public half of a wrapping key
    fn encrypt_with_wrapping_key(
        &self,
        alias: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError>;

    fn decrypt_with_wrapping_key(
        &self,
        alias: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, KeystoreError>;

    fn contains_alias(&self, alias: &str) -> bool;

    /// Remove a key; removing an unknown alias is not an error
    fn delete_entry(&self, alias: &str) -> Result<(), KeystoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_order() {
        assert_eq!(ProtectionTier::FALLBACK_ORDER[0], ProtectionTier::StrongBox);
        assert_eq!(
            ProtectionTier::FALLBACK_ORDER[2].security_level(),
            SecurityLevel::Software
        );
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(
            ProtectionTier::TrustedEnvironment.to_string(),
            "trusted-environment"
        );
    }
}
