//! Unified error type for the key import API
//!
//! Internal modules maintain their domain-specific errors for precise handling.
//! This unified type is what the server operations and the RPC front end
//! return.
//!
//! # Example
//!
//! ```no_run
//! use keyimport::KeyImportError;
//!
//! fn wrap() -> Result<(), KeyImportError> {
//!     // Module errors convert automatically with `?`
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for all key import operations
///
/// # Error Categories
///
/// - **Envelope**: AES-GCM key wrapping or AES-CBC message errors
/// - **Jwe**: JWE compact serialization errors
/// - **Transport**: RSA-OAEP wrapping errors
/// - **Jwk**: malformed or unsupported JSON Web Keys
/// - **Wrapper**: DER structure encoding/decoding errors
/// - **Keystore**: device keystore errors
/// - **Storage**: persisted key errors
/// - **Config**: invalid configuration
/// - **Key**: invalid symmetric key sizes
#[derive(Debug, Error)]
pub enum KeyImportError {
    #[error("Envelope error: {0}")]
    Envelope(#[from] crate::envelope::EnvelopeError),

    #[error("JWE error: {0}")]
    Jwe(#[from] crate::jwe::JweError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("JWK error: {0}")]
    Jwk(#[from] crate::jwk::JwkError),

    #[error("Wrapper error: {0}")]
    Wrapper(#[from] crate::wrapper::WrapperError),

    #[error("Keystore error: {0}")]
    Keystore(#[from] crate::keystore::KeystoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Key error: {0}")]
    Key(#[from] crate::types::KeyError),
}

impl KeyImportError {
    /// Returns true if an authentication tag check failed
    pub fn is_integrity_violation(&self) -> bool {
        use crate::envelope::EnvelopeError;
        use crate::jwe::JweError;
        use crate::keystore::KeystoreError;

        matches!(
            self,
            Self::Envelope(EnvelopeError::IntegrityViolation)
                | Self::Jwe(JweError::IntegrityViolation)
                | Self::Keystore(KeystoreError::Envelope(EnvelopeError::IntegrityViolation))
                | Self::Keystore(KeystoreError::Jwe(JweError::IntegrityViolation))
        )
    }

    /// Returns true if the caller passed malformed input
    pub fn is_invalid_argument(&self) -> bool {
        use crate::wrapper::WrapperError;

        matches!(
            self,
            Self::Wrapper(WrapperError::InvalidArgument(_))
                | Self::Jwk(_)
                | Self::Config(_)
                | Self::Key(_)
                | Self::Jwe(crate::jwe::JweError::UnsupportedKeySize(_))
        )
    }

    /// Returns true if a key lookup by alias failed
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::Keystore(e) if e.is_key_not_found())
    }

    /// Returns true if this is a cryptographic error
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            Self::Envelope(_) | Self::Jwe(_) | Self::Transport(_) | Self::Key(_)
        )
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        use crate::jwe::JweError;
        use crate::keystore::KeystoreError;
        use crate::transport::TransportError;

        match self {
            Self::Jwe(JweError::UnsupportedKeySize(_)) => {
                Some("Use a 128, 192 or 256-bit AES key")
            }
            Self::Jwe(JweError::EncryptionMethodMismatch { .. }) => {
                Some("The message was encrypted with a different key size than the one supplied")
            }
            Self::Transport(TransportError::InvalidCiphertextLength { .. }) => {
                Some("The ciphertext was produced for a different wrapping key")
            }
            Self::Jwk(_) => Some("Provide an RSA public key as a JWK with 'kty', 'n' and 'e'"),
            Self::Keystore(KeystoreError::KeyNotFound(_)) => {
                Some("Run the key import first so the alias exists")
            }
            Self::Keystore(KeystoreError::ImportUnavailable(_)) => {
                Some("This keystore cannot import wrapped keys")
            }
            _ if self.is_integrity_violation() => {
                Some("The data was modified or encrypted under a different key")
            }
            _ => None,
        }
    }
}
