//! Secure key import protocol
//!
//! A server transports a symmetric transport key (TEK) to a device that
//! imports it into a protected keystore without the raw key ever leaving
//! the keystore boundary on the device side:
//!
//! 1. the device generates an RSA wrapping key and publishes it as a JWK;
//! 2. the server wraps the TEK under an ephemeral CEK with AES-GCM, binding
//!    the key's authorization list as AAD, and encrypts the CEK with
//!    RSA-OAEP (SHA-256, MGF1-SHA-1);
//! 3. everything is packed into a DER `SecureKeyWrapper`;
//! 4. the device imports the structure and both parties verify the key by
//!    exchanging encrypted messages.
//!
//! [`Orchestrator`] plays both parties and always ends in a single
//! [`ProtocolOutcome`].

mod config;
mod envelope;
mod error;
mod helpers;
mod jwe;
mod jwk;
pub mod keystore;
mod orchestrator;
pub mod platform;
pub mod prelude;
mod runner;
mod server;
pub mod storage;
mod transport;
mod types;
pub mod wrapper;

pub use config::{ConfigError, ProtocolConfig, DEFAULT_IMPORT_KEY_ALIAS, DEFAULT_WRAPPING_KEY_ALIAS};
pub use envelope::{
    decrypt_message, encrypt_message, unwrap_key, wrap_key, EncryptedTekWrapper, EnvelopeError,
};
pub use error::KeyImportError;
pub use helpers::CryptoError;
pub use jwe::{decrypt_compact, encrypt_compact, EncryptionMethod, JweError};
pub use jwk::{export_public_key_as_jwk, import_public_key_from_jwk, JwkError, RsaJwk};
pub use orchestrator::{
    default_client_message, default_server_message, ImportReport, LocalUsageOutcome,
    Orchestrator, Phase, ProtocolOutcome, ProtocolRun, ProtocolState, UsageOutcome,
    VerificationCheck,
};
pub use runner::ProtocolRunner;
pub use server::{decode_wrapped_key, KeyWrapServer, ServerWrapOutput};
pub use transport::{
    encrypt_cek, generate_wrapping_key, KeyEncapsulation, RsaOaepTransport, TransportError,
};
pub use types::{AesKeySize, ContentEncryptionKey, KeyError, SymmetricKey, TransportKey};
