//! Server side of the key exchange
//!
//! [`KeyWrapServer`] holds no state: every operation takes its inputs
//! explicitly, so one instance can serve any number of concurrent runs.

use crate::config::ProtocolConfig;
use crate::envelope::{self, EncryptedTekWrapper};
use crate::error::KeyImportError;
use crate::jwe;
use crate::jwk::import_public_key_from_jwk;
use crate::transport;
use crate::types::{ContentEncryptionKey, SymmetricKey, TransportKey};
use crate::wrapper::{self, AuthorizationList, KeyDescription, SecureKeyWrapper};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use der::Encode;
use rsa::RsaPublicKey;
use tracing::debug;

/// Output of the combined server phase
#[derive(Debug)]
pub struct ServerWrapOutput {
    /// Base64 of the DER `SecureKeyWrapper`
    pub wrapped_key: String,
    /// The server's copy of the transport key
    pub tek: TransportKey,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyWrapServer;

impl KeyWrapServer {
    pub fn new() -> Self {
        KeyWrapServer
    }

    pub fn decode_wrapping_key(&self, jwk: &str) -> Result<RsaPublicKey, KeyImportError> {
        Ok(import_public_key_from_jwk(jwk)?)
    }

    pub fn generate_tek(&self, bits: usize) -> Result<TransportKey, KeyImportError> {
        Ok(SymmetricKey::generate(bits)?)
    }

    pub fn generate_cek(&self, bits: usize) -> Result<ContentEncryptionKey, KeyImportError> {
        Ok(ContentEncryptionKey::generate(bits)?)
    }

    /// Key description for a raw key of `key_size_bits`
    pub fn import_metadata(
        &self,
        key_size_bits: usize,
        algorithm: u32,
    ) -> Result<KeyDescription, KeyImportError> {
        let bits = u32::try_from(key_size_bits).map_err(|_| {
            wrapper::WrapperError::InvalidArgument(format!("key size {} too large", key_size_bits))
        })?;
        Ok(wrapper::build_import_metadata(
            AuthorizationList::for_import(bits, algorithm)?,
        ))
    }

    pub fn encrypt_cek(
        &self,
        cek: &ContentEncryptionKey,
        recipient: &RsaPublicKey,
    ) -> Result<Vec<u8>, KeyImportError> {
        Ok(transport::encrypt_cek(cek, recipient)?)
    }

    /// AES-GCM wrap the TEK under the CEK with the encoded description as AAD
    pub fn encrypt_tek(
        &self,
        tek: &TransportKey,
        metadata: &KeyDescription,
        cek: &ContentEncryptionKey,
    ) -> Result<EncryptedTekWrapper, KeyImportError> {
        let aad = metadata.to_der().map_err(wrapper::WrapperError::from)?;
        Ok(envelope::wrap_key(tek, &aad, cek.key())?)
    }

    pub fn encode_wrapper(
        &self,
        wrapped: &EncryptedTekWrapper,
        encrypted_cek: &[u8],
        metadata: &KeyDescription,
    ) -> Result<Vec<u8>, KeyImportError> {
        Ok(wrapper::encode(wrapped, encrypted_cek, metadata)?)
    }

    /// Wrap `tek` for the device that published `jwk`
    ///
    /// The CEK is generated here and dropped before returning.
    pub fn wrap_for_import(
        &self,
        jwk: &str,
        tek: &TransportKey,
        config: &ProtocolConfig,
    ) -> Result<String, KeyImportError> {
        let recipient = self.decode_wrapping_key(jwk)?;
        let metadata = self.import_metadata(tek.size_bits(), config.key_algorithm)?;

        let cek = self.generate_cek(config.cek_size_bits)?;
        let encrypted_cek = self.encrypt_cek(&cek, &recipient)?;
        let wrapped = self.encrypt_tek(tek, &metadata, &cek)?;
        drop(cek);

        let der = self.encode_wrapper(&wrapped, &encrypted_cek, &metadata)?;
        debug!(der_len = der.len(), "Encoded secure key wrapper");
        Ok(BASE64.encode(der))
    }

    /// Generate a TEK per `config` and wrap it for `jwk`
    pub fn generate_and_wrap(
        &self,
        jwk: &str,
        config: &ProtocolConfig,
    ) -> Result<ServerWrapOutput, KeyImportError> {
        let tek = self.generate_tek(config.tek_size_bits)?;
        let wrapped_key = self.wrap_for_import(jwk, &tek, config)?;
        Ok(ServerWrapOutput { wrapped_key, tek })
    }

    pub fn encrypt_message_jwe(
        &self,
        message: &[u8],
        tek: &TransportKey,
    ) -> Result<String, KeyImportError> {
        Ok(jwe::encrypt_compact(message, tek.as_slice())?)
    }

    pub fn decrypt_message_jwe(
        &self,
        compact: &str,
        tek: &TransportKey,
    ) -> Result<Vec<u8>, KeyImportError> {
        Ok(jwe::decrypt_compact(compact, tek.as_slice())?)
    }

    /// CBC encrypt, IV prepended
    pub fn encrypt_message(
        &self,
        message: &[u8],
        tek: &TransportKey,
    ) -> Result<Vec<u8>, KeyImportError> {
        Ok(envelope::encrypt_message(message, tek)?)
    }

    pub fn decrypt_message(
        &self,
        data: &[u8],
        tek: &TransportKey,
    ) -> Result<Vec<u8>, KeyImportError> {
        Ok(envelope::decrypt_message(data, tek)?)
    }
}

/// Decode a Base64 `SecureKeyWrapper`
pub fn decode_wrapped_key(encoded: &str) -> Result<SecureKeyWrapper, KeyImportError> {
    Ok(SecureKeyWrapper::from_base64(encoded)?)
}
