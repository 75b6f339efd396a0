//! RSA public keys as JSON Web Keys
//!
//! The device exports its wrapping key as `{"kty":"RSA","kid":..,"n":..,"e":..}`
//! with base64url (unpadded) big-endian modulus and exponent.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwkError {
    #[error("Invalid JWK: {0}")]
    InvalidJwk(String),

    #[error("Unsupported JWK key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Invalid base64url in JWK field '{field}': {source}")]
    InvalidEncoding {
        field: &'static str,
        source: base64::DecodeError,
    },

    #[error("JWK JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialized form of an RSA public JWK
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub n: String,
    pub e: String,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
}

impl RsaJwk {
    /// Build the JWK for `public_key`, identified by `kid`
    pub fn from_public_key(kid: &str, public_key: &RsaPublicKey) -> Self {
        RsaJwk {
            kty: "RSA".to_string(),
            kid: Some(kid.to_string()),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
            key_use: None,
            alg: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, JwkError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, JwkError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild the RSA public key
    pub fn to_public_key(&self) -> Result<RsaPublicKey, JwkError> {
        if self.kty != "RSA" {
            return Err(JwkError::UnsupportedKeyType(self.kty.clone()));
        }
        let n = decode_uint("n", &self.n)?;
        let e = decode_uint("e", &self.e)?;
        RsaPublicKey::new(n, e).map_err(|e| JwkError::InvalidJwk(e.to_string()))
    }
}

fn decode_uint(field: &'static str, value: &str) -> Result<BigUint, JwkError> {
    // Some producers pad; the JWK rules say they should not
    let bytes = URL_SAFE_NO_PAD
        .decode(value.trim_end_matches('='))
        .map_err(|source| JwkError::InvalidEncoding { field, source })?;
    if bytes.is_empty() {
        return Err(JwkError::InvalidJwk(format!("field '{}' is empty", field)));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Encode `public_key` as a JWK JSON string with `alias` as key id
pub fn export_public_key_as_jwk(alias: &str, public_key: &RsaPublicKey) -> Result<String, JwkError> {
    RsaJwk::from_public_key(alias, public_key).to_json()
}

/// Parse a JWK JSON string back into an RSA public key
pub fn import_public_key_from_jwk(jwk: &str) -> Result<RsaPublicKey, JwkError> {
    RsaJwk::from_json(jwk)?.to_public_key()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::generate_wrapping_key;

    #[test]
    fn test_export_import_roundtrip() {
        let public_key = generate_wrapping_key(1024).unwrap().to_public_key();
        let json = export_public_key_as_jwk("device_wrapping_key_alias", &public_key).unwrap();

        let parsed = RsaJwk::from_json(&json).unwrap();
        assert_eq!(parsed.kty, "RSA");
        assert_eq!(parsed.kid.as_deref(), Some("device_wrapping_key_alias"));
        assert_eq!(parsed.e, "AQAB");

        let imported = import_public_key_from_jwk(&json).unwrap();
        assert_eq!(imported, public_key);
    }

    #[test]
    fn test_padded_values_accepted() {
        let public_key = generate_wrapping_key(1024).unwrap().to_public_key();
        let mut jwk = RsaJwk::from_public_key("k", &public_key);
        jwk.e = format!("{}=", jwk.e);
        assert_eq!(jwk.to_public_key().unwrap(), public_key);
    }

    #[test]
    fn test_wrong_key_type() {
        let json = r#"{"kty":"EC","n":"AQAB","e":"AQAB"}"#;
        assert!(matches!(
            import_public_key_from_jwk(json),
            Err(JwkError::UnsupportedKeyType(_))
        ));
    }

    #[test]
    fn test_malformed_json_and_fields() {
        assert!(matches!(
            import_public_key_from_jwk("{not json"),
            Err(JwkError::Json(_))
        ));
        assert!(matches!(
            import_public_key_from_jwk(r#"{"kty":"RSA","e":"AQAB"}"#),
            Err(JwkError::Json(_))
        ));
        assert!(matches!(
            import_public_key_from_jwk(r#"{"kty":"RSA","n":"!!!","e":"AQAB"}"#),
            Err(JwkError::InvalidEncoding { field: "n", .. })
        ));
        assert!(matches!(
            import_public_key_from_jwk(r#"{"kty":"RSA","n":"","e":"AQAB"}"#),
            Err(JwkError::InvalidJwk(_))
        ));
    }
}
