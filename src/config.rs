//! Protocol configuration
//!
//! Defaults match a device importing a 256-bit AES key. Any field can be
//! overridden from JSON or from `KEYIMPORT_*` environment variables.

use crate::platform::MIN_SECURE_IMPORT_API_LEVEL;
use crate::transport::MIN_WRAPPING_KEY_BITS;
use crate::types::AesKeySize;
use crate::wrapper::{KM_ALGORITHM_AES, MAX_SMALL_INT};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_WRAPPING_KEY_ALIAS: &str = "device_wrapping_key_alias";
pub const DEFAULT_IMPORT_KEY_ALIAS: &str = "device_wrapped_key_alias";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub wrapping_key_alias: String,
    pub import_key_alias: String,
    pub tek_size_bits: usize,
    pub cek_size_bits: usize,
    pub wrapping_key_bits: usize,
    pub min_secure_import_api_level: u32,
    /// Keystore algorithm identifier for the imported key
    pub key_algorithm: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            wrapping_key_alias: DEFAULT_WRAPPING_KEY_ALIAS.to_string(),
            import_key_alias: DEFAULT_IMPORT_KEY_ALIAS.to_string(),
            tek_size_bits: 256,
            cek_size_bits: 256,
            wrapping_key_bits: 2048,
            min_secure_import_api_level: MIN_SECURE_IMPORT_API_LEVEL,
            key_algorithm: KM_ALGORITHM_AES,
        }
    }
}

impl ProtocolConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ProtocolConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `KEYIMPORT_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ProtocolConfig::default();

        if let Some(alias) = env_string("KEYIMPORT_WRAPPING_KEY_ALIAS") {
            config.wrapping_key_alias = alias;
        }
        if let Some(alias) = env_string("KEYIMPORT_IMPORT_KEY_ALIAS") {
            config.import_key_alias = alias;
        }
        if let Some(bits) = env_parse("KEYIMPORT_TEK_SIZE_BITS", "tek_size_bits")? {
            config.tek_size_bits = bits;
        }
        if let Some(bits) = env_parse("KEYIMPORT_CEK_SIZE_BITS", "cek_size_bits")? {
            config.cek_size_bits = bits;
        }
        if let Some(bits) = env_parse("KEYIMPORT_WRAPPING_KEY_BITS", "wrapping_key_bits")? {
            config.wrapping_key_bits = bits;
        }
        if let Some(level) =
            env_parse("KEYIMPORT_MIN_API_LEVEL", "min_secure_import_api_level")?
        {
            config.min_secure_import_api_level = level;
        }
        if let Some(algorithm) = env_parse("KEYIMPORT_KEY_ALGORITHM", "key_algorithm")? {
            config.key_algorithm = algorithm;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wrapping_key_alias.is_empty() {
            return Err(invalid("wrapping_key_alias", "must not be empty"));
        }
        if self.import_key_alias.is_empty() {
            return Err(invalid("import_key_alias", "must not be empty"));
        }
        if self.wrapping_key_alias == self.import_key_alias {
            return Err(invalid(
                "import_key_alias",
                "must differ from wrapping_key_alias",
            ));
        }
        AesKeySize::from_bits(self.tek_size_bits)
            .map_err(|e| invalid("tek_size_bits", &e.to_string()))?;
        AesKeySize::from_bits(self.cek_size_bits)
            .map_err(|e| invalid("cek_size_bits", &e.to_string()))?;
        if self.wrapping_key_bits < MIN_WRAPPING_KEY_BITS || self.wrapping_key_bits % 8 != 0 {
            return Err(invalid(
                "wrapping_key_bits",
                &format!(
                    "{} is not a byte-aligned size of at least {}",
                    self.wrapping_key_bits, MIN_WRAPPING_KEY_BITS
                ),
            ));
        }
        if self.key_algorithm > MAX_SMALL_INT {
            return Err(invalid(
                "key_algorithm",
                &format!("{} out of range", self.key_algorithm),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.to_string(),
    }
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(var: &str, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_string(var) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(name, &format!("{} ({})", raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProtocolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.wrapping_key_alias, "device_wrapping_key_alias");
        assert_eq!(config.import_key_alias, "device_wrapped_key_alias");
        assert_eq!(config.tek_size_bits, 256);
        assert_eq!(config.key_algorithm, 32);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ProtocolConfig::from_json(r#"{"tek_size_bits": 128}"#).unwrap();
        assert_eq!(config.tek_size_bits, 128);
        assert_eq!(config.cek_size_bits, 256);
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        for json in [
            r#"{"tek_size_bits": 250}"#,
            r#"{"cek_size_bits": 512}"#,
            r#"{"wrapping_key_bits": 512}"#,
            r#"{"key_algorithm": 300}"#,
            r#"{"import_key_alias": "device_wrapping_key_alias"}"#,
        ] {
            assert!(matches!(
                ProtocolConfig::from_json(json),
                Err(ConfigError::InvalidValue { .. })
            ));
        }
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("KEYIMPORT_TEK_SIZE_BITS", "192");
        std::env::set_var("KEYIMPORT_IMPORT_KEY_ALIAS", "env_alias");
        let config = ProtocolConfig::from_env();
        std::env::remove_var("KEYIMPORT_TEK_SIZE_BITS");
        std::env::remove_var("KEYIMPORT_IMPORT_KEY_ALIAS");

        let config = config.unwrap();
        assert_eq!(config.tek_size_bits, 192);
        assert_eq!(config.import_key_alias, "env_alias");
    }
}
