//! ASN.1 DER codec for the secure key import structure
//!
//! ```text
//! SecureKeyWrapper ::= SEQUENCE {
//!     version                INTEGER,        -- always 0
//!     encryptedTransportKey  OCTET STRING,   -- RSA-OAEP(CEK)
//!     initializationVector   OCTET STRING,   -- 12-byte GCM nonce
//!     keyDescription         KeyDescription,
//!     encryptedKey           OCTET STRING,   -- AES-GCM(CEK, TEK), tag removed
//!     tag                    OCTET STRING    -- 16-byte GCM tag
//! }
//!
//! KeyDescription ::= SEQUENCE {
//!     keyFormat              INTEGER,        -- 3 = RAW
//!     keyParams              AuthorizationList
//! }
//!
//! AuthorizationList ::= SEQUENCE {
//!     purpose        [1]   EXPLICIT SET OF INTEGER,
//!     algorithm      [2]   EXPLICIT INTEGER,
//!     keySize        [3]   EXPLICIT INTEGER,
//!     blockMode      [4]   EXPLICIT SET OF INTEGER,
//!     padding        [6]   EXPLICIT SET OF INTEGER,
//!     noAuthRequired [503] EXPLICIT NULL
//! }
//! ```
//!
//! The importer parses positionally, so field order is fixed. Tag numbers
//! come from the keystore attestation schema. `[503]` needs the high tag
//! number form, which is why explicit tags are written by [`ExplicitField`]
//! rather than the `der` crate's context-specific helpers.

use crate::envelope::EncryptedTekWrapper;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use der::asn1::{Null, OctetStringRef, SetOfVec};
use der::{
    Decode, Encode, EncodeValue, FixedTag, Length, Reader, SliceReader, Tag, Writer,
};
use thiserror::Error;

pub const WRAPPED_FORMAT_VERSION: u32 = 0;
pub const KM_KEY_FORMAT_RAW: u32 = 3;
pub const KM_ALGORITHM_AES: u32 = 32;

pub const KM_PURPOSE_ENCRYPT: u32 = 0;
pub const KM_PURPOSE_DECRYPT: u32 = 1;
pub const KM_MODE_ECB: u32 = 1;
pub const KM_MODE_CBC: u32 = 2;
pub const KM_PAD_NONE: u32 = 1;
pub const KM_PAD_PKCS7: u32 = 64;

pub const TAG_PURPOSE: u32 = 1;
pub const TAG_ALGORITHM: u32 = 2;
pub const TAG_KEY_SIZE: u32 = 3;
pub const TAG_BLOCK_MODE: u32 = 4;
pub const TAG_PADDING: u32 = 6;
pub const TAG_NO_AUTH_REQUIRED: u32 = 503;

/// Largest algorithm identifier or format version accepted
pub const MAX_SMALL_INT: u32 = 255;

/// Largest key size accepted in an authorization list
pub const MAX_KEY_SIZE_BITS: u32 = 8192;

const CLASS_CONTEXT_SPECIFIC: u8 = 0x80;
const CONSTRUCTED: u8 = 0x20;
const HIGH_TAG_NUMBER: u8 = 0x1F;

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unexpected structure: {0}")]
    Structure(String),

    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// An `[n] EXPLICIT` wrapper that supports tag numbers above 30
pub struct ExplicitField<'a, T> {
    number: u32,
    inner: &'a T,
}

impl<'a, T: Encode> ExplicitField<'a, T> {
    pub fn new(number: u32, inner: &'a T) -> Self {
        ExplicitField { number, inner }
    }
}

/// Identifier octets for a constructed context-specific tag
fn context_identifier(number: u32) -> Vec<u8> {
    let lead = CLASS_CONTEXT_SPECIFIC | CONSTRUCTED;
    if number < u32::from(HIGH_TAG_NUMBER) {
        return vec![lead | number as u8];
    }

    // High tag number form: base-128, most significant group first
    let mut groups = Vec::new();
    let mut n = number;
    loop {
        groups.push((n & 0x7F) as u8);
        n >>= 7;
        if n == 0 {
            break;
        }
    }
    groups.reverse();
    let last = groups.len() - 1;
    for group in &mut groups[..last] {
        *group |= 0x80;
    }

    let mut out = Vec::with_capacity(groups.len() + 1);
    out.push(lead | HIGH_TAG_NUMBER);
    out.extend_from_slice(&groups);
    out
}

impl<'a, T: Encode> Encode for ExplicitField<'a, T> {
    fn encoded_len(&self) -> der::Result<Length> {
        let inner_len = self.inner.encoded_len()?;
        let identifier_len = Length::try_from(context_identifier(self.number).len())?;
        (identifier_len + inner_len.encoded_len()?)? + inner_len
    }

    fn encode(&self, writer: &mut impl Writer) -> der::Result<()> {
        writer.write(&context_identifier(self.number))?;
        self.inner.encoded_len()?.encode(writer)?;
        self.inner.encode(writer)
    }
}

fn check_small_int(name: &str, value: u32) -> Result<(), WrapperError> {
    if value > MAX_SMALL_INT {
        return Err(WrapperError::InvalidArgument(format!(
            "{} {} out of range 0..={}",
            name, value, MAX_SMALL_INT
        )));
    }
    Ok(())
}

fn set_of(values: &[u32]) -> Result<SetOfVec<u32>, WrapperError> {
    Ok(SetOfVec::try_from(values.to_vec())?)
}

/// Usage restrictions attached to the imported key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationList {
    pub purposes: SetOfVec<u32>,
    pub algorithm: u32,
    pub key_size_bits: u32,
    pub block_modes: SetOfVec<u32>,
    pub paddings: SetOfVec<u32>,
    pub no_auth_required: bool,
}

impl AuthorizationList {
    /// Encrypt/decrypt, ECB/CBC, PKCS7/none, no user authentication
    pub fn for_import(key_size_bits: u32, algorithm: u32) -> Result<Self, WrapperError> {
        if key_size_bits == 0 || key_size_bits % 8 != 0 {
            return Err(WrapperError::InvalidArgument(format!(
                "key size {} bits is not a positive multiple of 8",
                key_size_bits
            )));
        }
        if key_size_bits > MAX_KEY_SIZE_BITS {
            return Err(WrapperError::InvalidArgument(format!(
                "key size {} bits exceeds {}",
                key_size_bits, MAX_KEY_SIZE_BITS
            )));
        }
        check_small_int("algorithm", algorithm)?;

        Ok(AuthorizationList {
            purposes: set_of(&[KM_PURPOSE_ENCRYPT, KM_PURPOSE_DECRYPT])?,
            algorithm,
            key_size_bits,
            block_modes: set_of(&[KM_MODE_ECB, KM_MODE_CBC])?,
            paddings: set_of(&[KM_PAD_PKCS7, KM_PAD_NONE])?,
            no_auth_required: true,
        })
    }

    /// Parse an encoded authorization list
    pub fn from_der(bytes: &[u8]) -> Result<Self, WrapperError> {
        let outer = TlvReader::new(bytes)?.single()?;
        outer.expect_sequence("AuthorizationList")?;

        let mut fields = TlvReader::new(outer.contents)?;
        let purposes = SetOfVec::<u32>::from_der(fields.explicit(TAG_PURPOSE)?.contents)?;
        let algorithm = u32::from_der(fields.explicit(TAG_ALGORITHM)?.contents)?;
        let key_size_bits = u32::from_der(fields.explicit(TAG_KEY_SIZE)?.contents)?;
        let block_modes = SetOfVec::<u32>::from_der(fields.explicit(TAG_BLOCK_MODE)?.contents)?;
        let paddings = SetOfVec::<u32>::from_der(fields.explicit(TAG_PADDING)?.contents)?;

        let no_auth_required = if fields.is_finished() {
            false
        } else {
            Null::from_der(fields.explicit(TAG_NO_AUTH_REQUIRED)?.contents)?;
            true
        };
        fields.finish("AuthorizationList")?;

        Ok(AuthorizationList {
            purposes,
            algorithm,
            key_size_bits,
            block_modes,
            paddings,
            no_auth_required,
        })
    }
}

impl FixedTag for AuthorizationList {
    const TAG: Tag = Tag::Sequence;
}

impl EncodeValue for AuthorizationList {
    fn value_len(&self) -> der::Result<Length> {
        let mut lengths = vec![
            ExplicitField::new(TAG_PURPOSE, &self.purposes).encoded_len()?,
            ExplicitField::new(TAG_ALGORITHM, &self.algorithm).encoded_len()?,
            ExplicitField::new(TAG_KEY_SIZE, &self.key_size_bits).encoded_len()?,
            ExplicitField::new(TAG_BLOCK_MODE, &self.block_modes).encoded_len()?,
            ExplicitField::new(TAG_PADDING, &self.paddings).encoded_len()?,
        ];
        if self.no_auth_required {
            lengths.push(ExplicitField::new(TAG_NO_AUTH_REQUIRED, &Null).encoded_len()?);
        }
        lengths
            .into_iter()
            .try_fold(Length::ZERO, |acc, len| acc + len)
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        ExplicitField::new(TAG_PURPOSE, &self.purposes).encode(writer)?;
        ExplicitField::new(TAG_ALGORITHM, &self.algorithm).encode(writer)?;
        ExplicitField::new(TAG_KEY_SIZE, &self.key_size_bits).encode(writer)?;
        ExplicitField::new(TAG_BLOCK_MODE, &self.block_modes).encode(writer)?;
        ExplicitField::new(TAG_PADDING, &self.paddings).encode(writer)?;
        if self.no_auth_required {
            ExplicitField::new(TAG_NO_AUTH_REQUIRED, &Null).encode(writer)?;
        }
        Ok(())
    }
}

/// Key format plus authorization list; also the GCM AAD
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescription {
    pub key_format: u32,
    pub authorization_list: AuthorizationList,
}

impl KeyDescription {
    pub fn from_der(bytes: &[u8]) -> Result<Self, WrapperError> {
        let outer = TlvReader::new(bytes)?.single()?;
        outer.expect_sequence("KeyDescription")?;

        let mut fields = TlvReader::new(outer.contents)?;
        let key_format = u32::from_der(fields.next_tlv()?.encoded)?;
        let authorization_list = AuthorizationList::from_der(fields.next_tlv()?.encoded)?;
        fields.finish("KeyDescription")?;

        Ok(KeyDescription {
            key_format,
            authorization_list,
        })
    }
}

impl FixedTag for KeyDescription {
    const TAG: Tag = Tag::Sequence;
}

impl EncodeValue for KeyDescription {
    fn value_len(&self) -> der::Result<Length> {
        self.key_format.encoded_len()? + self.authorization_list.encoded_len()?
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.key_format.encode(writer)?;
        self.authorization_list.encode(writer)
    }
}

/// Wrap `[keyFormatRaw=3, auth_list]` into a key description
pub fn build_import_metadata(auth_list: AuthorizationList) -> KeyDescription {
    KeyDescription {
        key_format: KM_KEY_FORMAT_RAW,
        authorization_list: auth_list,
    }
}

/// The complete wrapped-key artifact handed to the device importer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureKeyWrapper {
    pub version: u32,
    pub encrypted_transport_key: Vec<u8>,
    pub initialization_vector: Vec<u8>,
    pub key_description: KeyDescription,
    pub encrypted_key: Vec<u8>,
    pub tag: Vec<u8>,
}

impl SecureKeyWrapper {
    pub fn new(
        wrapper: &EncryptedTekWrapper,
        encrypted_cek: &[u8],
        key_description: KeyDescription,
    ) -> Self {
        SecureKeyWrapper {
            version: WRAPPED_FORMAT_VERSION,
            encrypted_transport_key: encrypted_cek.to_vec(),
            initialization_vector: wrapper.iv.to_vec(),
            key_description,
            encrypted_key: wrapper.ciphertext.clone(),
            tag: wrapper.tag.clone(),
        }
    }

    pub fn to_der_bytes(&self) -> Result<Vec<u8>, WrapperError> {
        check_small_int("format version", self.version)?;
        Ok(self.to_der()?)
    }

    pub fn to_base64(&self) -> Result<String, WrapperError> {
        Ok(BASE64.encode(self.to_der_bytes()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, WrapperError> {
        Self::from_der_bytes(&BASE64.decode(encoded.trim())?)
    }

    /// Structural decode; used by the software keystore and tests
    pub fn from_der_bytes(bytes: &[u8]) -> Result<Self, WrapperError> {
        let outer = TlvReader::new(bytes)?.single()?;
        outer.expect_sequence("SecureKeyWrapper")?;

        let mut fields = TlvReader::new(outer.contents)?;
        let version = u32::from_der(fields.next_tlv()?.encoded)?;
        let encrypted_transport_key = octets(fields.next_tlv()?)?;
        let initialization_vector = octets(fields.next_tlv()?)?;
        let key_description = KeyDescription::from_der(fields.next_tlv()?.encoded)?;
        let encrypted_key = octets(fields.next_tlv()?)?;
        let tag = octets(fields.next_tlv()?)?;
        fields.finish("SecureKeyWrapper")?;

        Ok(SecureKeyWrapper {
            version,
            encrypted_transport_key,
            initialization_vector,
            key_description,
            encrypted_key,
            tag,
        })
    }
}

impl FixedTag for SecureKeyWrapper {
    const TAG: Tag = Tag::Sequence;
}

impl EncodeValue for SecureKeyWrapper {
    fn value_len(&self) -> der::Result<Length> {
        [
            self.version.encoded_len()?,
            OctetStringRef::new(&self.encrypted_transport_key)?.encoded_len()?,
            OctetStringRef::new(&self.initialization_vector)?.encoded_len()?,
            self.key_description.encoded_len()?,
            OctetStringRef::new(&self.encrypted_key)?.encoded_len()?,
            OctetStringRef::new(&self.tag)?.encoded_len()?,
        ]
        .into_iter()
        .try_fold(Length::ZERO, |acc, len| acc + len)
    }

    fn encode_value(&self, writer: &mut impl Writer) -> der::Result<()> {
        self.version.encode(writer)?;
        OctetStringRef::new(&self.encrypted_transport_key)?.encode(writer)?;
        OctetStringRef::new(&self.initialization_vector)?.encode(writer)?;
        self.key_description.encode(writer)?;
        OctetStringRef::new(&self.encrypted_key)?.encode(writer)?;
        OctetStringRef::new(&self.tag)?.encode(writer)
    }
}

/// Assemble the six-field structure and DER-encode it
pub fn encode(
    wrapper: &EncryptedTekWrapper,
    encrypted_cek: &[u8],
    metadata: &KeyDescription,
) -> Result<Vec<u8>, WrapperError> {
    SecureKeyWrapper::new(wrapper, encrypted_cek, metadata.clone()).to_der_bytes()
}

fn octets(tlv: Tlv<'_>) -> Result<Vec<u8>, WrapperError> {
    Ok(OctetStringRef::from_der(tlv.encoded)?.as_bytes().to_vec())
}

/// One decoded tag-length-value element
#[derive(Debug, Clone, Copy)]
struct Tlv<'a> {
    class: u8,
    constructed: bool,
    number: u32,
    /// Identifier, length and contents
    encoded: &'a [u8],
    contents: &'a [u8],
}

impl<'a> Tlv<'a> {
    fn expect_sequence(&self, name: &str) -> Result<(), WrapperError> {
        if self.class != 0 || !self.constructed || self.number != 0x10 {
            return Err(WrapperError::Structure(format!("{} is not a SEQUENCE", name)));
        }
        Ok(())
    }
}

/// Walks sibling TLVs, including high-number context tags
struct TlvReader<'a> {
    bytes: &'a [u8],
    reader: SliceReader<'a>,
}

impl<'a> TlvReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, WrapperError> {
        Ok(TlvReader {
            bytes,
            reader: SliceReader::new(bytes)?,
        })
    }

    fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    fn position(&self) -> Result<usize, WrapperError> {
        Ok(usize::try_from(self.reader.position())?)
    }

    fn next_tlv(&mut self) -> Result<Tlv<'a>, WrapperError> {
        if self.is_finished() {
            return Err(WrapperError::Structure("unexpected end of sequence".to_string()));
        }
        let start = self.position()?;

        let first = self.reader.read_byte()?;
        let class = first & 0xC0;
        let constructed = first & CONSTRUCTED != 0;
        let mut number = u32::from(first & HIGH_TAG_NUMBER);
        if number == u32::from(HIGH_TAG_NUMBER) {
            number = 0;
            loop {
                let byte = self.reader.read_byte()?;
                if number > (u32::MAX >> 7) {
                    return Err(WrapperError::Structure("tag number overflow".to_string()));
                }
                number = (number << 7) | u32::from(byte & 0x7F);
                if byte & 0x80 == 0 {
                    break;
                }
            }
        }

        let length = Length::decode(&mut self.reader)?;
        let contents = self.reader.read_slice(length)?;
        let end = self.position()?;

        Ok(Tlv {
            class,
            constructed,
            number,
            encoded: &self.bytes[start..end],
            contents,
        })
    }

    /// Next element, which must be `[number] EXPLICIT`
    fn explicit(&mut self, number: u32) -> Result<Tlv<'a>, WrapperError> {
        let tlv = self.next_tlv()?;
        if tlv.class != CLASS_CONTEXT_SPECIFIC || !tlv.constructed || tlv.number != number {
            return Err(WrapperError::Structure(format!(
                "expected [{}] EXPLICIT, found class {:#04x} tag {}",
                number, tlv.class, tlv.number
            )));
        }
        Ok(tlv)
    }

    /// The input must hold exactly one element
    fn single(mut self) -> Result<Tlv<'a>, WrapperError> {
        let tlv = self.next_tlv()?;
        self.finish("input")?;
        Ok(tlv)
    }

    fn finish(&self, name: &str) -> Result<(), WrapperError> {
        if !self.is_finished() {
            return Err(WrapperError::Structure(format!(
                "trailing data after {}",
                name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_tag_identifier() {
        assert_eq!(context_identifier(1), vec![0xA1]);
        assert_eq!(context_identifier(6), vec![0xA6]);
        assert_eq!(context_identifier(30), vec![0xBE]);
        assert_eq!(context_identifier(31), vec![0xBF, 0x1F]);
        assert_eq!(context_identifier(503), vec![0xBF, 0x83, 0x77]);
    }

    #[test]
    fn test_explicit_null_bytes() {
        let der = ExplicitField::new(TAG_NO_AUTH_REQUIRED, &Null).to_der().unwrap();
        assert_eq!(der, vec![0xBF, 0x83, 0x77, 0x02, 0x05, 0x00]);
    }

    #[test]
    fn test_authorization_list_bytes() {
        let list = AuthorizationList::for_import(256, KM_ALGORITHM_AES).unwrap();
        let der = list.to_der().unwrap();
        let expected: Vec<u8> = vec![
            0x30, 0x2F, // SEQUENCE
            0xA1, 0x08, 0x31, 0x06, 0x02, 0x01, 0x00, 0x02, 0x01, 0x01, // [1] {0, 1}
            0xA2, 0x03, 0x02, 0x01, 0x20, // [2] 32
            0xA3, 0x04, 0x02, 0x02, 0x01, 0x00, // [3] 256
            0xA4, 0x08, 0x31, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02, // [4] {1, 2}
            0xA6, 0x08, 0x31, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x40, // [6] {1, 64}
            0xBF, 0x83, 0x77, 0x02, 0x05, 0x00, // [503] NULL
        ];
        assert_eq!(der, expected);
    }

    #[test]
    fn test_authorization_list_decode() {
        let list = AuthorizationList::for_import(128, KM_ALGORITHM_AES).unwrap();
        let decoded = AuthorizationList::from_der(&list.to_der().unwrap()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.key_size_bits, 128);
        assert_eq!(decoded.paddings.as_slice(), &[KM_PAD_NONE, KM_PAD_PKCS7]);
        assert!(decoded.no_auth_required);
    }

    #[test]
    fn test_key_size_validation() {
        for bad in [0, 7, 250, 8200] {
            assert!(matches!(
                AuthorizationList::for_import(bad, KM_ALGORITHM_AES),
                Err(WrapperError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            AuthorizationList::for_import(256, 1000),
            Err(WrapperError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_key_description_layout() {
        let description =
            build_import_metadata(AuthorizationList::for_import(256, KM_ALGORITHM_AES).unwrap());
        let der = description.to_der().unwrap();
        // SEQUENCE { INTEGER 3, SEQUENCE {...} }
        assert_eq!(&der[..5], &[0x30, 0x34, 0x02, 0x01, 0x03]);
        assert_eq!(KeyDescription::from_der(&der).unwrap(), description);
    }

    #[test]
    fn test_wrapper_field_order() {
        let wrapper = EncryptedTekWrapper {
            ciphertext: vec![0xC1; 32],
            tag: vec![0x7A; 16],
            iv: [0x11; 12],
        };
        let description =
            build_import_metadata(AuthorizationList::for_import(256, KM_ALGORITHM_AES).unwrap());
        let der = encode(&wrapper, &[0xEE; 256], &description).unwrap();

        let decoded = SecureKeyWrapper::from_der_bytes(&der).unwrap();
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.encrypted_transport_key, vec![0xEE; 256]);
        assert_eq!(decoded.initialization_vector, vec![0x11; 12]);
        assert_eq!(decoded.key_description, description);
        assert_eq!(decoded.encrypted_key, vec![0xC1; 32]);
        assert_eq!(decoded.tag, vec![0x7A; 16]);
    }

    #[test]
    fn test_trailing_data_rejected() {
        let list = AuthorizationList::for_import(256, KM_ALGORITHM_AES).unwrap();
        let mut der = list.to_der().unwrap();
        der.push(0x00);
        assert!(AuthorizationList::from_der(&der).is_err());
    }

    #[test]
    fn test_wrong_explicit_tag_rejected() {
        let list = AuthorizationList::for_import(256, KM_ALGORITHM_AES).unwrap();
        let mut der = list.to_der().unwrap();
        // Renumber [1] to [5]
        der[2] = 0xA5;
        assert!(matches!(
            AuthorizationList::from_der(&der),
            Err(WrapperError::Structure(_))
        ));
    }
}
