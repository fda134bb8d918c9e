//! Small shared types: encryption modes, credentials and pool-id encoding.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{JournalError, Result};

/// Sentinel for "no pool id recorded".
pub const INVALID_POOL_ID: i64 = -1;

/// Length of the canonical textual UUID form.
pub const UUID_ENCODED_LENGTH: usize = 36;

// ---------------------------------------------------------------------------
// Encryption type
// ---------------------------------------------------------------------------

/// How a volume is encrypted.  The on-disk form is the lowercase string
/// returned by [`EncryptionType::as_str`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionType {
    /// Unknown or unsupported value.
    Invalid,
    /// Not encrypted.
    #[default]
    None,
    /// Block-level (LUKS) encryption.
    Block,
    /// File-level (fscrypt) encryption.
    File,
}

impl EncryptionType {
    /// Parse the stored string.  The empty string means no encryption and
    /// anything unrecognised is [`EncryptionType::Invalid`].
    pub fn parse(s: &str) -> Self {
        match s {
            "block" => Self::Block,
            "file" => Self::File,
            "" => Self::None,
            _ => Self::Invalid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::File => "file",
            Self::None => "",
            Self::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Cephx user and the file holding its key.
///
/// The key file path may change between calls (secrets are re-materialised
/// per request); session identity is derived from the file *contents*.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub id: String,
    pub key_file: PathBuf,
}

impl Credentials {
    pub fn new(id: impl Into<String>, key_file: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            key_file: key_file.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pool id hex encoding
// ---------------------------------------------------------------------------

/// Encode a pool id as 16 lowercase hex digits of its big-endian bytes.
pub fn encode_pool_id(pool_id: i64) -> String {
    hex::encode(pool_id.to_be_bytes())
}

/// Inverse of [`encode_pool_id`].
pub fn decode_pool_id(encoded: &str) -> Result<i64> {
    let bytes = hex::decode(encoded).map_err(|e| {
        JournalError::InvalidArgument(format!("failed to decode string {encoded:?}: {e}"))
    })?;
    let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
        JournalError::InvalidArgument(format!(
            "pool id {encoded:?} decodes to {} bytes, expected 8",
            bytes.len()
        ))
    })?;
    Ok(i64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encryption_type_parsing() {
        assert_eq!(EncryptionType::parse("block"), EncryptionType::Block);
        assert_eq!(EncryptionType::parse("file"), EncryptionType::File);
        assert_eq!(EncryptionType::parse(""), EncryptionType::None);
        assert_eq!(EncryptionType::parse("luks2"), EncryptionType::Invalid);
        assert_eq!(EncryptionType::Block.to_string(), "block");
        assert_eq!(EncryptionType::None.as_str(), "");
    }

    #[test]
    fn pool_id_hex() {
        assert_eq!(encode_pool_id(9), "0000000000000009");
        assert_eq!(encode_pool_id(INVALID_POOL_ID), "ffffffffffffffff");
        assert_eq!(decode_pool_id("0000000000000003").unwrap(), 3);
        assert_eq!(decode_pool_id("ffffffffffffffff").unwrap(), INVALID_POOL_ID);
        assert!(decode_pool_id("zz").is_err());
        assert!(decode_pool_id("0003").is_err());
    }
}
