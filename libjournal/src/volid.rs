//! CSI volume identifier codec.
//!
//! The identifier handed to the orchestrator is the only state it passes
//! back on delete, so it must carry enough to find the journal again:
//!
//! ```text
//! <version:4hex> - <len(clusterID):4hex> - <clusterID> - <locationID:16hex> - <uuid:36>
//! ```
//!
//! All integers are big-endian hex.  The fixed fields and separators add up
//! to 64 bytes and the whole identifier may not exceed 128 bytes.

use std::fmt;
use std::str::FromStr;

use crate::error::{JournalError, Result};
use crate::types::UUID_ENCODED_LENGTH;

/// Maximum identifier length CSI allows.
pub const MAX_VOL_ID_LEN: usize = 128;

/// Current encoding version.
pub const VOL_ID_VERSION: u16 = 1;

/// 4+1+4+1+1+16+1+36
const KNOWN_FIELD_SIZE: usize = 64;

/// Decoded CSI volume (or snapshot) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CsiIdentifier {
    /// Pool id (RBD) or filesystem id (CephFS) hosting the object.
    pub location_id: i64,
    pub encoding_version: u16,
    pub cluster_id: String,
    /// Canonical UUID of the backend object.
    pub object_uuid: String,
}

impl CsiIdentifier {
    pub fn new(
        cluster_id: impl Into<String>,
        location_id: i64,
        object_uuid: impl Into<String>,
    ) -> Self {
        Self {
            location_id,
            encoding_version: VOL_ID_VERSION,
            cluster_id: cluster_id.into(),
            object_uuid: object_uuid.into(),
        }
    }

    /// Encode into the wire form.
    pub fn compose(&self) -> Result<String> {
        if KNOWN_FIELD_SIZE + self.cluster_id.len() > MAX_VOL_ID_LEN {
            return Err(JournalError::InvalidVolumeId(
                "CSI ID encoding length overflow".into(),
            ));
        }
        if self.object_uuid.len() != UUID_ENCODED_LENGTH {
            return Err(JournalError::InvalidVolumeId("CSI ID invalid object uuid".into()));
        }

        // bounded by the overflow check above
        let cluster_id_len = self.cluster_id.len() as u16;
        Ok(format!(
            "{}-{}-{}-{}-{}",
            hex::encode(self.encoding_version.to_be_bytes()),
            hex::encode(cluster_id_len.to_be_bytes()),
            self.cluster_id,
            hex::encode(self.location_id.to_be_bytes()),
            self.object_uuid,
        ))
    }

    /// Decode the wire form, validating every section length before
    /// slicing.
    pub fn decompose(composed: &str) -> Result<Self> {
        let underflow = || {
            JournalError::InvalidVolumeId("failed to decode CSI identifier, string underflow".into())
        };
        let b = composed.as_bytes();

        if b.len() < KNOWN_FIELD_SIZE {
            return Err(underflow());
        }

        let encoding_version = u16::from_be_bytes(decode_hex::<2>(&b[0..4])?);
        expect_separator(b, 4)?;
        let cluster_id_len = usize::from(u16::from_be_bytes(decode_hex::<2>(&b[5..9])?));
        expect_separator(b, 9)?;

        // 10 bytes consumed; the rest must hold clusterID, '-', 16 hex, '-', uuid
        let remaining = b.len() - 10;
        if remaining < cluster_id_len + 1 {
            return Err(underflow());
        }
        let cluster_id = std::str::from_utf8(&b[10..10 + cluster_id_len])
            .map_err(|e| JournalError::InvalidVolumeId(format!("cluster id is not utf-8: {e}")))?
            .to_owned();
        let mut next = 10 + cluster_id_len;
        expect_separator(b, next)?;
        next += 1;

        if b.len() - next < 17 {
            return Err(underflow());
        }
        let location_id = i64::from_be_bytes(decode_hex::<8>(&b[next..next + 16])?);
        expect_separator(b, next + 16)?;
        next += 17;

        if b.len() - next != UUID_ENCODED_LENGTH {
            return Err(JournalError::InvalidVolumeId(
                "failed to decode CSI identifier, string-length-mismatch".into(),
            ));
        }
        let object_uuid = std::str::from_utf8(&b[next..])
            .map_err(|e| JournalError::InvalidVolumeId(format!("uuid is not utf-8: {e}")))?
            .to_owned();

        Ok(Self {
            location_id,
            encoding_version,
            cluster_id,
            object_uuid,
        })
    }
}

fn decode_hex<const N: usize>(src: &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    hex::decode_to_slice(src, &mut out)
        .map_err(|e| JournalError::InvalidVolumeId(format!("invalid hex field: {e}")))?;
    Ok(out)
}

fn expect_separator(b: &[u8], idx: usize) -> Result<()> {
    match b.get(idx) {
        Some(b'-') => Ok(()),
        _ => Err(JournalError::InvalidVolumeId(format!(
            "expected '-' separator at offset {idx}"
        ))),
    }
}

impl fmt::Display for CsiIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.compose() {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(
                f,
                "<invalid csi id cluster={} location={} uuid={}>",
                self.cluster_id, self.location_id, self.object_uuid
            ),
        }
    }
}

impl FromStr for CsiIdentifier {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decompose(s)
    }
}
