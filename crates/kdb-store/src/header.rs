//! Creation and validation of block 0.

use kdb_common::block::{encode_version, HeaderBlock};
use kdb_common::{Block, FieldError, ValidationError, DB_TAG, DB_VERSION, KEK_LEN, ORIGIN_NAME_LEN};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Builds a fresh header for `path`. The KEK is left zeroed for the caller to fill.
pub fn initialize(path: &Path, created_at: u64) -> HeaderBlock {
    HeaderBlock {
        db_tag: DB_TAG,
        version: encode_version(DB_VERSION),
        origin_name: origin_name(path),
        kek: [0u8; KEK_LEN],
        created_at,
    }
}

pub fn encode(header: &HeaderBlock) -> Result<Block, FieldError> {
    header.encode()
}

/// Checks identity, then version, then the optional checksum.
pub fn validate(raw: &Block) -> Result<HeaderBlock, ValidationError> {
    let header = HeaderBlock::decode(raw);

    if header.db_tag != DB_TAG {
        return Err(ValidationError::BadIdentity {
            expected: DB_TAG,
            found: header.db_tag,
        });
    }

    let expected = encode_version(DB_VERSION);
    if header.version != expected {
        return Err(ValidationError::BadVersion {
            expected,
            found: header.version,
        });
    }

    if HeaderBlock::checksum_matches(raw) == Some(false) {
        return Err(ValidationError::ChecksumMismatch);
    }

    Ok(header)
}

/// The trailing `ORIGIN_NAME_LEN` bytes of the path.
pub fn origin_name(path: &Path) -> Vec<u8> {
    let full = path.as_os_str().to_string_lossy();
    let bytes = full.as_bytes();
    let start = bytes.len().saturating_sub(ORIGIN_NAME_LEN);
    bytes[start..].to_vec()
}

/// Seconds since the Unix epoch; 0 if the clock is set before it.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
