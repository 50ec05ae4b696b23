//! Wire format between clients and the block storage service.
//!
//! A request frame body is one mode byte (`R`, `W`, `C`, `D`) followed by a
//! postcard-encoded [`TxRequest`]. A response frame body is a postcard-encoded
//! [`TxResponse`]. Frames themselves come from `kdb_net::frame`.

use crate::StorageError;
use kdb_common::FILE_ID_LEN;
use kdb_net::MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};

pub const TX_SPEC_LEN: usize = 128;
/// Longest file name a transaction selector can carry.
pub const SPEC_FILE_NAME_LEN: usize = 80;
/// Largest read a single response frame can carry.
pub const MAX_READ_LEN: u64 = (MAX_FRAME_LEN - 1024) as u64;

mod spec_layout {
    use super::*;

    pub const MODE_AT: usize = 0;
    pub const FILE_ID_AT: usize = 1;
    pub const OFFSET_AT: usize = FILE_ID_AT + FILE_ID_LEN;
    pub const LENGTH_AT: usize = OFFSET_AT + 8;
    pub const NAME_LEN_AT: usize = LENGTH_AT + 8;
    pub const NAME_AT: usize = NAME_LEN_AT + 1;
}

const _: () = assert!(spec_layout::NAME_AT + SPEC_FILE_NAME_LEN == TX_SPEC_LEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMode {
    Read,
    Write,
    Close,
    Delete,
}

impl TxMode {
    pub const fn as_byte(self) -> u8 {
        match self {
            TxMode::Read => b'R',
            TxMode::Write => b'W',
            TxMode::Close => b'C',
            TxMode::Delete => b'D',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, StorageError> {
        match byte {
            b'R' => Ok(TxMode::Read),
            b'W' => Ok(TxMode::Write),
            b'C' => Ok(TxMode::Close),
            b'D' => Ok(TxMode::Delete),
            other => Err(StorageError::InvalidMode(other)),
        }
    }
}

/// What a client asks for. Which fields matter depends on the mode.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TxRequest {
    pub file_id: String,
    /// Only used when a write allocates the object.
    pub file_name: String,
    pub offset: u64,
    /// Bytes to read.
    pub length: u64,
    /// Bytes to write.
    pub data: Vec<u8>,
}

impl TxRequest {
    pub fn read(file_id: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            file_id: file_id.into(),
            offset,
            length,
            ..Self::default()
        }
    }

    pub fn write(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        offset: u64,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            offset,
            data: data.into(),
            ..Self::default()
        }
    }

    /// Request for modes that only name the object (close, delete).
    pub fn target(file_id: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            ..Self::default()
        }
    }

    /// Encodes a full request frame body: mode byte, then the payload.
    pub fn encode(&self, mode: TxMode) -> Result<Vec<u8>, StorageError> {
        let payload =
            postcard::to_allocvec(self).map_err(|e| StorageError::Malformed(e.to_string()))?;
        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(mode.as_byte());
        body.extend_from_slice(&payload);
        Ok(body)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StorageError> {
        postcard::from_bytes(payload).map_err(|e| StorageError::Malformed(e.to_string()))
    }

    fn check(&self, mode: TxMode) -> Result<(), StorageError> {
        check_text("file_id", &self.file_id, FILE_ID_LEN)?;
        if self.file_id.is_empty() {
            return Err(StorageError::Malformed("file_id is empty".into()));
        }
        check_text("file_name", &self.file_name, SPEC_FILE_NAME_LEN)?;

        match mode {
            TxMode::Read => {
                if self.length > MAX_READ_LEN {
                    return Err(StorageError::Malformed(format!(
                        "read of {} bytes exceeds {}",
                        self.length, MAX_READ_LEN
                    )));
                }
                end_of(self.offset, self.length)?;
            }
            TxMode::Write => {
                end_of(self.offset, self.data.len() as u64)?;
            }
            TxMode::Close | TxMode::Delete => {}
        }
        Ok(())
    }
}

fn check_text(field: &str, value: &str, max: usize) -> Result<(), StorageError> {
    if value.len() > max {
        return Err(StorageError::Malformed(format!(
            "{} is {} bytes, limit is {}",
            field,
            value.len(),
            max
        )));
    }
    if value.as_bytes().contains(&0) {
        return Err(StorageError::Malformed(format!("{} contains NUL", field)));
    }
    Ok(())
}

fn end_of(offset: u64, len: u64) -> Result<u64, StorageError> {
    offset
        .checked_add(len)
        .ok_or_else(|| StorageError::Malformed("offset overflows".into()))
}

/// Splits a request frame body into its mode and payload.
pub fn split_request(body: &[u8]) -> Result<(TxMode, &[u8]), StorageError> {
    let (&mode, payload) = body
        .split_first()
        .ok_or_else(|| StorageError::Malformed("empty request".into()))?;
    Ok((TxMode::from_byte(mode)?, payload))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum TxResponse {
    Done { tx_id: u64, data: Vec<u8> },
    Failed { tx_id: Option<u64>, reason: String },
}

impl TxResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Decoded form of the 128-byte operation selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSelector {
    pub mode: TxMode,
    pub file_id: String,
    pub offset: u64,
    pub length: u64,
    pub file_name: String,
}

impl TxSelector {
    /// Layout: mode(1) | file_id(30) | offset u64 LE | length u64 LE |
    /// name_len(1) | file_name(80).
    pub fn encode(&self) -> Result<[u8; TX_SPEC_LEN], StorageError> {
        use spec_layout::*;

        check_text("file_id", &self.file_id, FILE_ID_LEN)?;
        check_text("file_name", &self.file_name, SPEC_FILE_NAME_LEN)?;

        let mut spec = [0u8; TX_SPEC_LEN];
        spec[MODE_AT] = self.mode.as_byte();
        spec[FILE_ID_AT..FILE_ID_AT + self.file_id.len()].copy_from_slice(self.file_id.as_bytes());
        spec[OFFSET_AT..LENGTH_AT].copy_from_slice(&self.offset.to_le_bytes());
        spec[LENGTH_AT..NAME_LEN_AT].copy_from_slice(&self.length.to_le_bytes());
        spec[NAME_LEN_AT] = self.file_name.len() as u8;
        spec[NAME_AT..NAME_AT + self.file_name.len()].copy_from_slice(self.file_name.as_bytes());
        Ok(spec)
    }

    pub fn decode(spec: &[u8; TX_SPEC_LEN]) -> Result<Self, StorageError> {
        use spec_layout::*;

        let mode = TxMode::from_byte(spec[MODE_AT])?;

        let id_field = &spec[FILE_ID_AT..OFFSET_AT];
        let id_len = id_field.iter().position(|&b| b == 0).unwrap_or(FILE_ID_LEN);
        let file_id = text(&id_field[..id_len])?;

        let name_len = spec[NAME_LEN_AT] as usize;
        if name_len > SPEC_FILE_NAME_LEN {
            return Err(StorageError::Malformed("selector name length".into()));
        }
        let file_name = text(&spec[NAME_AT..NAME_AT + name_len])?;

        Ok(Self {
            mode,
            file_id,
            offset: read_u64(&spec[OFFSET_AT..LENGTH_AT]),
            length: read_u64(&spec[LENGTH_AT..NAME_LEN_AT]),
            file_name,
        })
    }
}

fn text(bytes: &[u8]) -> Result<String, StorageError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::Malformed(e.to_string()))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

/// In-memory record of one client-requested operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDescriptor {
    pub id: u64,
    /// Bytes written for writes, bytes requested for reads, 0 otherwise.
    pub size: u64,
    pub spec: [u8; TX_SPEC_LEN],
    /// Write payload; empty for other modes.
    pub data: Vec<u8>,
}

impl TransactionDescriptor {
    /// Validates a decoded request and packs it into a descriptor.
    pub fn build(id: u64, request: TxRequest, mode: TxMode) -> Result<Self, StorageError> {
        request.check(mode)?;

        let size = match mode {
            TxMode::Write => request.data.len() as u64,
            TxMode::Read => request.length,
            TxMode::Close | TxMode::Delete => 0,
        };
        let selector = TxSelector {
            mode,
            file_id: request.file_id,
            offset: request.offset,
            length: request.length,
            file_name: request.file_name,
        };
        let data = match mode {
            TxMode::Write => request.data,
            _ => Vec::new(),
        };

        Ok(Self {
            id,
            size,
            spec: selector.encode()?,
            data,
        })
    }

    pub fn selector(&self) -> Result<TxSelector, StorageError> {
        TxSelector::decode(&self.spec)
    }
}
