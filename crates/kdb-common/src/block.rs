use crate::error::FieldError;
use std::fmt;

/// Every on-disk unit is exactly one block.
pub const BLOCK_SIZE: usize = 4096;

/// A raw block as it sits in the file.
pub type Block = [u8; BLOCK_SIZE];

/// Database identity byte written at offset 0 of block 0.
pub const DB_TAG: u8 = 0x11;
/// Current on-disk format version (major in the high byte).
pub const DB_VERSION: u16 = 0x0001;
/// The low version byte is stored XORed with this mask.
pub const VERSION_MASK: u8 = 0xFF;

pub const ORIGIN_NAME_LEN: usize = 100;
pub const KEK_LEN: usize = 512;
pub const FILE_ID_LEN: usize = 30;
pub const FILE_NAME_LEN: usize = 100;
pub const DATA_SPEC_LEN: usize = 11;
pub const PAYLOAD_LEN: usize = BLOCK_SIZE - 50;

/// Owner id stamped into every descriptor this format version writes.
pub const OWNER_DB_ID: [u8; 2] = [DB_TAG, 0x00];

/// Byte offsets of the header fields inside block 0.
pub mod header_layout {
    use super::*;

    pub const DB_TAG_AT: usize = 0;
    pub const VERSION_AT: usize = 1;
    pub const ORIGIN_AT: usize = 3;
    pub const KEK_AT: usize = ORIGIN_AT + ORIGIN_NAME_LEN;
    pub const CREATED_AT: usize = KEK_AT + KEK_LEN;
    /// End of the fields covered by the optional checksum.
    pub const FIELDS_END: usize = CREATED_AT + 8;
    pub const CHECKSUM_MARKER_AT: usize = FIELDS_END;
    pub const CHECKSUM_AT: usize = CHECKSUM_MARKER_AT + 4;
    pub const CHECKSUM_END: usize = CHECKSUM_AT + 32;

    pub const CHECKSUM_MARKER: [u8; 4] = *b"KSUM";
}

/// Byte offsets of the descriptor fields.
pub mod descriptor_layout {
    use super::*;

    pub const TAG_AT: usize = 0;
    pub const OWNER_AT: usize = 1;
    pub const FILE_ID_AT: usize = 3;
    pub const FILE_NAME_AT: usize = FILE_ID_AT + FILE_ID_LEN;
    pub const FILE_SIZE_AT: usize = FILE_NAME_AT + FILE_NAME_LEN;
    pub const END: usize = FILE_SIZE_AT + 8;
}

/// Byte offsets of the data block fields.
pub mod data_layout {
    use super::*;

    pub const TAG_AT: usize = 0;
    pub const NUMBER_AT: usize = 1;
    pub const FILE_ID_AT: usize = 9;
    pub const SPEC_AT: usize = FILE_ID_AT + FILE_ID_LEN;
    pub const PAYLOAD_AT: usize = SPEC_AT + DATA_SPEC_LEN;

    pub const TAG: u8 = b'B';
}

// The three record kinds must tile a block exactly.
const _: () = assert!(header_layout::FIELDS_END == 623);
const _: () = assert!(header_layout::CHECKSUM_END <= BLOCK_SIZE);
const _: () = assert!(descriptor_layout::END == 141);
const _: () = assert!(descriptor_layout::END <= BLOCK_SIZE);
const _: () = assert!(data_layout::PAYLOAD_AT == 50);
const _: () = assert!(data_layout::PAYLOAD_AT + PAYLOAD_LEN == BLOCK_SIZE);

/// Encodes a version number into its two on-disk bytes.
pub const fn encode_version(version: u16) -> [u8; 2] {
    [(version >> 8) as u8, (version as u8) ^ VERSION_MASK]
}

/// The first block of every database file.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    pub db_tag: u8,
    pub version: [u8; 2],
    pub origin_name: Vec<u8>,
    /// Sealed (encrypted) key-encryption-key.
    pub kek: [u8; KEK_LEN],
    /// Unix seconds.
    pub created_at: u64,
}

impl HeaderBlock {
    /// Serializes the header, stamping a BLAKE3 checksum over the fields.
    pub fn encode(&self) -> Result<Block, FieldError> {
        use header_layout::*;

        let mut block = [0u8; BLOCK_SIZE];
        block[DB_TAG_AT] = self.db_tag;
        block[VERSION_AT..VERSION_AT + 2].copy_from_slice(&self.version);
        put_bytes(
            &mut block[ORIGIN_AT..KEK_AT],
            &self.origin_name,
            "origin_name",
        )?;
        block[KEK_AT..CREATED_AT].copy_from_slice(&self.kek);
        block[CREATED_AT..FIELDS_END].copy_from_slice(&self.created_at.to_le_bytes());

        let digest = blake3::hash(&block[..FIELDS_END]);
        block[CHECKSUM_MARKER_AT..CHECKSUM_AT].copy_from_slice(&CHECKSUM_MARKER);
        block[CHECKSUM_AT..CHECKSUM_END].copy_from_slice(digest.as_bytes());

        Ok(block)
    }

    /// Extracts the header fields. No identity or version checks happen here.
    pub fn decode(block: &Block) -> Self {
        use header_layout::*;

        let mut kek = [0u8; KEK_LEN];
        kek.copy_from_slice(&block[KEK_AT..CREATED_AT]);

        Self {
            db_tag: block[DB_TAG_AT],
            version: [block[VERSION_AT], block[VERSION_AT + 1]],
            origin_name: get_bytes(&block[ORIGIN_AT..KEK_AT]).to_vec(),
            kek,
            created_at: get_u64(block, CREATED_AT),
        }
    }

    /// `None` when the block carries no checksum (older minimal format),
    /// otherwise whether the stored digest matches the fields.
    pub fn checksum_matches(block: &Block) -> Option<bool> {
        use header_layout::*;

        if block[CHECKSUM_MARKER_AT..CHECKSUM_AT] != CHECKSUM_MARKER {
            return None;
        }
        let digest = blake3::hash(&block[..FIELDS_END]);
        Some(digest.as_bytes()[..] == block[CHECKSUM_AT..CHECKSUM_END])
    }
}

impl fmt::Debug for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderBlock")
            .field("db_tag", &format_args!("{:#04x}", self.db_tag))
            .field("version", &format_args!("{:02x?}", self.version))
            .field("origin_name", &String::from_utf8_lossy(&self.origin_name))
            .field("kek", &format_args!("<{} sealed bytes>", KEK_LEN))
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Lifecycle tag of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorTag {
    Allocated,
    Closed,
    Deleted,
}

impl DescriptorTag {
    pub const fn as_byte(self) -> u8 {
        match self {
            DescriptorTag::Allocated => b'A',
            DescriptorTag::Closed => b'C',
            DescriptorTag::Deleted => b'D',
        }
    }

    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'A' => Some(DescriptorTag::Allocated),
            b'C' => Some(DescriptorTag::Closed),
            b'D' => Some(DescriptorTag::Deleted),
            _ => None,
        }
    }
}

/// Extent metadata for one logical stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub tag: DescriptorTag,
    pub owner_db_id: [u8; 2],
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

impl BlockDescriptor {
    pub fn new(file_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            tag: DescriptorTag::Allocated,
            owner_db_id: OWNER_DB_ID,
            file_id: file_id.into(),
            file_name: file_name.into(),
            file_size: 0,
        }
    }

    pub fn encode(&self) -> Result<Block, FieldError> {
        use descriptor_layout::*;

        let mut block = [0u8; BLOCK_SIZE];
        block[TAG_AT] = self.tag.as_byte();
        block[OWNER_AT..FILE_ID_AT].copy_from_slice(&self.owner_db_id);
        put_bytes(
            &mut block[FILE_ID_AT..FILE_NAME_AT],
            self.file_id.as_bytes(),
            "file_id",
        )?;
        put_bytes(
            &mut block[FILE_NAME_AT..FILE_SIZE_AT],
            self.file_name.as_bytes(),
            "file_name",
        )?;
        block[FILE_SIZE_AT..END].copy_from_slice(&self.file_size.to_le_bytes());
        Ok(block)
    }

    /// Returns `None` if the block does not start with a descriptor tag.
    pub fn decode(block: &Block) -> Option<Self> {
        use descriptor_layout::*;

        let tag = DescriptorTag::from_byte(block[TAG_AT])?;
        Some(Self {
            tag,
            owner_db_id: [block[OWNER_AT], block[OWNER_AT + 1]],
            file_id: get_string(&block[FILE_ID_AT..FILE_NAME_AT]),
            file_name: get_string(&block[FILE_NAME_AT..FILE_SIZE_AT]),
            file_size: get_u64(block, FILE_SIZE_AT),
        })
    }
}

/// One physical page of a stored object's content.
#[derive(Clone, PartialEq, Eq)]
pub struct DataBlock {
    /// Page index within the object.
    pub block_number: u64,
    pub file_id: String,
    /// Number of meaningful payload bytes.
    pub used: u16,
    pub payload: Box<[u8; PAYLOAD_LEN]>,
}

impl DataBlock {
    pub fn new(file_id: impl Into<String>, block_number: u64) -> Self {
        Self {
            block_number,
            file_id: file_id.into(),
            used: 0,
            payload: Box::new([0u8; PAYLOAD_LEN]),
        }
    }

    pub fn encode(&self) -> Result<Block, FieldError> {
        use data_layout::*;

        let mut block = [0u8; BLOCK_SIZE];
        block[TAG_AT] = TAG;
        block[NUMBER_AT..FILE_ID_AT].copy_from_slice(&self.block_number.to_le_bytes());
        put_bytes(
            &mut block[FILE_ID_AT..SPEC_AT],
            self.file_id.as_bytes(),
            "file_id",
        )?;
        block[SPEC_AT..SPEC_AT + 2].copy_from_slice(&self.used.to_le_bytes());
        block[PAYLOAD_AT..].copy_from_slice(&self.payload[..]);
        Ok(block)
    }

    pub fn decode(block: &Block) -> Option<Self> {
        use data_layout::*;

        if block[TAG_AT] != TAG {
            return None;
        }
        let mut payload = Box::new([0u8; PAYLOAD_LEN]);
        payload.copy_from_slice(&block[PAYLOAD_AT..]);
        Some(Self {
            block_number: get_u64(block, NUMBER_AT),
            file_id: get_string(&block[FILE_ID_AT..SPEC_AT]),
            used: u16::from_le_bytes([block[SPEC_AT], block[SPEC_AT + 1]]),
            payload,
        })
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("block_number", &self.block_number)
            .field("file_id", &self.file_id)
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

/// What a raw block holds, judged by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Descriptor(DescriptorTag),
    Data,
    /// Never written, or written by something else.
    Unknown(u8),
}

pub fn block_kind(block: &Block) -> BlockKind {
    match block[0] {
        data_layout::TAG => BlockKind::Data,
        byte => match DescriptorTag::from_byte(byte) {
            Some(tag) => BlockKind::Descriptor(tag),
            None => BlockKind::Unknown(byte),
        },
    }
}

fn put_bytes(dst: &mut [u8], value: &[u8], field: &'static str) -> Result<(), FieldError> {
    if value.len() > dst.len() {
        return Err(FieldError::TooLong {
            field,
            len: value.len(),
            max: dst.len(),
        });
    }
    dst[..value.len()].copy_from_slice(value);
    Ok(())
}

/// Bytes up to the first NUL.
fn get_bytes(src: &[u8]) -> &[u8] {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    &src[..end]
}

fn get_string(src: &[u8]) -> String {
    String::from_utf8_lossy(get_bytes(src)).into_owned()
}

fn get_u64(block: &Block, at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&block[at..at + 8]);
    u64::from_le_bytes(raw)
}
