pub mod block;
pub mod error;

// Re-export commonly used types
pub use block::{
    block_kind, encode_version, Block, BlockDescriptor, BlockKind, DataBlock, DescriptorTag,
    HeaderBlock, BLOCK_SIZE, DB_TAG, DB_VERSION, FILE_ID_LEN, FILE_NAME_LEN, KEK_LEN,
    ORIGIN_NAME_LEN, PAYLOAD_LEN,
};
pub use error::{FieldError, ValidationError};
