pub mod block_store;
pub mod header;

pub use block_store::{block_offset, BlockStore};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("Store unavailable at {}: {source}", path.display())]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Offset {0} is not block aligned")]
    Misaligned(u64),
    #[error("Truncated block at offset {offset}: read {bytes_read} bytes")]
    Truncated { offset: u64, bytes_read: usize },
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}
