use crate::IoError;
use kdb_common::{Block, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Byte offset of block `n`.
pub const fn block_offset(n: u64) -> u64 {
    n * BLOCK_SIZE as u64
}

/// Block-addressed access to the database file.
///
/// Reads and writes go through separate handles, so a read issued after a
/// write sees whatever the filesystem exposes at that point. A single writer
/// process is assumed.
pub struct BlockStore {
    path: PathBuf,
    writer: File,
    reader: File,
}

impl BlockStore {
    /// Opens (creating if needed) the file. Fails if either handle cannot be acquired.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |source| IoError::Unavailable {
            path: path.clone(),
            source,
        };

        let writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(unavailable)?;
        let reader = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(unavailable)?;

        debug!(path = %path.display(), "block store opened");
        Ok(Self {
            path,
            writer,
            reader,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the block at `offset`, returning it with the number of bytes
    /// actually present. 0 means past the end of the file; anything short of
    /// `BLOCK_SIZE` is a truncated block and is left for the caller to judge.
    pub fn read_block(&self, offset: u64) -> Result<(Block, usize), IoError> {
        check_aligned(offset)?;

        let mut reader = &self.reader;
        reader.seek(SeekFrom::Start(offset))?;

        let mut block = [0u8; BLOCK_SIZE];
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            match reader.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok((block, filled))
    }

    /// Like `read_block`, but anything other than a whole block is an error.
    pub fn read_full_block(&self, offset: u64) -> Result<Block, IoError> {
        match self.read_block(offset)? {
            (block, BLOCK_SIZE) => Ok(block),
            (_, bytes_read) => Err(IoError::Truncated { offset, bytes_read }),
        }
    }

    pub fn write_block(&mut self, offset: u64, block: &Block) -> Result<(), IoError> {
        check_aligned(offset)?;
        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(block)?;
        Ok(())
    }

    /// Writes `block` after the last whole block and returns its offset.
    pub fn append_block(&mut self, block: &Block) -> Result<u64, IoError> {
        let offset = block_offset(self.block_count()?);
        self.write_block(offset, block)?;
        Ok(offset)
    }

    /// Number of whole blocks in the file.
    pub fn block_count(&self) -> Result<u64, IoError> {
        let len = self.writer.metadata()?.len();
        Ok(len / BLOCK_SIZE as u64)
    }

    /// Flushes written blocks to stable storage.
    pub fn sync(&mut self) -> Result<(), IoError> {
        self.writer.flush()?;
        self.writer.sync_all()?;
        Ok(())
    }
}

fn check_aligned(offset: u64) -> Result<(), IoError> {
    if offset % BLOCK_SIZE as u64 != 0 {
        return Err(IoError::Misaligned(offset));
    }
    Ok(())
}
