//! File-backed `BlockDevice`: the external collaborator for raw storage
//! I/O. `embodios-core` never touches a filesystem; this is
//! the hosted stand-in for whatever bare-metal block driver a kernel would
//! plug in underneath.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockDeviceError {
    #[error("block device io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("read past end of device")]
    OutOfRange,
}

/// Fixed-size-block read interface. `read_blocks` is the one primitive a
/// bare-metal driver needs to expose; everything else (GGUF parsing)
/// consumes whole byte ranges assembled from it.
pub trait BlockDevice {
    fn block_size(&self) -> usize;
    fn total_blocks(&self) -> u64;
    fn read_blocks(&mut self, start_block: u64, buf: &mut [u8]) -> Result<(), BlockDeviceError>;
}

/// `std::fs::File`-backed block device using `Seek`+`Read` in place of a
/// real `pread`, since this crate doesn't reach for a platform-specific
/// positioned-read syscall just for a demo harness.
pub struct FileBlockDevice {
    file: File,
    block_size: usize,
    total_blocks: u64,
}

const DEFAULT_BLOCK_SIZE: usize = 4096;

impl FileBlockDevice {
    pub fn open(path: &Path) -> Result<Self, BlockDeviceError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let total_blocks = len.div_ceil(DEFAULT_BLOCK_SIZE as u64);
        Ok(FileBlockDevice { file, block_size: DEFAULT_BLOCK_SIZE, total_blocks })
    }

    /// Reads the whole file into one buffer, block by block through
    /// `read_blocks` (rather than a single `read_to_end`) so the block
    /// device abstraction is actually exercised end to end.
    pub fn read_whole_file(&mut self) -> Result<Vec<u8>, BlockDeviceError> {
        let mut out = vec![0u8; (self.total_blocks as usize) * self.block_size];
        for block in 0..self.total_blocks {
            let off = block as usize * self.block_size;
            self.read_blocks(block, &mut out[off..off + self.block_size])?;
        }
        let actual_len = self.file.metadata()?.len() as usize;
        out.truncate(actual_len);
        Ok(out)
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    fn read_blocks(&mut self, start_block: u64, buf: &mut [u8]) -> Result<(), BlockDeviceError> {
        if start_block >= self.total_blocks {
            return Err(BlockDeviceError::OutOfRange);
        }
        let offset = start_block * self.block_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        // Tail block may run past EOF; read_to_end-style partial fill with
        // zero-pad for the remainder, matching a block device's behavior
        // of always handing back full blocks.
        let mut read_so_far = 0;
        while read_so_far < buf.len() {
            match self.file.read(&mut buf[read_so_far..])? {
                0 => {
                    for b in &mut buf[read_so_far..] {
                        *b = 0;
                    }
                    break;
                }
                n => read_so_far += n,
            }
        }
        Ok(())
    }
}
