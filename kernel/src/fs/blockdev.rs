//! Block device abstraction: 512-byte blocks, shared handles.
//!
//! The SD host driver implements this on hardware; tests use the RAM-backed
//! implementation.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::{FsError, FsResult};

/// Fixed transfer unit of the block layer.
pub const BLOCK_SIZE: usize = 512;

/// A device addressable in 512-byte blocks. Interior mutability so handles
/// can be shared (`Arc<dyn BlockDevice>`).
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, idx: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()>;
    fn write_block(&self, idx: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()>;
}

/// RAM-backed block device.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0u8; blocks * BLOCK_SIZE]),
        })
    }

    /// Build from an existing image, padded up to a whole block.
    pub fn from_image(image: &[u8]) -> Arc<Self> {
        let mut data = image.to_vec();
        let rem = data.len() % BLOCK_SIZE;
        if rem != 0 {
            data.resize(data.len() + BLOCK_SIZE - rem, 0);
        }
        Arc::new(Self {
            data: Mutex::new(data),
        })
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, idx: u32, buf: &mut [u8; BLOCK_SIZE]) -> FsResult<()> {
        let data = self.data.lock();
        let start = idx as usize * BLOCK_SIZE;
        let block = data.get(start..start + BLOCK_SIZE).ok_or(FsError::Io)?;
        buf.copy_from_slice(block);
        Ok(())
    }

    fn write_block(&self, idx: u32, buf: &[u8; BLOCK_SIZE]) -> FsResult<()> {
        let mut data = self.data.lock();
        let start = idx as usize * BLOCK_SIZE;
        let block = data
            .get_mut(start..start + BLOCK_SIZE)
            .ok_or(FsError::Io)?;
        block.copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn ramdisk_round_trips_blocks() {
        let disk = RamDisk::new(4);
        let mut out = [0u8; BLOCK_SIZE];
        let mut pattern = [0u8; BLOCK_SIZE];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        disk.write_block(2, &pattern).expect("write");
        disk.read_block(2, &mut out).expect("read");
        assert_eq!(out[..], pattern[..]);
        assert_eq!(disk.read_block(4, &mut out).err(), Some(FsError::Io));
    }
}
