//! RAM-backed block device. Serves as the swap device on hosted boots
//! and in tests, and as a scratch disk on bare metal.

use super::block::{BlockDevice, BlockError, BlockResult, SECTOR_SIZE};
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub struct RamDisk {
    sectors: u64,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: u64) -> RamDisk {
        RamDisk {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
        }
    }

    fn range(&self, sector: u64) -> BlockResult<core::ops::Range<usize>> {
        if sector >= self.sectors {
            return Err(BlockError::OutOfRange);
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> BlockResult<()> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data.lock()[range]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> BlockResult<()> {
        let range = self.range(sector)?;
        self.data.lock()[range].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.sectors
    }
}
