//! The block-device contract: 512-byte sectors behind a role registry.
//! The swap table claims whichever device carries the `Swap` role.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use lazy_static::lazy_static;
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub enum BlockError {
    OutOfRange,
    Timeout,
    DeviceFault,
    Io,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockError::OutOfRange => write!(f, "sector out of range"),
            BlockError::Timeout => write!(f, "device timeout"),
            BlockError::DeviceFault => write!(f, "device fault"),
            BlockError::Io => write!(f, "I/O error"),
        }
    }
}

pub type BlockResult<T> = Result<T, BlockError>;

pub trait BlockDevice: Send + Sync {
    fn read(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> BlockResult<()>;
    fn write(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> BlockResult<()>;
    /// Device capacity in sectors.
    fn size(&self) -> u64;
}

/// What a registered device is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Swap,
    FileSys,
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<(BlockRole, Arc<dyn BlockDevice>)>> = Mutex::new(Vec::new());
}

/// Reset the registry; called once per boot before devices register.
pub fn init() {
    DEVICES.lock().clear();
}

pub fn register(role: BlockRole, dev: Arc<dyn BlockDevice>) {
    DEVICES.lock().push((role, dev));
}

/// The first device registered with `role`.
pub fn by_role(role: BlockRole) -> Option<Arc<dyn BlockDevice>> {
    DEVICES
        .lock()
        .iter()
        .find(|(r, _)| *r == role)
        .map(|(_, d)| d.clone())
}
