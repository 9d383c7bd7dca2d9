//! The kernel's file layer: a flat RAM-backed store behind one global
//! file-system lock. Syscalls take the lock around every operation; a
//! process that dies while holding it has it released on the exit path.

pub mod error;
pub mod file;
pub mod ramfs;

pub use error::{FsError, FsResult};
pub use file::File;

use crate::scheduler::sync::Lock;
use lazy_static::lazy_static;
use ramfs::RamFs;

lazy_static! {
    static ref FILESYS: RamFs = RamFs::new();
    static ref FS_LOCK: Lock = Lock::new();
}

/// Reformat the store; called once per boot.
pub fn init() {
    FILESYS.format();
}

/// The global file-system lock.
pub fn fs_lock() -> &'static Lock {
    &FS_LOCK
}

pub fn create(name: &str, size: usize) -> FsResult<()> {
    FILESYS.create(name, size)
}

pub fn remove(name: &str) -> FsResult<()> {
    FILESYS.remove(name)
}

pub fn open(name: &str) -> FsResult<File> {
    FILESYS.open(name)
}
