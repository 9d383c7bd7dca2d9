//! Flat in-memory file store. The real file-system engine is an
//! external collaborator; this is just enough backing for the syscall
//! surface and for lazily-loaded executables.

use super::error::{FsError, FsResult};
use super::file::{File, Inode};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use hashbrown::HashMap;
use spin::Mutex;

/// Longest accepted file name.
pub const NAME_MAX: usize = 30;

pub struct RamFs {
    files: Mutex<HashMap<String, Inode>>,
}

impl RamFs {
    pub fn new() -> RamFs {
        RamFs {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every file; the store starts empty each boot.
    pub fn format(&self) {
        self.files.lock().clear();
    }

    fn check_name(name: &str) -> FsResult<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(FsError::InvalidPath);
        }
        Ok(())
    }

    /// Create `name` with `size` zeroed bytes.
    pub fn create(&self, name: &str, size: usize) -> FsResult<()> {
        Self::check_name(name)?;
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        files.insert(String::from(name), Arc::new(Mutex::new(vec![0u8; size])));
        Ok(())
    }

    pub fn remove(&self, name: &str) -> FsResult<()> {
        Self::check_name(name)?;
        match self.files.lock().remove(name) {
            // Open handles keep the inode alive; the name is gone.
            Some(_) => Ok(()),
            None => Err(FsError::NotFound),
        }
    }

    pub fn open(&self, name: &str) -> FsResult<File> {
        Self::check_name(name)?;
        self.files
            .lock()
            .get(name)
            .map(|inode| File::new(inode.clone()))
            .ok_or(FsError::NotFound)
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}
