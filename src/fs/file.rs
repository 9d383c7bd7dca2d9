//! Open-file handles. Handles share the inode; each keeps its own
//! offset, so two opens of the same file seek independently.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub(crate) type Inode = Arc<Mutex<Vec<u8>>>;

#[derive(Clone)]
pub struct File {
    inode: Inode,
    pos: usize,
}

impl File {
    pub(crate) fn new(inode: Inode) -> File {
        File { inode, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.inode.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read at an explicit offset without touching the handle's own
    /// position. Returns the number of bytes read; short at EOF.
    pub fn read_at(&self, ofs: usize, buf: &mut [u8]) -> usize {
        let data = self.inode.lock();
        if ofs >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        n
    }

    /// Read from the current position, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_at(self.pos, buf);
        self.pos += n;
        n
    }

    /// Write at the current position, advancing it. Files do not grow:
    /// the write is truncated at end of file.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let mut data = self.inode.lock();
        if self.pos >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - self.pos);
        data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
        drop(data);
        self.pos += n;
        n
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }
}
