//! Fixed-size bit vector used by the page pools and the swap table.

use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;

const WORD_BITS: usize = 64;

pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// A bitmap of `len` bits, all set to `value`.
    pub fn new(len: usize, value: bool) -> Bitmap {
        let word_count = (len + WORD_BITS - 1) / WORD_BITS;
        let fill = if value { u64::MAX } else { 0 };
        Bitmap {
            words: vec![fill; word_count],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit index {} out of range", idx);
        self.words[idx / WORD_BITS].get_bit(idx % WORD_BITS)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit index {} out of range", idx);
        self.words[idx / WORD_BITS].set_bit(idx % WORD_BITS, value);
    }

    pub fn set_all(&mut self, value: bool) {
        let fill = if value { u64::MAX } else { 0 };
        for word in &mut self.words {
            *word = fill;
        }
    }

    /// Index of the first bit at or after `start` equal to `value`.
    pub fn scan(&self, start: usize, value: bool) -> Option<usize> {
        (start..self.len).find(|&i| self.test(i) == value)
    }

    /// Like `scan`, but flips the found bit before returning it.
    pub fn scan_and_flip(&mut self, start: usize, value: bool) -> Option<usize> {
        let idx = self.scan(start, value)?;
        self.set(idx, !value);
        Some(idx)
    }

    /// Number of bits equal to `value`.
    pub fn count(&self, value: bool) -> usize {
        (0..self.len).filter(|&i| self.test(i) == value).count()
    }
}
