//! Per-process page directory.
//!
//! This is the paging contract the VM layer programs against:
//! map/unmap/translate plus the accessed and dirty bits the clock
//! algorithm reads. The directory here is software-maintained — the
//! kernel paths that touch user memory keep the accessed/dirty bits
//! honest, which is also what makes eviction observable under test. On
//! real hardware the same interface fronts the MMU page tables.

use super::PGSIZE;
use bit_field::BitField;
use hashbrown::HashMap;
use x86_64::VirtAddr;

const PTE_ADDR_MASK: u64 = !(PGSIZE as u64 - 1);
const PTE_WRITABLE: usize = 1;
const PTE_ACCESSED: usize = 5;
const PTE_DIRTY: usize = 6;

pub struct PageDir {
    entries: HashMap<u64, u64>,
}

impl PageDir {
    pub fn new() -> PageDir {
        PageDir {
            entries: HashMap::new(),
        }
    }

    /// Map `upage` to the frame at `kpage`. Fails if `upage` is already
    /// mapped.
    pub fn set_page(&mut self, upage: VirtAddr, kpage: VirtAddr, writable: bool) -> bool {
        assert_eq!(upage.as_u64() % PGSIZE as u64, 0, "upage not page-aligned");
        assert_eq!(kpage.as_u64() % PGSIZE as u64, 0, "kpage not page-aligned");
        if self.entries.contains_key(&upage.as_u64()) {
            return false;
        }
        let mut entry = kpage.as_u64() & PTE_ADDR_MASK;
        entry.set_bit(PTE_WRITABLE, writable);
        self.entries.insert(upage.as_u64(), entry);
        true
    }

    /// The frame `upage` maps to, if any.
    pub fn get_page(&self, upage: VirtAddr) -> Option<VirtAddr> {
        self.entries
            .get(&upage.as_u64())
            .map(|e| VirtAddr::new(e & PTE_ADDR_MASK))
    }

    /// Drop the mapping for `upage`, if any.
    pub fn clear_page(&mut self, upage: VirtAddr) {
        self.entries.remove(&upage.as_u64());
    }

    pub fn is_writable(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage.as_u64())
            .map(|e| e.get_bit(PTE_WRITABLE))
            .unwrap_or(false)
    }

    pub fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage.as_u64())
            .map(|e| e.get_bit(PTE_ACCESSED))
            .unwrap_or(false)
    }

    pub fn set_accessed(&mut self, upage: VirtAddr, accessed: bool) {
        if let Some(e) = self.entries.get_mut(&upage.as_u64()) {
            e.set_bit(PTE_ACCESSED, accessed);
        }
    }

    pub fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.entries
            .get(&upage.as_u64())
            .map(|e| e.get_bit(PTE_DIRTY))
            .unwrap_or(false)
    }

    pub fn set_dirty(&mut self, upage: VirtAddr, dirty: bool) {
        if let Some(e) = self.entries.get_mut(&upage.as_u64()) {
            e.set_bit(PTE_DIRTY, dirty);
        }
    }

    /// Make this the active address space. The software directory needs
    /// no CPU state; the hardware backend reloads the root pointer here.
    pub fn activate(&self) {}

    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u64) -> VirtAddr {
        VirtAddr::new(n * PGSIZE as u64)
    }

    #[test]
    fn map_translate_unmap() {
        let mut pd = PageDir::new();
        assert!(pd.set_page(page(1), page(100), true));
        assert_eq!(pd.get_page(page(1)), Some(page(100)));
        assert!(pd.is_writable(page(1)));
        pd.clear_page(page(1));
        assert_eq!(pd.get_page(page(1)), None);
    }

    #[test]
    fn double_map_fails() {
        let mut pd = PageDir::new();
        assert!(pd.set_page(page(1), page(100), false));
        assert!(!pd.set_page(page(1), page(101), false));
        assert_eq!(pd.get_page(page(1)), Some(page(100)));
        assert!(!pd.is_writable(page(1)));
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pd = PageDir::new();
        pd.set_page(page(2), page(50), true);
        assert!(!pd.is_accessed(page(2)));
        pd.set_accessed(page(2), true);
        assert!(pd.is_accessed(page(2)));
        pd.set_accessed(page(2), false);
        assert!(!pd.is_accessed(page(2)));
        pd.set_dirty(page(2), true);
        assert!(pd.is_dirty(page(2)));
        // Bits on unmapped pages read as clear and writes are ignored.
        pd.set_accessed(page(9), true);
        assert!(!pd.is_accessed(page(9)));
    }
}
