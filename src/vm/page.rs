//! Per-process supplemental page table.
//!
//! Each user page the process knows about has an entry describing where
//! its contents live: still in a file, out on swap, all zeros, or
//! resident in a frame. `load_page` is the page-fault resolution path:
//! it locates the entry, obtains a frame (possibly evicting), fetches
//! the contents, and installs the mapping.

use super::frame;
use super::swap;
use crate::fs::File;
use crate::memory::pagedir::PageDir;
use crate::memory::palloc::PalFlags;
use crate::memory::{self, PGSIZE};
use crate::scheduler;
use hashbrown::HashMap;
use x86_64::VirtAddr;

/// Where a page's contents currently live.
pub enum PageState {
    /// Lazily read from a file: `read_bytes` from `ofs`, then
    /// `zero_bytes` of zeros. The two always sum to `PGSIZE`.
    File {
        file: File,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// Swapped out to the given slot.
    Swap { slot: usize },
    /// All zeros, materialized on first touch.
    Zero,
    /// Resident; `kpage` holds the frame.
    Present,
}

/// `PageState` without payloads, for inspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStateKind {
    File,
    Swap,
    Zero,
    Present,
}

pub struct Page {
    pub(crate) kpage: Option<VirtAddr>,
    pub(crate) writable: bool,
    pub(crate) state: PageState,
}

/// Map from page-aligned user address to entry.
pub struct SuppTable {
    pages: HashMap<u64, Page>,
}

impl SuppTable {
    pub fn new() -> SuppTable {
        SuppTable {
            pages: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn state_of(&self, upage: VirtAddr) -> Option<PageStateKind> {
        self.pages.get(&upage.as_u64()).map(|p| match p.state {
            PageState::File { .. } => PageStateKind::File,
            PageState::Swap { .. } => PageStateKind::Swap,
            PageState::Zero => PageStateKind::Zero,
            PageState::Present => PageStateKind::Present,
        })
    }

    /// Record a page to be lazily read from `file`. Fails on an address
    /// that already has an entry.
    pub fn install_file(
        &mut self,
        upage: VirtAddr,
        file: File,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> bool {
        assert_eq!(memory::pg_ofs(upage), 0, "upage not page-aligned");
        assert_eq!(read_bytes + zero_bytes, PGSIZE, "file page must cover a full page");
        if self.pages.contains_key(&upage.as_u64()) {
            return false;
        }
        self.pages.insert(
            upage.as_u64(),
            Page {
                kpage: None,
                writable,
                state: PageState::File {
                    file,
                    ofs,
                    read_bytes,
                    zero_bytes,
                },
            },
        );
        true
    }

    /// Record an all-zero page. Fails on a conflict.
    pub fn install_zero(&mut self, upage: VirtAddr, writable: bool) -> bool {
        assert_eq!(memory::pg_ofs(upage), 0, "upage not page-aligned");
        if self.pages.contains_key(&upage.as_u64()) {
            return false;
        }
        self.pages.insert(
            upage.as_u64(),
            Page {
                kpage: None,
                writable,
                state: PageState::Zero,
            },
        );
        true
    }

    /// Move an existing entry (typically a resident one being evicted)
    /// to the swap state. Fails if the address has no entry.
    pub fn install_swap(&mut self, upage: VirtAddr, slot: usize) -> bool {
        match self.pages.get_mut(&upage.as_u64()) {
            Some(page) => {
                page.kpage = None;
                page.state = PageState::Swap { slot };
                true
            }
            None => false,
        }
    }

    /// Make `upage` resident in `kpage`: update or insert the entry,
    /// clear the dirty bit, and install the hardware mapping. Fails if
    /// a mapping already exists.
    pub fn set_page(
        &mut self,
        pagedir: &mut PageDir,
        upage: VirtAddr,
        kpage: VirtAddr,
        writable: bool,
    ) -> bool {
        let entry = self.pages.entry(upage.as_u64()).or_insert(Page {
            kpage: None,
            writable,
            state: PageState::Zero,
        });
        entry.kpage = Some(kpage);
        entry.writable = writable;
        entry.state = PageState::Present;

        pagedir.set_dirty(upage, false);
        pagedir.get_page(upage).is_none() && pagedir.set_page(upage, kpage, writable)
    }

    /// Release everything this table still owns: resident frames go
    /// back to the pool, swapped pages give up their slots. The file
    /// handles drop with their entries.
    pub fn destroy(self, pagedir: &mut PageDir) {
        for (upage, page) in self.pages {
            match page.state {
                PageState::Present => {
                    if let Some(kpage) = page.kpage {
                        frame::free_frame(kpage);
                        pagedir.clear_page(VirtAddr::new(upage));
                    }
                }
                PageState::Swap { slot } => swap::free_slot(slot),
                PageState::File { .. } | PageState::Zero => {}
            }
        }
    }
}

impl Default for SuppTable {
    fn default() -> Self {
        Self::new()
    }
}

/// What `load_page` needs to know outside the user-state lock.
enum Fetch {
    File {
        file: File,
        ofs: usize,
        read_bytes: usize,
    },
    Swap {
        slot: usize,
    },
    Zero,
}

/// Resolve a fault on `upage` for the current process. Returns false if
/// the page is unknown (a genuine fault) or the contents cannot be
/// fetched.
///
/// The user-state lock is not held while a frame is obtained or filled:
/// frame acquisition may evict — possibly one of our own pages — and a
/// file read must not run under the frame lock either, so the fresh
/// frame stays pinned until its mapping is installed.
pub fn load_page(upage: VirtAddr) -> bool {
    assert_eq!(memory::pg_ofs(upage), 0, "upage not page-aligned");
    let cur = scheduler::current();

    let (fetch, writable) = {
        let user = cur.user.lock();
        let user = match user.as_ref() {
            Some(u) => u,
            None => return false,
        };
        match user.pages.pages.get(&upage.as_u64()) {
            None => return false,
            Some(page) => {
                let fetch = match &page.state {
                    PageState::File {
                        file,
                        ofs,
                        read_bytes,
                        ..
                    } => Fetch::File {
                        file: file.clone(),
                        ofs: *ofs,
                        read_bytes: *read_bytes,
                    },
                    PageState::Swap { slot } => Fetch::Swap { slot: *slot },
                    PageState::Zero => Fetch::Zero,
                    // A resident page does not fault; nothing to do.
                    PageState::Present => return false,
                };
                (fetch, page.writable)
            }
        }
    };

    let kpage = match frame::get_frame(PalFlags::USER, upage) {
        Some(kpage) => kpage,
        None => return false,
    };

    let bytes = unsafe { memory::page_bytes(kpage) };
    match fetch {
        Fetch::File {
            file,
            ofs,
            read_bytes,
        } => {
            if file.read_at(ofs, &mut bytes[..read_bytes]) != read_bytes {
                frame::free_frame(kpage);
                return false;
            }
            bytes[read_bytes..].fill(0);
        }
        Fetch::Swap { slot } => {
            if !swap::swap_in(slot, kpage) {
                frame::free_frame(kpage);
                return false;
            }
        }
        Fetch::Zero => bytes.fill(0),
    }

    let installed = {
        let mut user = cur.user.lock();
        match user.as_mut() {
            Some(u) => {
                let ok = u.pages.set_page(&mut u.pagedir, upage, kpage, writable);
                if ok {
                    // A freshly loaded page counts as referenced.
                    u.pagedir.set_accessed(upage, true);
                }
                ok
            }
            None => false,
        }
    };
    if !installed {
        frame::free_frame(kpage);
        return false;
    }
    frame::unpin(kpage);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::UserState;
    use crate::test_support;
    use alloc::vec;

    fn upage(n: u64) -> VirtAddr {
        VirtAddr::new(n * PGSIZE as u64)
    }

    fn with_user_state() {
        *scheduler::current().user.lock() = Some(UserState::new());
    }

    fn clear_user_state() {
        let state = scheduler::current().user.lock().take();
        if let Some(state) = state {
            state.destroy();
        }
    }

    #[test]
    fn zero_page_faults_in_zeroed() {
        let _k = test_support::boot();
        with_user_state();
        let cur = scheduler::current();
        {
            let mut u = cur.user.lock();
            assert!(u.as_mut().unwrap().pages.install_zero(upage(5), true));
        }
        assert!(load_page(upage(5)));
        let u = cur.user.lock();
        let kpage = u.as_ref().unwrap().pagedir.get_page(upage(5)).unwrap();
        assert!(unsafe { memory::page_bytes(kpage) }.iter().all(|&b| b == 0));
        assert_eq!(
            u.as_ref().unwrap().pages.state_of(upage(5)),
            Some(PageStateKind::Present)
        );
        drop(u);
        clear_user_state();
    }

    #[test]
    fn file_page_reads_and_zero_fills() {
        let _k = test_support::boot();
        with_user_state();
        crate::fs::create("img", 100).unwrap();
        let mut f = crate::fs::open("img").unwrap();
        f.write(b"payload");
        let cur = scheduler::current();
        {
            let mut u = cur.user.lock();
            // 100 bytes of file, the rest zeros.
            assert!(u.as_mut().unwrap().pages.install_file(
                upage(7),
                f.clone(),
                0,
                100,
                PGSIZE - 100,
                false,
            ));
        }
        assert!(load_page(upage(7)));
        let u = cur.user.lock();
        let kpage = u.as_ref().unwrap().pagedir.get_page(upage(7)).unwrap();
        let bytes = unsafe { memory::page_bytes(kpage) };
        assert_eq!(&bytes[..7], b"payload");
        assert!(bytes[100..].iter().all(|&b| b == 0));
        assert!(!u.as_ref().unwrap().pagedir.is_writable(upage(7)));
        drop(u);
        clear_user_state();
    }

    #[test]
    fn install_conflicts_fail() {
        let _k = test_support::boot();
        with_user_state();
        let cur = scheduler::current();
        let mut u = cur.user.lock();
        let u = u.as_mut().unwrap();
        assert!(u.pages.install_zero(upage(1), true));
        assert!(!u.pages.install_zero(upage(1), true));
        crate::fs::create("f", 0).unwrap();
        let f = crate::fs::open("f").unwrap();
        assert!(!u.pages.install_file(upage(1), f, 0, PGSIZE, 0, true));
        // install_swap needs an existing entry.
        assert!(!u.pages.install_swap(upage(9), 0));
    }

    #[test]
    fn genuine_fault_misses() {
        let _k = test_support::boot();
        with_user_state();
        assert!(!load_page(upage(123)));
        clear_user_state();
    }

    #[test]
    fn short_file_read_fails_cleanly() {
        let _k = test_support::boot();
        with_user_state();
        crate::fs::create("tiny", 10).unwrap();
        let f = crate::fs::open("tiny").unwrap();
        let cur = scheduler::current();
        {
            let mut u = cur.user.lock();
            // Claims PGSIZE bytes from a 10-byte file.
            assert!(u.as_mut().unwrap().pages.install_file(
                upage(3),
                f,
                0,
                PGSIZE,
                0,
                true
            ));
        }
        assert!(!load_page(upage(3)));
        assert_eq!(frame::frame_count(), 0);
        clear_user_state();
    }

    #[test]
    fn destroy_releases_frames_and_slots() {
        let _k = test_support::boot_with(crate::KernelConfig::default(), 4, 16);
        with_user_state();
        let cur = scheduler::current();
        {
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            for i in 0..3 {
                assert!(u.pages.install_zero(upage(10 + i), true));
            }
        }
        for i in 0..3 {
            assert!(load_page(upage(10 + i)));
        }
        assert_eq!(frame::frame_count(), 3);
        // Evict one by hand to get a swap-state entry.
        let kpage = {
            let u = cur.user.lock();
            u.as_ref().unwrap().pagedir.get_page(upage(10)).unwrap()
        };
        let slot = swap::swap_out(kpage);
        {
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            u.pages.install_swap(upage(10), slot);
            u.pagedir.clear_page(upage(10));
        }
        frame::free_frame(kpage);
        let used_before = swap::free_slots();
        clear_user_state();
        assert_eq!(frame::frame_count(), 0);
        assert_eq!(swap::free_slots(), used_before + 1);
    }

    /// Demand-load a 1 MiB image (256 pages) through a 64-page pool:
    /// the frame table never exceeds the pool and every page read back
    /// — including those that went through swap — carries its bytes.
    #[test]
    fn demand_load_then_evict_round_trip() {
        const PAGES: u64 = 256;
        const POOL: usize = 64;
        let _k = test_support::boot_with(crate::KernelConfig::default(), POOL, 512);
        with_user_state();
        let cur = scheduler::current();

        {
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            for i in 0..PAGES {
                assert!(u.pages.install_zero(upage(i), true));
            }
        }

        // Touch every page in order, writing a recognizable pattern.
        for i in 0..PAGES {
            assert!(load_page(upage(i)), "page {} failed to load", i);
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            let kpage = u.pagedir.get_page(upage(i)).unwrap();
            unsafe { memory::page_bytes(kpage) }.fill(i as u8);
            u.pagedir.set_dirty(upage(i), true);
            drop(u);
            assert!(frame::frame_count() <= POOL, "frame table grew past the pool");
        }

        // Early pages went to swap; fault them back and check bytes.
        let mut swapped = 0;
        for i in 0..PAGES {
            let state = {
                let u = cur.user.lock();
                u.as_ref().unwrap().pages.state_of(upage(i)).unwrap()
            };
            if state == PageStateKind::Swap {
                swapped += 1;
                assert!(load_page(upage(i)), "swap-in of page {} failed", i);
            }
            let u = cur.user.lock();
            let kpage = u.as_ref().unwrap().pagedir.get_page(upage(i)).unwrap();
            assert!(
                unsafe { memory::page_bytes(kpage) }.iter().all(|&b| b == i as u8),
                "page {} lost its bytes",
                i
            );
        }
        assert!(swapped > 0, "nothing was evicted");
        clear_user_state();
    }

    #[test]
    fn file_backed_pages_cover_a_sparse_file() {
        // A page-by-page lazy map of a multi-page file, the way the
        // loader installs an executable image.
        let _k = test_support::boot();
        with_user_state();
        let len = 2 * PGSIZE + 300;
        crate::fs::create("prog", len).unwrap();
        let mut f = crate::fs::open("prog").unwrap();
        f.seek(2 * PGSIZE);
        f.write(&vec![7u8; 300]);
        let cur = scheduler::current();
        {
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            let mut ofs = 0;
            while ofs < len {
                let read_bytes = (len - ofs).min(PGSIZE);
                assert!(u.pages.install_file(
                    upage(20 + (ofs / PGSIZE) as u64),
                    f.clone(),
                    ofs,
                    read_bytes,
                    PGSIZE - read_bytes,
                    true,
                ));
                ofs += PGSIZE;
            }
        }
        for i in 0..3 {
            assert!(load_page(upage(20 + i)));
        }
        let u = cur.user.lock();
        let kpage = u.as_ref().unwrap().pagedir.get_page(upage(22)).unwrap();
        let bytes = unsafe { memory::page_bytes(kpage) };
        assert!(bytes[..300].iter().all(|&b| b == 7));
        assert!(bytes[300..].iter().all(|&b| b == 0));
        drop(u);
        clear_user_state();
    }
}
