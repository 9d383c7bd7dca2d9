//! Global frame table.
//!
//! Every resident user page has a record here. One lock covers the
//! table, the clock cursor and eviction. Frames are born pinned: the
//! fault path unpins them only after the contents are installed, so the
//! clock never examines a half-fetched frame, and no frame lock is held
//! across the file read that fills one.

use super::swap;
use crate::memory::palloc::{self, PalFlags};
use crate::scheduler::{self, Thread};
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

struct Frame {
    owner: Arc<Thread>,
    upage: VirtAddr,
    kpage: VirtAddr,
    pinned: bool,
}

struct FrameTable {
    frames: Vec<Frame>,
    /// Clock hand for second-chance replacement.
    cursor: usize,
}

lazy_static! {
    static ref FRAMES: Mutex<FrameTable> = Mutex::new(FrameTable {
        frames: Vec::new(),
        cursor: 0,
    });
}

pub fn init() {
    let mut table = FRAMES.lock();
    table.frames.clear();
    table.cursor = 0;
}

/// Obtain a frame for the current thread's page `upage`. Falls back to
/// eviction when the user pool is dry. The returned frame is pinned;
/// unpin it once its contents are in place.
pub fn get_frame(flags: PalFlags, upage: VirtAddr) -> Option<VirtAddr> {
    assert!(flags.contains(PalFlags::USER), "frames come from the user pool");
    let owner = scheduler::current();
    let mut table = FRAMES.lock();
    let kpage = match palloc::get_page(flags) {
        Some(kpage) => kpage,
        None => {
            let kpage = evict(&mut table);
            if flags.contains(PalFlags::ZERO) {
                unsafe { crate::memory::page_bytes(kpage) }.fill(0);
            }
            kpage
        }
    };
    table.frames.push(Frame {
        owner,
        upage,
        kpage,
        pinned: true,
    });
    Some(kpage)
}

/// Second-chance clock sweep: skip pinned frames, give recently
/// accessed frames one more pass, evict the first quiet one to swap.
/// Two full sweeps with no candidate means every frame is pinned or
/// permanently hot, which is fatal.
fn evict(table: &mut FrameTable) -> VirtAddr {
    let n = table.frames.len();
    if n == 0 {
        panic!("frame table: out of frames");
    }

    let mut victim = None;
    for _ in 0..2 * n {
        let i = table.cursor;
        table.cursor = (table.cursor + 1) % n;
        if table.frames[i].pinned {
            continue;
        }
        let (owner, upage) = {
            let f = &table.frames[i];
            (f.owner.clone(), f.upage)
        };
        let accessed = owner
            .user
            .lock()
            .as_ref()
            .map(|u| u.pagedir.is_accessed(upage))
            .unwrap_or(false);
        if accessed {
            if let Some(u) = owner.user.lock().as_mut() {
                u.pagedir.set_accessed(upage, false);
            }
        } else {
            victim = Some(i);
            break;
        }
    }
    let i = match victim {
        Some(i) => i,
        None => panic!("frame table: no evictable frame"),
    };

    let frame = table.frames.remove(i);
    if i < table.cursor {
        table.cursor -= 1;
    }
    if table.frames.is_empty() {
        table.cursor = 0;
    } else {
        table.cursor %= table.frames.len();
    }

    // Push the page image out, retarget the owner's supplemental entry
    // at the slot, and drop the hardware mapping.
    let slot = swap::swap_out(frame.kpage);
    if let Some(u) = frame.owner.user.lock().as_mut() {
        u.pages.install_swap(frame.upage, slot);
        u.pagedir.clear_page(frame.upage);
    }
    frame.kpage
}

/// Unlink the record for `kpage` and return the page to the pool.
pub fn free_frame(kpage: VirtAddr) {
    let mut table = FRAMES.lock();
    if let Some(i) = table.frames.iter().position(|f| f.kpage == kpage) {
        table.frames.remove(i);
        if i < table.cursor {
            table.cursor -= 1;
        }
        if table.frames.is_empty() {
            table.cursor = 0;
        } else {
            table.cursor %= table.frames.len();
        }
    }
    palloc::free_page(kpage);
}

/// Exempt `kpage` from eviction while a syscall works on it.
pub fn pin(kpage: VirtAddr) {
    set_pinned(kpage, true);
}

pub fn unpin(kpage: VirtAddr) {
    set_pinned(kpage, false);
}

fn set_pinned(kpage: VirtAddr, pinned: bool) {
    let mut table = FRAMES.lock();
    if let Some(f) = table.frames.iter_mut().find(|f| f.kpage == kpage) {
        f.pinned = pinned;
    }
}

/// Number of live frame records.
pub fn frame_count() -> usize {
    FRAMES.lock().frames.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PGSIZE;
    use crate::process::UserState;
    use crate::test_support;

    fn upage(n: u64) -> VirtAddr {
        VirtAddr::new(n * PGSIZE as u64)
    }

    /// Give the current thread an address space to own frames with.
    fn with_user_state() {
        *scheduler::current().user.lock() = Some(UserState::new());
    }

    #[test]
    fn frames_are_unique_per_kpage() {
        let _k = test_support::boot_with(crate::KernelConfig::default(), 8, 16);
        with_user_state();
        let a = get_frame(PalFlags::USER | PalFlags::ZERO, upage(1)).unwrap();
        let b = get_frame(PalFlags::USER | PalFlags::ZERO, upage(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(frame_count(), 2);
        free_frame(a);
        free_frame(b);
        assert_eq!(frame_count(), 0);
    }

    #[test]
    fn clock_evicts_unaccessed_first() {
        let _k = test_support::boot_with(crate::KernelConfig::default(), 2, 16);
        with_user_state();
        let cur = scheduler::current();

        // Two frames fill the pool; install mappings so the clock can
        // consult and clear accessed bits.
        let k1 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(1)).unwrap();
        let k2 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(2)).unwrap();
        {
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            assert!(u.pages.install_zero(upage(1), true));
            assert!(u.pages.install_zero(upage(2), true));
            assert!(u.pages.set_page(&mut u.pagedir, upage(1), k1, true));
            assert!(u.pages.set_page(&mut u.pagedir, upage(2), k2, true));
            u.pagedir.set_accessed(upage(1), true);
            u.pagedir.set_accessed(upage(2), false);
        }
        unpin(k1);
        unpin(k2);

        // Page 2 is quiet; the clock must take it and leave page 1.
        let k3 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(3)).unwrap();
        assert_eq!(k3, k2);
        let u = cur.user.lock();
        let u = u.as_ref().unwrap();
        assert!(u.pagedir.get_page(upage(1)).is_some());
        assert!(u.pagedir.get_page(upage(2)).is_none());
        assert!(matches!(
            u.pages.state_of(upage(2)),
            Some(crate::vm::page::PageStateKind::Swap)
        ));
    }

    #[test]
    fn clock_skips_pinned_frames() {
        let _k = test_support::boot_with(crate::KernelConfig::default(), 2, 16);
        with_user_state();
        let cur = scheduler::current();
        let k1 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(1)).unwrap();
        let k2 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(2)).unwrap();
        {
            let mut u = cur.user.lock();
            let u = u.as_mut().unwrap();
            assert!(u.pages.install_zero(upage(1), true));
            assert!(u.pages.install_zero(upage(2), true));
            assert!(u.pages.set_page(&mut u.pagedir, upage(1), k1, true));
            assert!(u.pages.set_page(&mut u.pagedir, upage(2), k2, true));
        }
        unpin(k2);
        // k1 stays pinned, so the only candidate is k2.
        let k3 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(3)).unwrap();
        assert_eq!(k3, k2);
    }

    #[test]
    #[should_panic(expected = "no evictable frame")]
    fn all_pinned_is_fatal() {
        let _k = test_support::boot_with(crate::KernelConfig::default(), 2, 16);
        with_user_state();
        let _k1 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(1)).unwrap();
        let _k2 = get_frame(PalFlags::USER | PalFlags::ZERO, upage(2)).unwrap();
        // Both frames still pinned from birth.
        let _ = get_frame(PalFlags::USER | PalFlags::ZERO, upage(3));
    }
}
