//! Page allocator: two bitmap-backed pools of page-sized memory, one for
//! the kernel (thread stacks) and one for user frames. This is the
//! allocator contract the frame table builds on.

use super::bitmap::Bitmap;
use super::PGSIZE;
use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PalFlags: u32 {
        /// Allocate from the user pool instead of the kernel pool.
        const USER = 1 << 0;
        /// Zero the page before returning it.
        const ZERO = 1 << 1;
    }
}

struct Pool {
    base: u64,
    used: Bitmap,
}

impl Pool {
    fn new(base: VirtAddr, pages: usize) -> Pool {
        assert_eq!(base.as_u64() % PGSIZE as u64, 0, "pool base not page-aligned");
        Pool {
            base: base.as_u64(),
            used: Bitmap::new(pages, false),
        }
    }

    fn contains(&self, page: VirtAddr) -> bool {
        let addr = page.as_u64();
        addr >= self.base && addr < self.base + (self.used.len() * PGSIZE) as u64
    }

    fn get(&mut self) -> Option<VirtAddr> {
        let idx = self.used.scan_and_flip(0, false)?;
        Some(VirtAddr::new(self.base + (idx * PGSIZE) as u64))
    }

    fn free(&mut self, page: VirtAddr) {
        assert_eq!(page.as_u64() % PGSIZE as u64, 0, "freeing unaligned page");
        let idx = ((page.as_u64() - self.base) / PGSIZE as u64) as usize;
        assert!(self.used.test(idx), "freeing a page that is not allocated");
        self.used.set(idx, false);
    }

    fn free_pages(&self) -> usize {
        self.used.count(false)
    }
}

struct Pools {
    kernel: Pool,
    user: Pool,
}

lazy_static! {
    static ref POOLS: Mutex<Option<Pools>> = Mutex::new(None);
}

/// Hand the allocator its memory. Both ranges must be page-aligned and
/// disjoint.
pub fn init(kernel_base: VirtAddr, kernel_pages: usize, user_base: VirtAddr, user_pages: usize) {
    *POOLS.lock() = Some(Pools {
        kernel: Pool::new(kernel_base, kernel_pages),
        user: Pool::new(user_base, user_pages),
    });
}

/// Hosted variant: carve both pools out of leaked, page-aligned heap
/// arenas so the rest of the kernel is none the wiser.
#[cfg(not(target_os = "none"))]
pub fn init_hosted(kernel_pages: usize, user_pages: usize) {
    fn arena(pages: usize) -> VirtAddr {
        let layout = core::alloc::Layout::from_size_align(pages * PGSIZE, PGSIZE).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "hosted arena allocation failed");
        VirtAddr::new(ptr as u64)
    }
    init(arena(kernel_pages), kernel_pages, arena(user_pages), user_pages)
}

/// Get a free page, or `None` if the chosen pool is exhausted.
pub fn get_page(flags: PalFlags) -> Option<VirtAddr> {
    let mut pools = POOLS.lock();
    let pools = pools.as_mut().expect("page allocator not initialized");
    let pool = if flags.contains(PalFlags::USER) {
        &mut pools.user
    } else {
        &mut pools.kernel
    };
    let page = pool.get()?;
    if flags.contains(PalFlags::ZERO) {
        unsafe { super::page_bytes(page) }.fill(0);
    }
    Some(page)
}

/// Return `page` to its pool.
pub fn free_page(page: VirtAddr) {
    let mut pools = POOLS.lock();
    let pools = pools.as_mut().expect("page allocator not initialized");
    if pools.user.contains(page) {
        pools.user.free(page);
    } else if pools.kernel.contains(page) {
        pools.kernel.free(page);
    } else {
        panic!("freeing page {:?} outside both pools", page);
    }
}

/// Free pages left in the user pool.
pub fn user_pool_free() -> usize {
    let pools = POOLS.lock();
    pools.as_ref().expect("page allocator not initialized").user.free_pages()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(kernel: usize, user: usize) -> crate::test_support::KernelGuard {
        let guard = crate::test_support::lock_kernel();
        init_hosted(kernel, user);
        guard
    }

    #[test]
    fn exhaustion_and_reuse() {
        let _k = setup(4, 2);
        let a = get_page(PalFlags::USER).unwrap();
        let b = get_page(PalFlags::USER).unwrap();
        assert_ne!(a, b);
        assert!(get_page(PalFlags::USER).is_none());
        free_page(a);
        let c = get_page(PalFlags::USER).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn zero_flag_scrubs() {
        let _k = setup(4, 2);
        let page = get_page(PalFlags::USER).unwrap();
        unsafe { crate::memory::page_bytes(page) }.fill(0xAA);
        free_page(page);
        let again = get_page(PalFlags::USER | PalFlags::ZERO).unwrap();
        assert_eq!(again, page);
        assert!(unsafe { crate::memory::page_bytes(again) }.iter().all(|&b| b == 0));
    }

    #[test]
    fn pools_are_separate() {
        let _k = setup(2, 2);
        let k = get_page(PalFlags::empty()).unwrap();
        let u = get_page(PalFlags::USER).unwrap();
        assert_ne!(k, u);
        assert_eq!(user_pool_free(), 1);
        free_page(u);
        free_page(k);
        assert_eq!(user_pool_free(), 2);
    }
}
