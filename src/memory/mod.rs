//! Address constants and helpers shared by the memory and VM layers.

pub mod bitmap;
pub mod pagedir;
pub mod palloc;

use x86_64::VirtAddr;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// User virtual addresses live below this boundary; the kernel owns
/// everything above it.
pub const PHYS_BASE: u64 = 0x4000_0000_0000;

/// The user stack grows down from `PHYS_BASE`.
pub fn user_stack_top() -> VirtAddr {
    VirtAddr::new(PHYS_BASE)
}

/// How far below the stack top the stack may grow.
pub const STACK_MAX: u64 = 8 * 1024 * 1024;

/// Round `va` down to the start of its page.
pub fn pg_round_down(va: VirtAddr) -> VirtAddr {
    va.align_down(PGSIZE as u64)
}

/// Offset of `va` within its page.
pub fn pg_ofs(va: VirtAddr) -> usize {
    (va.as_u64() & (PGSIZE as u64 - 1)) as usize
}

/// True if `va` is a user virtual address.
pub fn is_user_vaddr(va: VirtAddr) -> bool {
    va.as_u64() < PHYS_BASE
}

/// View a kernel page as bytes.
///
/// # Safety
///
/// `kpage` must be a live page obtained from the page allocator, and the
/// caller must be the only writer for the duration of the borrow.
pub unsafe fn page_bytes<'a>(kpage: VirtAddr) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(kpage.as_u64() as *mut u8, PGSIZE)
}
