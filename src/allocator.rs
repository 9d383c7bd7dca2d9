//! Kernel heap for the bare-metal build. Hosted builds get the system
//! allocator from `std`.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// # Safety
///
/// `start..start + size` must be unused, writable memory.
pub unsafe fn init_heap(start: usize, size: usize) {
    ALLOCATOR.lock().init(start as *mut u8, size);
}
