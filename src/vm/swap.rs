//! Swap table: page-sized slots over the block device registered with
//! the swap role. A slot is `PGSIZE / SECTOR_SIZE` contiguous sectors;
//! the bitmap tracks free slots (true = free). Swap is not durable —
//! the table is reformatted every boot.

use crate::drivers::block::{self, BlockDevice, BlockRole, SECTOR_SIZE};
use crate::memory::bitmap::Bitmap;
use crate::memory::{self, PGSIZE};
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::VirtAddr;

/// Sectors per swap slot.
pub const SECTORS_PER_SLOT: usize = PGSIZE / SECTOR_SIZE;

struct SwapTable {
    dev: Arc<dyn BlockDevice>,
    slots: Bitmap,
}

static SWAP: Mutex<Option<SwapTable>> = Mutex::new(None);

/// Claim the swap device and mark every slot free.
pub fn init() {
    let dev = block::by_role(BlockRole::Swap).expect("swap: no block device with the swap role");
    let slot_count = dev.size() as usize / SECTORS_PER_SLOT;
    *SWAP.lock() = Some(SwapTable {
        dev,
        slots: Bitmap::new(slot_count, true),
    });
}

/// Write the page at `kpage` into a free slot and return its index.
/// Panics when the swap device is full.
pub fn swap_out(kpage: VirtAddr) -> usize {
    let mut table = SWAP.lock();
    let table = table.as_mut().expect("swap: not initialized");
    let slot = match table.slots.scan(0, true) {
        Some(slot) => slot,
        None => panic!("swap: out of swap slots"),
    };

    let bytes = unsafe { memory::page_bytes(kpage) };
    let mut sector = [0u8; SECTOR_SIZE];
    for i in 0..SECTORS_PER_SLOT {
        sector.copy_from_slice(&bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        table
            .dev
            .write((slot * SECTORS_PER_SLOT + i) as u64, &sector)
            .expect("swap: sector write failed");
    }
    table.slots.set(slot, false);
    slot
}

/// Read `slot` back into the page at `kpage` and free the slot. False
/// if `slot` is out of range or not in use.
pub fn swap_in(slot: usize, kpage: VirtAddr) -> bool {
    let mut table = SWAP.lock();
    let table = match table.as_mut() {
        Some(t) => t,
        None => return false,
    };
    if slot >= table.slots.len() || table.slots.test(slot) {
        return false;
    }

    let bytes = unsafe { memory::page_bytes(kpage) };
    let mut sector = [0u8; SECTOR_SIZE];
    for i in 0..SECTORS_PER_SLOT {
        table
            .dev
            .read((slot * SECTORS_PER_SLOT + i) as u64, &mut sector)
            .expect("swap: sector read failed");
        bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
    }
    table.slots.set(slot, true);
    true
}

/// Release `slot` without reading it back.
pub fn free_slot(slot: usize) {
    let mut table = SWAP.lock();
    let table = table.as_mut().expect("swap: not initialized");
    assert!(slot < table.slots.len(), "swap: slot {} out of range", slot);
    table.slots.set(slot, true);
}

/// True if `slot` holds a live page image.
pub fn slot_in_use(slot: usize) -> bool {
    let table = SWAP.lock();
    let table = table.as_ref().expect("swap: not initialized");
    slot < table.slots.len() && !table.slots.test(slot)
}

/// Number of free slots.
pub fn free_slots() -> usize {
    let table = SWAP.lock();
    table.as_ref().expect("swap: not initialized").slots.count(true)
}
