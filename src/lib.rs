//! QuantaOS — a teaching kernel core.
//!
//! The crate implements preemptive kernel threads with priority donation
//! and a 4.4BSD multilevel feedback queue, demand-paged user memory
//! (supplemental page tables, a global frame table with clock
//! replacement, and a swap table), process exec/wait semantics, and the
//! system-call gateway. Device drivers, the loader and the interrupt
//! plumbing are external; the kernel names only the contracts it needs
//! (timer tick, sector-sized block I/O, page allocation, paging ops).
//!
//! The same sources build for bare metal (`target_os = "none"`) and for a
//! hosted target, where `std` supplies the console sink and OS threads
//! stand in for the hand-rolled context switch. The hosted build is what
//! `cargo test` exercises.

#![no_std]

extern crate alloc;

#[cfg(any(test, not(target_os = "none")))]
extern crate std;

#[macro_use]
pub mod console;

pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod syscalls;
pub mod vm;

#[cfg(target_os = "none")]
mod allocator;
#[cfg(target_os = "none")]
pub mod serial;
#[cfg(target_os = "none")]
pub mod vga;

/// Boot-time policy switches, normally taken from the kernel command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelConfig {
    /// Use the 4.4BSD multilevel feedback queue scheduler.
    pub mlfqs: bool,
    /// Age ready threads to counter starvation (round-robin mode only).
    pub aging: bool,
}

/// Bring the kernel core up. Memory pools and block devices must already
/// be in place; the swap table is claimed here if a device carries the
/// swap role.
pub fn bootstrap(config: &KernelConfig) {
    drivers::timer::init();
    scheduler::init(config);
    fs::init();
    vm::frame::init();
    if drivers::block::by_role(drivers::block::BlockRole::Swap).is_some() {
        vm::swap::init();
    }
    scheduler::start();
}

#[cfg(target_os = "none")]
const KERNEL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Bare-metal entry. The boot stub hands us the multiboot2 info pointer;
/// we carve the kernel heap and the page pools out of the largest usable
/// region, read the policy flags off the command line, and start the
/// thread system.
#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn _start(multiboot_info_addr: usize) -> ! {
    vga::init();
    serial::init();
    crate::log_info!("QuantaOS kernel starting.");

    let boot_info = unsafe {
        multiboot2::BootInformation::load(multiboot_info_addr as *const _)
            .expect("failed to load multiboot2 info")
    };

    let mut config = KernelConfig::default();
    if let Some(cmdline) = boot_info.command_line_tag().and_then(|t| t.cmdline().ok()) {
        config.mlfqs = cmdline.split_whitespace().any(|w| w == "-mlfqs");
        config.aging = cmdline.split_whitespace().any(|w| w == "-aging");
    }

    let memory_map = boot_info.memory_map_tag().expect("memory map tag required");
    let region = memory_map
        .memory_areas()
        .iter()
        .filter(|a| a.start_address() >= 0x10_0000)
        .max_by_key(|a| a.size())
        .expect("no usable memory region");

    let heap_start = region.start_address() as usize;
    unsafe { allocator::init_heap(heap_start, KERNEL_HEAP_SIZE) };

    // Split the rest of the region into equal kernel and user pools.
    let pool_start = heap_start + KERNEL_HEAP_SIZE;
    let pool_pages = (region.end_address() as usize - pool_start) / memory::PGSIZE;
    let kernel_pages = pool_pages / 2;
    let user_pages = pool_pages - kernel_pages;
    memory::palloc::init(
        x86_64::VirtAddr::new(pool_start as u64),
        kernel_pages,
        x86_64::VirtAddr::new((pool_start + kernel_pages * memory::PGSIZE) as u64),
        user_pages,
    );
    crate::log_info!(
        "memory: {} kernel pages, {} user pages, {} KiB heap",
        kernel_pages,
        user_pages,
        KERNEL_HEAP_SIZE / 1024
    );

    drivers::init();
    bootstrap(&config);
    crate::log_info!(
        "QuantaOS is up (scheduler: {}).",
        if config.mlfqs { "mlfqs" } else { "round-robin" }
    );

    loop {
        interrupts::wait();
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::println!("{}", info);
    crate::log_error!("{}", info);
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
