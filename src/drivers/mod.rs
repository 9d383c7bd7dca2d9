//! Device contracts and the few drivers the kernel core carries.

pub mod block;
pub mod ramdisk;
pub mod timer;

#[cfg(target_os = "none")]
pub mod ata;

/// Probe and register the bare-metal block devices: primary master as
/// the file-system disk, primary slave as swap.
#[cfg(target_os = "none")]
pub fn init() {
    use alloc::sync::Arc;
    use block::BlockRole;

    block::init();
    if let Some(dev) = ata::AtaDevice::detect(0x1F0, 0x3F6, true) {
        crate::log_info!("ata: primary master, {} sectors", dev.size_sectors());
        block::register(BlockRole::FileSys, Arc::new(dev));
    }
    if let Some(dev) = ata::AtaDevice::detect(0x1F0, 0x3F6, false) {
        crate::log_info!("ata: primary slave, {} sectors (swap)", dev.size_sectors());
        block::register(BlockRole::Swap, Arc::new(dev));
    }
}
