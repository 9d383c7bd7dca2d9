//! ATA PIO block device (LBA28), the bare-metal backing store for the
//! file-system and swap roles.

use super::block::{BlockDevice, BlockError, BlockResult, SECTOR_SIZE};
use x86_64::instructions::port::Port;

// Port offsets relative to io_base.
const DATA_REG: u16 = 0;
const ERROR_REG: u16 = 1;
const SECTOR_COUNT: u16 = 2;
const LBA_LOW: u16 = 3;
const LBA_MID: u16 = 4;
const LBA_HIGH: u16 = 5;
const DRIVE_HEAD: u16 = 6;
const CMD_STATUS: u16 = 7;

const STATUS_BSY: u8 = 0x80;
const STATUS_DRQ: u8 = 0x08;
const STATUS_DF: u8 = 0x20;
const STATUS_ERR: u8 = 0x01;

const CMD_IDENTIFY: u8 = 0xEC;
const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;

const LBA28_MAX: u64 = 1 << 28;
const POLL_BUDGET: u32 = 100_000;

pub struct AtaDevice {
    io_base: u16,
    ctrl_base: u16,
    is_master: bool,
    sectors: u64,
}

impl AtaDevice {
    /// Identify the drive at `io_base`/`ctrl_base`; `None` if nothing
    /// answers or the device is not ATA.
    pub fn detect(io_base: u16, ctrl_base: u16, is_master: bool) -> Option<AtaDevice> {
        let mut dev = AtaDevice {
            io_base,
            ctrl_base,
            is_master,
            sectors: 0,
        };
        dev.identify().ok()?;
        Some(dev)
    }

    pub fn size_sectors(&self) -> u64 {
        self.sectors
    }

    fn read_port(&self, offset: u16) -> u8 {
        let mut port = Port::<u8>::new(self.io_base + offset);
        unsafe { port.read() }
    }

    fn write_port(&self, offset: u16, val: u8) {
        let mut port = Port::<u8>::new(self.io_base + offset);
        unsafe { port.write(val) }
    }

    fn read_data16(&self) -> u16 {
        let mut port = Port::<u16>::new(self.io_base + DATA_REG);
        unsafe { port.read() }
    }

    fn write_data16(&self, val: u16) {
        let mut port = Port::<u16>::new(self.io_base + DATA_REG);
        unsafe { port.write(val) }
    }

    fn wait_bsy(&self) -> BlockResult<()> {
        for _ in 0..POLL_BUDGET {
            if self.read_port(CMD_STATUS) & STATUS_BSY == 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(BlockError::Timeout)
    }

    fn wait_drq(&self) -> BlockResult<()> {
        for _ in 0..POLL_BUDGET {
            let status = self.read_port(CMD_STATUS);
            if status & (STATUS_ERR | STATUS_DF) != 0 {
                return Err(BlockError::DeviceFault);
            }
            if status & STATUS_DRQ != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(BlockError::Timeout)
    }

    /// 400ns settle: four reads of the alternate status register.
    fn delay_400ns(&self) {
        let mut port = Port::<u8>::new(self.ctrl_base);
        for _ in 0..4 {
            let _ = unsafe { port.read() };
        }
    }

    fn select(&self, lba: u64) {
        let head = if self.is_master { 0xE0 } else { 0xF0 };
        self.write_port(DRIVE_HEAD, head | ((lba >> 24) as u8 & 0x0F));
        self.delay_400ns();
    }

    fn identify(&mut self) -> BlockResult<()> {
        let select = if self.is_master { 0xA0 } else { 0xB0 };
        self.write_port(DRIVE_HEAD, select);
        self.delay_400ns();
        self.write_port(SECTOR_COUNT, 0);
        self.write_port(LBA_LOW, 0);
        self.write_port(LBA_MID, 0);
        self.write_port(LBA_HIGH, 0);
        self.write_port(CMD_STATUS, CMD_IDENTIFY);

        if self.read_port(CMD_STATUS) == 0 {
            return Err(BlockError::Io);
        }
        self.wait_bsy()?;
        if self.read_port(LBA_MID) != 0 || self.read_port(LBA_HIGH) != 0 {
            // ATAPI or something else entirely.
            return Err(BlockError::Io);
        }
        self.wait_drq()?;

        let mut identify = [0u16; 256];
        for word in identify.iter_mut() {
            *word = self.read_data16();
        }
        // Words 60..61 hold the LBA28 sector count.
        self.sectors = identify[60] as u64 | ((identify[61] as u64) << 16);
        Ok(())
    }

    fn issue(&self, lba: u64, command: u8) -> BlockResult<()> {
        if lba >= LBA28_MAX || lba >= self.sectors {
            return Err(BlockError::OutOfRange);
        }
        self.wait_bsy()?;
        self.select(lba);
        self.write_port(ERROR_REG, 0);
        self.write_port(SECTOR_COUNT, 1);
        self.write_port(LBA_LOW, lba as u8);
        self.write_port(LBA_MID, (lba >> 8) as u8);
        self.write_port(LBA_HIGH, (lba >> 16) as u8);
        self.write_port(CMD_STATUS, command);
        self.wait_drq()
    }
}

impl BlockDevice for AtaDevice {
    fn read(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> BlockResult<()> {
        self.issue(sector, CMD_READ_SECTORS)?;
        for i in 0..SECTOR_SIZE / 2 {
            let word = self.read_data16();
            buf[i * 2] = word as u8;
            buf[i * 2 + 1] = (word >> 8) as u8;
        }
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> BlockResult<()> {
        self.issue(sector, CMD_WRITE_SECTORS)?;
        for i in 0..SECTOR_SIZE / 2 {
            let word = buf[i * 2] as u16 | ((buf[i * 2 + 1] as u16) << 8);
            self.write_data16(word);
        }
        self.write_port(CMD_STATUS, CMD_CACHE_FLUSH);
        self.wait_bsy()
    }

    fn size(&self) -> u64 {
        self.sectors
    }
}
