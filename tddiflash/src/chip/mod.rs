mod ili7807;
mod ili9881;
pub use ili7807::Ili7807;
pub use ili9881::{CoreType, Ili9881};

use crate::checksum::VerifyMode;
use crate::connection::Connection;
use crate::Error;

/// Where the image puts each block and how large each block may get.
#[derive(Debug, Clone)]
pub struct MemoryLayout {
    pub ap_size: usize,
    pub dlm_size: usize,
    pub mp_size: usize,
    pub gesture_size: usize,
    pub tuning_size: usize,
    pub ddi_size: usize,
    /// Legacy images: Data code starts here in the hex address space.
    pub dlm_hex_addr: u32,
    /// Legacy images: MP code starts here in the hex address space.
    pub mp_hex_addr: u32,
    /// RAM address the Data block is downloaded to.
    pub dlm_start_addr: u32,
    pub fw_version_addr: u32,
    pub legacy_gesture_info_addr: u32,
    pub max_hex_size: u32,
    pub bin_header_len: usize,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    pub addr: u32,
    /// Written low byte first to stop the watchdog.
    pub disable_key: u16,
    pub enable: u32,
    pub status_addr: u32,
    pub running_mask: u8,
    pub poll_tries: u32,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ChipVariant {
    pub name: &'static str,
    pub id: u16,
    pub slave_addr: u8,
    pub ice_mode_addr: u32,
    pub verify_mode: VerifyMode,
    /// Largest range the checksum engine accepts in one request.
    pub max_transfer_count: u32,
    /// Time the chip needs after reset to copy flash into instruction RAM.
    pub delay_after_upgrade_ms: u64,
    pub download_chunk: usize,
    pub layout: MemoryLayout,
    pub watchdog: Watchdog,
}

impl ChipVariant {
    /// Byte width of the checksum engine's receive count register.
    pub fn receive_count_width(&self) -> usize {
        if self.max_transfer_count > 0xFFFF {
            3
        } else {
            2
        }
    }
}

pub(crate) const TDDI_LAYOUT: MemoryLayout = MemoryLayout {
    ap_size: 64 * 1024,
    dlm_size: 8 * 1024,
    mp_size: 64 * 1024,
    gesture_size: 8 * 1024,
    tuning_size: 4 * 1024,
    ddi_size: 4 * 1024,
    dlm_hex_addr: 0x10000,
    mp_hex_addr: 0x13000,
    dlm_start_addr: 0x20610,
    fw_version_addr: 0xFFE0,
    legacy_gesture_info_addr: 0xFFCC,
    max_hex_size: 160 * 1024,
    bin_header_len: 64,
};

pub(crate) const TDDI_WATCHDOG: Watchdog = Watchdog {
    addr: 0x5100C,
    disable_key: 0x9881,
    enable: 0x01,
    status_addr: 0x51018,
    running_mask: 0x40,
    poll_tries: 10,
    poll_interval_ms: 5,
};

pub trait Chip {
    fn variant(&self) -> &ChipVariant;

    /// Clears the completion flag and enables the checksum engine ahead of a
    /// dual-read request.
    fn arm_checksum_engine(&self, conn: &mut Connection) -> Result<(), Error>;

    fn checksum_done(&self, conn: &mut Connection) -> Result<bool, Error>;

    /// Routes the DMA engine through the CRC unit. Only called when
    /// [`Chip::has_dma_crc`] is true.
    fn select_dma_crc(&self, conn: &mut Connection) -> Result<(), Error>;

    fn has_dma_crc(&self) -> bool;

    fn set_watchdog(&self, conn: &mut Connection, enable: bool) -> Result<(), Error> {
        let wdt = &self.variant().watchdog;
        if enable {
            conn.write_register(wdt.addr, wdt.enable, 1)?;
        } else {
            conn.write_register(wdt.addr, u32::from(wdt.disable_key & 0xFF), 1)?;
            conn.write_register(wdt.addr, u32::from(wdt.disable_key >> 8), 1)?;
        }
        let (addr, mask) = (wdt.status_addr, wdt.running_mask);
        if !enable {
            return conn.poll_until_idle(addr, mask, wdt.poll_tries, wdt.poll_interval_ms);
        }
        conn.poll("watchdog state", wdt.poll_tries, wdt.poll_interval_ms, |c| {
            Ok(c.read_one_byte(addr)? & mask != 0)
        })
    }
}

pub fn by_name(name: &str) -> Result<Box<dyn Chip>, Error> {
    match name.to_ascii_lowercase().as_str() {
        "ili7807" => Ok(Box::new(Ili7807)),
        "ili9881" => Ok(Box::new(Ili9881::new(CoreType::H))),
        "ili9881f" => Ok(Box::new(Ili9881::new(CoreType::F))),
        _ => Err(Error::UnrecognizedChip(name.to_string())),
    }
}

pub fn by_id(id: u16, core: CoreType) -> Result<Box<dyn Chip>, Error> {
    match id {
        ili7807::CHIP_ID => Ok(Box::new(Ili7807)),
        ili9881::CHIP_ID => Ok(Box::new(Ili9881::new(core))),
        _ => Err(Error::UnrecognizedChip(format!("{:#06x}", id))),
    }
}
