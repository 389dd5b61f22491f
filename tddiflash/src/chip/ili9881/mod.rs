use super::{Chip, ChipVariant, TDDI_LAYOUT, TDDI_WATCHDOG};
use crate::checksum::VerifyMode;
use crate::connection::Connection;
use crate::Error;

pub const CHIP_ID: u16 = 0x9881;

const INT_FLAG: u32 = 0x048007;
const CHECKSUM_EN: u32 = 0x041016;
// type F moved the engine control into one 32-bit register
const F_CHECKSUM_CTRL: u32 = 0x041014;
const F_DMA_CRC_SEL: u32 = 0x041048;

static VARIANT: ChipVariant = ChipVariant {
    name: "ILI9881",
    id: CHIP_ID,
    slave_addr: 0x41,
    ice_mode_addr: 0x181062,
    verify_mode: VerifyMode::Crc32,
    max_transfer_count: 0x1FFFF,
    delay_after_upgrade_ms: 200,
    download_chunk: 2048,
    layout: TDDI_LAYOUT,
    watchdog: TDDI_WATCHDOG,
};

/// Silicon revision of the ILI9881 core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoreType {
    A,
    B,
    C,
    D,
    E,
    F,
    H,
}

#[derive(Copy, Clone, Debug)]
pub struct Ili9881 {
    core: CoreType,
}

impl Ili9881 {
    pub fn new(core: CoreType) -> Self {
        Ili9881 { core }
    }

    pub fn core(&self) -> CoreType {
        self.core
    }
}

impl Chip for Ili9881 {
    fn variant(&self) -> &ChipVariant {
        &VARIANT
    }

    fn arm_checksum_engine(&self, conn: &mut Connection) -> Result<(), Error> {
        if self.core == CoreType::F {
            conn.write_register(F_CHECKSUM_CTRL, 0x10000, 3)
        } else {
            conn.write_register(INT_FLAG, 0x02, 1)?;
            conn.write_register(CHECKSUM_EN, 0x00, 1)?;
            conn.write_register(CHECKSUM_EN, 0x01, 1)
        }
    }

    fn checksum_done(&self, conn: &mut Connection) -> Result<bool, Error> {
        let busy = if self.core == CoreType::F {
            conn.read_one_byte(F_CHECKSUM_CTRL)?
        } else {
            conn.read_one_byte(INT_FLAG)? >> 1
        };
        Ok(busy & 0x01 == 0x01)
    }

    fn select_dma_crc(&self, conn: &mut Connection) -> Result<(), Error> {
        conn.write_register(F_CHECKSUM_CTRL, 0x00, 4)?;
        conn.write_register(F_DMA_CRC_SEL, 0x01, 4)
    }

    fn has_dma_crc(&self) -> bool {
        self.core >= CoreType::E
    }
}
