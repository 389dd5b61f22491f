use super::{Chip, ChipVariant, TDDI_LAYOUT, TDDI_WATCHDOG};
use crate::checksum::VerifyMode;
use crate::connection::Connection;
use crate::Error;

pub const CHIP_ID: u16 = 0x7807;

const INT_FLAG: u32 = 0x048007;
const CHECKSUM_EN: u32 = 0x041016;
const DMA_CRC_SEL: u32 = 0x041017;

static VARIANT: ChipVariant = ChipVariant {
    name: "ILI7807",
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

#[derive(Copy, Clone, Debug)]
pub struct Ili7807;

impl Chip for Ili7807 {
    fn variant(&self) -> &ChipVariant {
        &VARIANT
    }

    fn arm_checksum_engine(&self, conn: &mut Connection) -> Result<(), Error> {
        conn.write_register(INT_FLAG, 0x02, 1)?;
        conn.write_register(CHECKSUM_EN, 0x00, 1)?;
        conn.write_register(CHECKSUM_EN, 0x01, 1)
    }

    fn checksum_done(&self, conn: &mut Connection) -> Result<bool, Error> {
        Ok((conn.read_one_byte(INT_FLAG)? >> 1) & 0x01 == 0x01)
    }

    fn select_dma_crc(&self, conn: &mut Connection) -> Result<(), Error> {
        conn.write_register(CHECKSUM_EN, 0x00, 1)?;
        conn.write_register(DMA_CRC_SEL, 0x03, 1)
    }

    fn has_dma_crc(&self) -> bool {
        true
    }
}
