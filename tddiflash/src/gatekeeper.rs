//! Decides whether the flash content already matches an image.

use crate::image::FlashBlockInfo;
use crate::session::Trigger;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};

#[derive(Debug)]
pub enum UpdateDecision {
    NeedUpdate,
    NoUpdateNeeded,
    /// The comparison itself failed; never read as "no update needed".
    CheckFailed(Error),
}

/// Live flash access needed to compare block CRCs.
pub trait CrcProbe {
    /// CRC the chip computes over `len` flash bytes at `start`.
    fn hardware_crc(&mut self, start: u32, len: u32) -> Result<u32, Error>;

    fn read_flash(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error>;
}

pub fn decide(
    trigger: Trigger,
    new_version: u32,
    old_version: u32,
    blocks: &mut [FlashBlockInfo],
    probe: &mut dyn CrcProbe,
) -> UpdateDecision {
    if trigger == Trigger::Manual {
        log::info!("manual upgrade, skipping version check");
        return UpdateDecision::NeedUpdate;
    }
    log::info!(
        "image version {:#010x}, chip version {:#010x}",
        new_version,
        old_version
    );
    let from_flash = new_version < old_version;
    match compare_blocks(blocks, probe, from_flash) {
        Ok(true) => UpdateDecision::NoUpdateNeeded,
        Ok(false) => UpdateDecision::NeedUpdate,
        Err(e) => {
            log::warn!("upgrade check failed: {}", e);
            UpdateDecision::CheckFailed(e)
        }
    }
}

/// Returns true when every block's expected CRC matches the chip.
fn compare_blocks(
    blocks: &mut [FlashBlockInfo],
    probe: &mut dyn CrcProbe,
    from_flash: bool,
) -> Result<bool, Error> {
    for block in blocks.iter_mut().filter(|b| b.end_addr != 0) {
        let range = block.crc_range();
        block.block_crc = probe.hardware_crc(range.start, range.end - range.start)?;
        let expected = if from_flash {
            let stored = probe.read_flash(range.end, 4)?;
            if stored.len() != 4 {
                return Err(Error::Protocol(format!(
                    "short CRC read at {:#x}",
                    range.end
                )));
            }
            BigEndian::read_u32(&stored)
        } else {
            block.hex_crc
        };
        if expected != block.block_crc {
            log::info!(
                "block {} CRC differs: expected {:#010x}, chip {:#010x}",
                block.number,
                expected,
                block.block_crc
            );
            return Ok(false);
        }
        log::debug!("block {} CRC {:#010x} matches", block.number, expected);
    }
    Ok(true)
}
