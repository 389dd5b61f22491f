use super::{BlockKind, FirmwareImage, FlashBlockInfo, HexTag};
use crate::chip::MemoryLayout;
use crate::error::ParseError;
use deku::prelude::*;

pub const BIN_HEADER_LEN: usize = 64;
const BIN_ENTRIES: usize = 5;

#[derive(Debug, PartialEq, DekuRead)]
#[deku(endian = "big")]
pub struct BinHeader {
    #[deku(bytes = "3")]
    pub ddi_start: u32,
    #[deku(bytes = "3")]
    pub ddi_end: u32,
    pub reserved: [u8; 26],
    /// Bit `i` set: block number `i + 1` is present.
    pub block_mask: u8,
    pub block_count: u8,
    #[deku(count = "BIN_ENTRIES")]
    pub entries: Vec<BinEntry>,
}

#[derive(Debug, PartialEq, DekuRead)]
#[deku(ctx = "endian: deku::ctx::Endian", endian = "endian")]
pub struct BinEntry {
    #[deku(bytes = "3")]
    pub start: u32,
    #[deku(bytes = "3")]
    pub end: u32,
}

impl BinHeader {
    pub fn from_slice(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < BIN_HEADER_LEN {
            return Err(ParseError::ShortHeader(BIN_HEADER_LEN));
        }
        let (_, header) = BinHeader::from_bytes((&data[..BIN_HEADER_LEN], 0))
            .map_err(|_| ParseError::ShortHeader(BIN_HEADER_LEN))?;
        Ok(header)
    }

    /// Block table described by the header; empty for the fixed legacy layout.
    pub fn blocks(&self) -> Result<Vec<FlashBlockInfo>, ParseError> {
        let mut blocks = Vec::new();
        if self.block_mask != 0 {
            for i in 0..8u8 {
                if self.block_mask & (1 << i) == 0 {
                    continue;
                }
                let number = i + 1;
                if number == BlockKind::Ddi as u8 {
                    blocks.push(FlashBlockInfo::new(self.ddi_start, self.ddi_end, number)?);
                } else if let Some(entry) = self.entries.get(i as usize) {
                    blocks.push(FlashBlockInfo::new(entry.start, entry.end, number)?);
                } else {
                    log::warn!("block mask names block {} with no header entry", number);
                }
            }
        } else {
            let count = self.block_count as usize;
            if count > BIN_ENTRIES {
                return Err(ParseError::TooManyBlocks(BIN_ENTRIES));
            }
            for (i, entry) in self.entries.iter().take(count).enumerate() {
                blocks.push(FlashBlockInfo::new(entry.start, entry.end, i as u8 + 1)?);
            }
        }
        Ok(blocks)
    }
}

pub fn parse(data: &[u8], layout: &MemoryLayout) -> Result<FirmwareImage, ParseError> {
    let header = BinHeader::from_slice(data)?;
    let body = &data[BIN_HEADER_LEN..];
    if body.len() > layout.max_hex_size as usize {
        return Err(ParseError::AddressOutOfRange {
            addr: body.len() as u32,
            max: layout.max_hex_size,
        });
    }

    let mut image = FirmwareImage::empty();
    image.write_flash(0, body);

    let blocks = header.blocks()?;
    if blocks.is_empty() {
        image.tag = HexTag::Legacy;
        image.buffers.insert(BlockKind::Ap, image.flash_range(0..layout.ap_size as u32));
        let dlm = layout.dlm_hex_addr;
        image.buffers.insert(
            BlockKind::Data,
            image.flash_range(dlm..dlm + layout.dlm_size as u32),
        );
        let mp = layout.mp_hex_addr;
        image.buffers.insert(
            BlockKind::Mp,
            image.flash_range(mp..mp + layout.mp_size as u32),
        );
    } else {
        image.tag = HexTag::BlockTable;
        for block in blocks {
            if block.end_addr >= layout.max_hex_size {
                return Err(ParseError::AddressOutOfRange {
                    addr: block.end_addr,
                    max: layout.max_hex_size,
                });
            }
            if let Some(kind) = block.kind() {
                let content = image.flash_range(block.start_addr..block.end_addr + 1);
                image.buffers.insert(kind, content);
            }
            image.push_block(block)?;
        }
    }

    image.finish(layout)
}
