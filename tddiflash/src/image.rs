//! Firmware images as shipped for TDDI controllers.
//!
//! Two container formats carry the same content: a hex record stream with
//! vendor descriptor records, and a binary blob behind a 64-byte header. Both
//! parse into a [`FirmwareImage`] holding the flat flash image plus one buffer
//! per code block.

mod bin;
mod hex;

use crate::chip::MemoryLayout;
use crate::checksum::crc32;
use crate::error::ParseError;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

pub use bin::{BinEntry, BinHeader, BIN_HEADER_LEN};

pub const MAX_BLOCKS: usize = 7;
/// Size of the gesture info record at the tail of a block table AP block.
const GESTURE_INFO_TAIL: u32 = 60;

/// Layout discriminator carried by the image.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HexTag {
    /// Plain records, no block descriptors.
    None,
    /// Record type 0xAE: fixed AP/Data/MP windows.
    Legacy,
    /// Record type 0xAF: explicit block table.
    BlockTable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockKind {
    Ap = 1,
    Data = 2,
    Tuning = 3,
    Gesture = 4,
    Mp = 5,
    Ddi = 6,
}

impl BlockKind {
    pub fn from_number(number: u8) -> Option<Self> {
        Some(match number {
            1 => BlockKind::Ap,
            2 => BlockKind::Data,
            3 => BlockKind::Tuning,
            4 => BlockKind::Gesture,
            5 => BlockKind::Mp,
            6 => BlockKind::Ddi,
            _ => return None,
        })
    }

    /// Largest block of this kind the controller can hold.
    pub fn capacity(self, layout: &MemoryLayout) -> usize {
        match self {
            BlockKind::Ap => layout.ap_size,
            BlockKind::Data => layout.dlm_size,
            BlockKind::Tuning => layout.tuning_size,
            BlockKind::Gesture => layout.gesture_size,
            BlockKind::Mp => layout.mp_size,
            BlockKind::Ddi => layout.ddi_size,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Ap => "AP",
            BlockKind::Data => "DATA",
            BlockKind::Tuning => "TUNING",
            BlockKind::Gesture => "GESTURE",
            BlockKind::Mp => "MP",
            BlockKind::Ddi => "DDI",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlashBlockInfo {
    pub start_addr: u32,
    /// Inclusive.
    pub end_addr: u32,
    pub number: u8,
    /// CRC stored in the last four bytes of the block.
    pub hex_crc: u32,
    /// CRC the chip computed over the block, filled in by the upgrade check.
    pub block_crc: u32,
}

impl FlashBlockInfo {
    pub fn new(start_addr: u32, end_addr: u32, number: u8) -> Result<Self, ParseError> {
        if end_addr < start_addr {
            return Err(ParseError::InvalidBlock {
                start: start_addr,
                end: end_addr,
            });
        }
        Ok(FlashBlockInfo {
            start_addr,
            end_addr,
            number,
            ..Default::default()
        })
    }

    pub fn kind(&self) -> Option<BlockKind> {
        BlockKind::from_number(self.number)
    }

    pub fn len(&self) -> usize {
        (self.end_addr - self.start_addr) as usize + 1
    }

    pub fn contains(&self, addr: u32) -> bool {
        self.start_addr <= addr && addr <= self.end_addr
    }

    /// Range covered by the block CRC: everything but the stored CRC.
    pub fn crc_range(&self) -> Range<u32> {
        self.start_addr..(self.end_addr + 1).saturating_sub(4).max(self.start_addr)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GestureInfo {
    pub area_section: u32,
    /// Where the gesture code sits inside the AP code.
    pub ap_start_addr: u32,
    /// Where the gesture code sits in flash.
    pub start_addr: u32,
    pub end_addr: u32,
    pub length: u32,
    pub ap_length: u32,
}

#[derive(Clone, Debug)]
pub struct FirmwareImage {
    pub tag: HexTag,
    pub blocks: Vec<FlashBlockInfo>,
    /// Flat flash content, 0xFF where the image supplied nothing.
    pub flash: Vec<u8>,
    buffers: BTreeMap<BlockKind, Vec<u8>>,
    pub start_addr: u32,
    /// Exclusive end of the data the image supplies.
    pub end_addr: u32,
    /// Byte sum over every data byte.
    pub checksum: u32,
    pub fw_version: u32,
    pub gesture: Option<GestureInfo>,
    /// Address ranges written by the image, in file order.
    pub spans: Vec<Range<u32>>,
}

impl FirmwareImage {
    /// Detects the container format and parses it.
    pub fn parse(data: &[u8], layout: &MemoryLayout) -> Result<Self, ParseError> {
        match data.iter().find(|b| !b.is_ascii_whitespace()) {
            None => Err(ParseError::Empty),
            Some(b':') => hex::parse(data, layout),
            Some(_) => bin::parse(data, layout),
        }
    }

    fn empty() -> Self {
        FirmwareImage {
            tag: HexTag::None,
            blocks: Vec::new(),
            flash: Vec::new(),
            buffers: BTreeMap::new(),
            start_addr: u32::MAX,
            end_addr: 0,
            checksum: 0,
            fw_version: 0,
            gesture: None,
            spans: Vec::new(),
        }
    }

    pub fn block(&self, kind: BlockKind) -> Option<&[u8]> {
        self.buffers.get(&kind).map(Vec::as_slice)
    }

    pub fn block_info(&self, kind: BlockKind) -> Option<&FlashBlockInfo> {
        self.blocks.iter().find(|b| b.kind() == Some(kind))
    }

    pub fn flash_byte(&self, addr: u32) -> u8 {
        self.flash.get(addr as usize).copied().unwrap_or(0xFF)
    }

    /// Flat image bytes in `range`, padded with 0xFF past the supplied data.
    pub fn flash_range(&self, range: Range<u32>) -> Vec<u8> {
        range.map(|addr| self.flash_byte(addr)).collect()
    }

    pub fn be_word(&self, addr: u32) -> u32 {
        BigEndian::read_u32(&self.flash_range(addr..addr + 4))
    }

    pub fn le_word(&self, addr: u32) -> u32 {
        LittleEndian::read_u32(&self.flash_range(addr..addr + 4))
    }

    /// CRC the image expects over `block`, computed from its content.
    pub fn computed_crc(&self, block: &FlashBlockInfo) -> u32 {
        crc32(&self.flash_range(block.crc_range()))
    }

    fn write_flash(&mut self, addr: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let start = addr as usize;
        let end = start + data.len();
        if self.flash.len() < end {
            self.flash.resize(end, 0xFF);
        }
        self.flash[start..end].copy_from_slice(data);
        self.checksum = data
            .iter()
            .fold(self.checksum, |acc, &b| acc.wrapping_add(u32::from(b)));
        self.start_addr = self.start_addr.min(addr);
        self.end_addr = self.end_addr.max(end as u32);
        match self.spans.last_mut() {
            Some(last) if last.end == addr => last.end = end as u32,
            _ => self.spans.push(addr..end as u32),
        }
    }

    fn push_block(&mut self, block: FlashBlockInfo) -> Result<(), ParseError> {
        if self.blocks.len() == MAX_BLOCKS {
            return Err(ParseError::TooManyBlocks(MAX_BLOCKS));
        }
        if let Some(kind) = block.kind() {
            if self.block_info(kind).is_some() {
                return Err(ParseError::DuplicateBlock(kind));
            }
        }
        if let Some(other) = self
            .blocks
            .iter()
            .find(|b| b.start_addr <= block.end_addr && block.start_addr <= b.end_addr)
        {
            return Err(ParseError::OverlappingBlock {
                start: block.start_addr,
                end: block.end_addr,
                other: other.start_addr,
            });
        }
        log::debug!(
            "block {}: {:#x}..={:#x} number {}",
            self.blocks.len(),
            block.start_addr,
            block.end_addr,
            block.number
        );
        self.blocks.push(block);
        Ok(())
    }

    fn buffer_mut(&mut self, kind: BlockKind, len: usize) -> &mut Vec<u8> {
        self.buffers.entry(kind).or_insert_with(|| vec![0xFF; len])
    }

    fn legacy_gesture(&self, layout: &MemoryLayout) -> GestureInfo {
        let base = layout.legacy_gesture_info_addr;
        GestureInfo {
            area_section: self.le_word(base),
            ap_start_addr: self.le_word(base + 4),
            start_addr: self.le_word(base + 12),
            end_addr: self.le_word(base + 16),
            length: layout.gesture_size as u32,
            ap_length: layout.gesture_size as u32,
        }
    }

    fn block_table_gesture(&self, layout: &MemoryLayout) -> Option<GestureInfo> {
        let ap = self.block_info(BlockKind::Ap)?;
        let base = (ap.end_addr + 1).checked_sub(GESTURE_INFO_TAIL)?;
        log::debug!("gesture info at {:#x}", base);
        Some(GestureInfo {
            area_section: self.le_word(base),
            ap_start_addr: self.le_word(base + 4),
            start_addr: self.le_word(base + 12),
            end_addr: self.le_word(base + 16),
            length: layout.gesture_size as u32,
            ap_length: layout.gesture_size as u32,
        })
    }

    /// Shared tail of both parsers: version word, embedded CRCs and gesture
    /// code.
    fn finish(mut self, layout: &MemoryLayout) -> Result<Self, ParseError> {
        if self.flash.is_empty() {
            return Err(ParseError::Empty);
        }
        self.fw_version = self.be_word(layout.fw_version_addr);
        for i in 0..self.blocks.len() {
            let end = self.blocks[i].end_addr;
            self.blocks[i].hex_crc = self.be_word(end.saturating_sub(3));
        }
        if self.gesture.is_none() {
            self.gesture = match self.tag {
                HexTag::Legacy => Some(self.legacy_gesture(layout)),
                HexTag::BlockTable => self.block_table_gesture(layout),
                HexTag::None => None,
            };
        }
        if let Some(gesture) = &self.gesture {
            let start = gesture.start_addr;
            if !self.buffers.contains_key(&BlockKind::Gesture)
                && (start as usize) < self.flash.len()
            {
                let code = self.flash_range(start..start.saturating_add(gesture.length));
                self.buffers.insert(BlockKind::Gesture, code);
            }
        }
        log::debug!(
            "image {:?}: data {:#x}..{:#x}, {} blocks, version {:#010x}",
            self.tag,
            self.start_addr,
            self.end_addr,
            self.blocks.len(),
            self.fw_version
        );
        Ok(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chip::TDDI_LAYOUT;

    /// Encodes one record the way vendor tools emit it.
    pub fn record(ty: u8, addr: u16, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8, (addr >> 8) as u8, addr as u8, ty];
        bytes.extend_from_slice(data);
        let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        bytes.push(sum.wrapping_neg());
        format!(":{}\n", ::hex::encode_upper(bytes))
    }

    pub fn block_record(start: u32, end: u32, number: u8) -> String {
        let mut data = start.to_be_bytes()[1..].to_vec();
        data.extend_from_slice(&end.to_be_bytes()[1..]);
        data.push(number);
        record(0xAF, 0, &data)
    }

    /// Data records for `bytes` placed at absolute `addr`, with extended
    /// linear address records as needed.
    pub fn data_records(addr: u32, bytes: &[u8]) -> String {
        let mut out = String::new();
        let mut base = u32::MAX;
        for (i, chunk) in bytes.chunks(16).enumerate() {
            let a = addr + (i * 16) as u32;
            if a >> 16 != base {
                base = a >> 16;
                out += &record(0x04, 0, &(base as u16).to_be_bytes());
            }
            out += &record(0x00, a as u16, chunk);
        }
        out
    }

    #[test]
    fn detect_format() {
        assert_eq!(
            FirmwareImage::parse(b"  \n", &TDDI_LAYOUT).unwrap_err(),
            ParseError::Empty
        );
        let hex = format!("\n{}{}", record(0x00, 0, &[1, 2]), record(0x01, 0, &[]));
        let image = FirmwareImage::parse(hex.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.flash, vec![1, 2]);
    }

    #[test]
    fn crc_range_excludes_stored_crc() {
        let block = FlashBlockInfo::new(0x1000, 0x1FFF, 1).unwrap();
        assert_eq!(block.crc_range(), 0x1000..0x1FFC);
        assert_eq!(block.len(), 0x1000);
        assert!(block.contains(0x1FFF));
        assert!(!block.contains(0x2000));
        assert_eq!(
            FlashBlockInfo::new(2, 1, 1).unwrap_err(),
            ParseError::InvalidBlock { start: 2, end: 1 }
        );
    }

    #[test]
    fn flash_range_pads_with_erased_bytes() {
        let mut image = FirmwareImage::empty();
        image.write_flash(2, &[0xAA, 0xBB]);
        assert_eq!(image.flash_range(0..6), vec![0xFF, 0xFF, 0xAA, 0xBB, 0xFF, 0xFF]);
        assert_eq!(image.start_addr, 2);
        assert_eq!(image.end_addr, 4);
        assert_eq!(image.checksum, 0xAA + 0xBB);
        image.write_flash(4, &[0x01]);
        image.write_flash(8, &[0x02]);
        assert_eq!(image.spans, vec![2..5, 8..9]);
    }
}
