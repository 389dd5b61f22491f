use super::{BlockKind, FirmwareImage, FlashBlockInfo, HexTag};
use crate::checksum::packet_checksum;
use crate::chip::MemoryLayout;
use crate::error::ParseError;
use byteorder::{BigEndian, ByteOrder};

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
const LEGACY_BLOCK: u8 = 0xAE;
const BLOCK_TABLE: u8 = 0xAF;

struct Record<'a> {
    addr: u16,
    ty: u8,
    data: &'a [u8],
}

fn decode_line(line: &[u8], number: usize) -> Result<Vec<u8>, ParseError> {
    let digits = match line.split_first() {
        Some((b':', rest)) => rest,
        _ => return Err(ParseError::MissingColon { line: number }),
    };
    let bytes = ::hex::decode(digits).map_err(|e| match e {
        ::hex::FromHexError::OddLength => ParseError::Truncated { line: number },
        _ => ParseError::InvalidHex { line: number },
    })?;
    if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
        return Err(ParseError::Truncated { line: number });
    }
    Ok(bytes)
}

fn split_record(bytes: &[u8]) -> Record<'_> {
    Record {
        addr: BigEndian::read_u16(&bytes[1..3]),
        ty: bytes[3],
        data: &bytes[4..bytes.len() - 1],
    }
}

fn verify_checksum(bytes: &[u8], number: usize) -> Result<(), ParseError> {
    let (expected, body) = match bytes.split_last() {
        Some((&cc, body)) => (cc, body),
        None => return Err(ParseError::Truncated { line: number }),
    };
    let actual = packet_checksum(body);
    if actual != expected {
        return Err(ParseError::Checksum {
            line: number,
            expected,
            actual,
        });
    }
    Ok(())
}

struct HexParser<'l> {
    layout: &'l MemoryLayout,
    image: FirmwareImage,
    base: u32,
    legacy_gesture_done: bool,
}

impl<'l> HexParser<'l> {
    fn descriptor(&mut self, record: &Record, number: usize) -> Result<(), ParseError> {
        let need = if record.ty == BLOCK_TABLE { 7 } else { 6 };
        if record.data.len() < need {
            return Err(ParseError::Truncated { line: number });
        }
        let start = BigEndian::read_u24(&record.data[0..3]);
        let end = BigEndian::read_u24(&record.data[3..6]);
        let block_number = if record.ty == BLOCK_TABLE {
            record.data[6]
        } else {
            0
        };
        let block = FlashBlockInfo::new(start, end, block_number)?;
        if end >= self.layout.max_hex_size {
            return Err(ParseError::AddressOutOfRange {
                addr: end,
                max: self.layout.max_hex_size,
            });
        }
        self.image.push_block(block)?;
        self.image.tag = if record.ty == BLOCK_TABLE {
            HexTag::BlockTable
        } else {
            HexTag::Legacy
        };
        Ok(())
    }

    fn data(&mut self, record: &Record) -> Result<(), ParseError> {
        let addr = self.base + u32::from(record.addr);
        let end = addr as usize + record.data.len();
        if end > self.layout.max_hex_size as usize {
            return Err(ParseError::AddressOutOfRange {
                addr,
                max: self.layout.max_hex_size,
            });
        }
        self.image.write_flash(addr, record.data);
        for (k, &byte) in record.data.iter().enumerate() {
            let at = addr + k as u32;
            match self.image.tag {
                HexTag::BlockTable => self.route_block_table(at, byte),
                HexTag::Legacy => self.route_legacy(at, byte),
                HexTag::None => {}
            }
        }
        Ok(())
    }

    fn route_block_table(&mut self, addr: u32, byte: u8) {
        let target = self
            .image
            .blocks
            .iter()
            .find(|b| b.contains(addr))
            .and_then(|b| Some((b.kind()?, b.start_addr, b.len())));
        if let Some((kind, start, len)) = target {
            if let Some(b) = self
                .image
                .buffer_mut(kind, len)
                .get_mut((addr - start) as usize)
            {
                *b = byte;
            }
        }
    }

    fn route_legacy(&mut self, addr: u32, byte: u8) {
        let layout = self.layout;
        if addr < layout.dlm_hex_addr {
            if let Some(b) = self
                .image
                .buffer_mut(BlockKind::Ap, layout.ap_size)
                .get_mut(addr as usize)
            {
                *b = byte;
            }
        } else if addr < layout.mp_hex_addr {
            let offset = (addr - layout.dlm_hex_addr) as usize;
            if let Some(b) = self
                .image
                .buffer_mut(BlockKind::Data, layout.dlm_size)
                .get_mut(offset)
            {
                *b = byte;
            }
        } else {
            let offset = (addr - layout.mp_hex_addr) as usize;
            if let Some(b) = self
                .image
                .buffer_mut(BlockKind::Mp, layout.mp_size)
                .get_mut(offset)
            {
                *b = byte;
            }
        }

        // the descriptor is complete once the AP window has been passed
        if addr > layout.ap_size as u32 && !self.legacy_gesture_done {
            self.legacy_gesture_done = true;
            let gesture = self.image.legacy_gesture(layout);
            log::debug!(
                "gesture code {:#x}..{:#x}, area {}, AP offset {:#x}",
                gesture.start_addr,
                gesture.end_addr,
                gesture.area_section,
                gesture.ap_start_addr
            );
            self.image.gesture = Some(gesture);
        }
    }
}

pub fn parse(data: &[u8], layout: &MemoryLayout) -> Result<FirmwareImage, ParseError> {
    let mut parser = HexParser {
        layout,
        image: FirmwareImage::empty(),
        base: 0,
        legacy_gesture_done: false,
    };

    for (i, line) in data.split(|&b| b == b'\n').enumerate() {
        let number = i + 1;
        let line = trim(line);
        if line.is_empty() {
            continue;
        }
        let bytes = decode_line(line, number)?;
        let record = split_record(&bytes);
        match record.ty {
            DATA => {
                verify_checksum(&bytes, number)?;
                parser.data(&record)?;
            }
            END_OF_FILE => break,
            EXTENDED_SEGMENT_ADDRESS | EXTENDED_LINEAR_ADDRESS => {
                if record.data.len() < 2 {
                    return Err(ParseError::Truncated { line: number });
                }
                let value = u32::from(BigEndian::read_u16(record.data));
                parser.base = if record.ty == EXTENDED_LINEAR_ADDRESS {
                    value << 16
                } else {
                    value << 4
                };
            }
            LEGACY_BLOCK | BLOCK_TABLE => parser.descriptor(&record, number)?,
            other => log::trace!("line {}: skipping record type {:#04x}", number, other),
        }
    }

    parser.image.finish(layout)
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &line[start..end.max(start)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::TDDI_LAYOUT;
    use crate::image::tests::{block_record, data_records, record};

    fn eof() -> String {
        record(END_OF_FILE, 0, &[])
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7) ^ seed).collect()
    }

    #[test]
    fn block_table_routes_bytes_into_blocks() {
        let ap = pattern(0x40, 0x11);
        let data = pattern(0x20, 0x22);
        let mp = pattern(0x30, 0x33);
        let text = [
            block_record(0x0, 0x3F, 1),
            block_record(0x10000, 0x1001F, 2),
            block_record(0x13000, 0x1302F, 5),
            data_records(0x0, &ap),
            data_records(0x10000, &data),
            data_records(0x13000, &mp),
            eof(),
        ]
        .concat();

        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.tag, HexTag::BlockTable);
        assert_eq!(image.blocks.len(), 3);
        assert_eq!(image.block(BlockKind::Ap).unwrap(), &ap[..]);
        assert_eq!(image.block(BlockKind::Data).unwrap(), &data[..]);
        assert_eq!(image.block(BlockKind::Mp).unwrap(), &mp[..]);
        assert_eq!(image.end_addr, 0x13030);
        for (o, &b) in mp.iter().enumerate() {
            assert_eq!(image.flash[0x13000 + o], b);
        }
        let sum = ap.iter().chain(&data).chain(&mp).map(|&b| u32::from(b)).sum::<u32>();
        assert_eq!(image.checksum, sum);
    }

    #[test]
    fn block_table_gesture_descriptor_from_ap_tail() {
        let mut ap = vec![0u8; 0x100];
        let info = 0x100 - 60;
        ap[info..info + 4].copy_from_slice(&3u32.to_le_bytes());
        ap[info + 4..info + 8].copy_from_slice(&0x80u32.to_le_bytes());
        ap[info + 12..info + 16].copy_from_slice(&0x40u32.to_le_bytes());
        let text = [block_record(0, 0xFF, 1), data_records(0, &ap), eof()].concat();

        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        let gesture = image.gesture.clone().unwrap();
        assert_eq!(gesture.area_section, 3);
        assert_eq!(gesture.ap_start_addr, 0x80);
        assert_eq!(gesture.start_addr, 0x40);
        assert_eq!(gesture.length, 8 * 1024);
        let code = image.block(BlockKind::Gesture).unwrap();
        assert_eq!(code.len(), 8 * 1024);
        assert_eq!(&code[..0x10], &ap[0x40..0x50]);
        assert!(code[0xC0..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn legacy_layout_uses_fixed_windows() {
        let mut ap = vec![0x5Au8; 0x10000];
        ap[0xFFD8..0xFFDC].copy_from_slice(&0x2000u32.to_le_bytes());
        ap[0xFFE0..0xFFE4].copy_from_slice(&[0x00, 0x02, 0x00, 0x01]);
        let dlm = pattern(0x100, 0x44);
        let mp = pattern(0x100, 0x55);
        let text = [
            record(LEGACY_BLOCK, 0, &[0, 0, 0, 0x01, 0xFF, 0xFF]),
            data_records(0, &ap),
            data_records(0x10000, &dlm),
            data_records(0x13000, &mp),
            eof(),
        ]
        .concat();

        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.tag, HexTag::Legacy);
        assert_eq!(image.fw_version, 0x0002_0001);
        assert_eq!(image.block(BlockKind::Ap).unwrap(), &ap[..]);
        let data_block = image.block(BlockKind::Data).unwrap();
        assert_eq!(data_block.len(), 8 * 1024);
        assert_eq!(&data_block[..0x100], &dlm[..]);
        assert_eq!(&image.block(BlockKind::Mp).unwrap()[..0x100], &mp[..]);
        assert_eq!(image.gesture.as_ref().unwrap().start_addr, 0x2000);
        assert_eq!(image.blocks[0].number, 0);
    }

    #[test]
    fn segment_address_shifts_by_four() {
        let text = [
            record(EXTENDED_SEGMENT_ADDRESS, 0, &[0x10, 0x00]),
            record(DATA, 0x0010, &[0xAB]),
            eof(),
        ]
        .concat();
        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.start_addr, 0x10010);
        assert_eq!(image.flash_byte(0x10010), 0xAB);
    }

    #[test]
    fn records_after_eof_are_ignored() {
        let text = [record(DATA, 0, &[1]), eof(), "garbage\n".to_string()].concat();
        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.flash, vec![1]);
    }

    #[test]
    fn crlf_and_blank_lines_are_tolerated() {
        let text = format!("{}\r\n\r\n{}", record(DATA, 0, &[7, 8]).trim_end(), eof());
        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.flash, vec![7, 8]);
    }

    #[test]
    fn data_before_its_block_is_only_in_flat_image() {
        let text = [
            data_records(0x100, &[9, 9]),
            block_record(0x100, 0x1FF, 2),
            eof(),
        ]
        .concat();
        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.flash_byte(0x100), 9);
        assert!(image.block(BlockKind::Data).is_none());
    }

    #[test]
    fn malformed_records() {
        let bad_digit = ":01000000GG00\n";
        assert_eq!(
            FirmwareImage::parse(bad_digit.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::InvalidHex { line: 1 }
        );

        let short = ":0400000001\n";
        assert_eq!(
            FirmwareImage::parse(short.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::Truncated { line: 1 }
        );

        let mut good = record(DATA, 0, &[1, 2, 3]);
        good.truncate(good.len() - 3);
        good.push_str("00\n");
        assert!(matches!(
            FirmwareImage::parse(good.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::Checksum { line: 1, expected: 0, .. }
        ));

        let text = format!("{}nope\n", record(DATA, 0, &[1]));
        assert_eq!(
            FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::MissingColon { line: 2 }
        );
    }

    #[test]
    fn address_beyond_hex_size() {
        let text = [
            record(EXTENDED_LINEAR_ADDRESS, 0, &[0x00, 0x03]),
            record(DATA, 0x0000, &[1]),
        ]
        .concat();
        assert_eq!(
            FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::AddressOutOfRange {
                addr: 0x30000,
                max: 160 * 1024
            }
        );
    }

    #[test]
    fn too_many_blocks() {
        let text: String = (0..8)
            .map(|i| block_record(i * 0x1000, i * 0x1000 + 0xFFF, 7 + i as u8))
            .collect();
        assert_eq!(
            FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::TooManyBlocks(7)
        );
    }

    #[test]
    fn repeated_block_kind_is_rejected() {
        let text = [
            block_record(0x0, 0xF, 1),
            block_record(0x100, 0x1FF, 1),
            data_records(0x0, &[0x11; 0x10]),
            data_records(0x150, &[0x22]),
            eof(),
        ]
        .concat();
        assert_eq!(
            FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::DuplicateBlock(BlockKind::Ap)
        );
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let text = [
            block_record(0x0, 0x1FF, 1),
            block_record(0x100, 0x2FF, 2),
            eof(),
        ]
        .concat();
        assert_eq!(
            FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::OverlappingBlock {
                start: 0x100,
                end: 0x2FF,
                other: 0x0
            }
        );
    }

    #[test]
    fn image_without_data_is_empty() {
        let text = [block_record(0, 0xFF, 1), eof()].concat();
        assert_eq!(
            FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap_err(),
            ParseError::Empty
        );
    }

    #[test]
    fn embedded_block_crc() {
        let mut ap = pattern(0x100, 0x66);
        let crc = crate::checksum::crc32(&ap[..0xFC]);
        ap[0xFC..].copy_from_slice(&crc.to_be_bytes());
        let text = [block_record(0, 0xFF, 1), data_records(0, &ap), eof()].concat();
        let image = FirmwareImage::parse(text.as_bytes(), &TDDI_LAYOUT).unwrap();
        assert_eq!(image.blocks[0].hex_crc, crc);
        assert_eq!(image.computed_crc(&image.blocks[0]), crc);
    }
}
