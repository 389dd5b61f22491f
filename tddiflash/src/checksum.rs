use crc::{Crc, CRC_32_MPEG_2};
use serde::Deserialize;

/// Same parameters as the controller's CRC unit: polynomial 0x04C11DB7,
/// initial value 0xFFFFFFFF, MSB first, no final XOR.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    Crc32,
    Checksum,
}

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

pub fn additive(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// One-byte checksum closing a packet: the two's complement of the byte sum.
pub fn packet_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)).wrapping_neg()
}

impl VerifyMode {
    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            VerifyMode::Crc32 => crc32(data),
            VerifyMode::Checksum => additive(data),
        }
    }
}
