//! Loading code straight into instruction RAM, leaving the flash untouched.

use crate::checksum::crc32;
use crate::chip::Chip;
use crate::connection::Connection;
use crate::error::{Phase, UpgradeError};
use crate::flasher::{get_bar, with_cleanup};
use crate::image::{BlockKind, FirmwareImage, HexTag};
use crate::session::UpgradeState;
use crate::Error;

const CODE_RESET: u32 = 0x040040;
const CODE_RESET_KEY: u32 = 0xAE;

mod dma {
    pub const SRC_ADDR: u32 = 0x072104;
    pub const SRC_CTRL: u32 = 0x072108;
    pub const DEST_CTRL: u32 = 0x072114;
    pub const TRIGGER_SEL: u32 = 0x072118;
    pub const SIZE: u32 = 0x07211C;
    pub const START: u32 = 0x072100;
    pub const CRC_ENABLE: u32 = 0x041016;
    pub const DONE_FLAG: u32 = 0x048006;
    pub const CRC_RESULT: u32 = 0x04101C;
}

/// Which part of the AP image a gesture switch downloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GestureTarget {
    GestureCode,
    ApCode,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostDownloadRequest {
    Normal,
    /// Loads the MP test firmware in place of the AP code.
    Test,
    Gesture(GestureTarget),
}

struct Segment<'i> {
    kind: BlockKind,
    addr: u32,
    data: &'i [u8],
    /// Bytes covered by the DMA CRC.
    crc_len: usize,
}

pub struct HostDownloader<'a> {
    connection: &'a mut Connection,
    chip: &'a dyn Chip,
    progress: &'a UpgradeState,
    chunk: usize,
}

impl<'a> HostDownloader<'a> {
    pub fn new(
        connection: &'a mut Connection,
        chip: &'a dyn Chip,
        progress: &'a UpgradeState,
    ) -> Self {
        HostDownloader {
            connection,
            chip,
            progress,
            chunk: chip.variant().download_chunk,
        }
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Writes `data` to RAM at `start`, one ICE frame per chunk.
    pub fn write_block(&mut self, start: u32, data: &[u8]) -> Result<(), Error> {
        self.write_chunked(start, data, self.chunk)
    }

    fn write_chunked(&mut self, start: u32, data: &[u8], chunk: usize) -> Result<(), Error> {
        log::debug!("download {:#x}+{:#x} in {} byte chunks", start, data.len(), chunk);
        let pb = get_bar(data.len() as u64);
        let mut addr = start;
        for piece in data.chunks(chunk) {
            self.connection.write_block(addr, piece)?;
            addr += piece.len() as u32;
            let done = (addr - start) as u64;
            self.progress.report(done * 101 / data.len() as u64);
            pb.inc(piece.len() as u64);
        }
        pb.finish_and_clear();
        Ok(())
    }

    pub fn read_block(&mut self, start: u32, len: usize) -> Result<Vec<u8>, Error> {
        self.read_chunked(start, len, self.chunk)
    }

    fn read_chunked(&mut self, start: u32, len: usize, chunk: usize) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let n = chunk.min(len - out.len());
            let addr = start + out.len() as u32;
            out.extend(self.connection.read_block(addr, n)?);
        }
        Ok(out)
    }

    /// CRC the DMA engine computes while copying `size` bytes at `start`.
    pub fn dma_crc(&mut self, start: u32, size: u32) -> Result<u32, Error> {
        let conn = &mut *self.connection;
        conn.write_register(dma::SRC_ADDR, start, 4)?;
        conn.write_register(dma::SRC_CTRL, 0x8000_0001, 4)?;
        conn.write_register(dma::DEST_CTRL, 0x0003_0000, 4)?;
        conn.write_register(dma::TRIGGER_SEL, 0x8000_0000, 4)?;
        conn.write_register(dma::SIZE, size, 4)?;
        self.chip.select_dma_crc(conn)?;
        conn.write_register(dma::CRC_ENABLE, 0x01, 1)?;
        conn.write_register(dma::START, 0x00, 4)?;
        conn.write_register(dma::DONE_FLAG, 0x01, 1)?;
        conn.write_register(dma::START, 0x0100_0000, 4)?;
        conn.poll("DMA CRC", 50, 1, |c| {
            Ok(c.read_one_byte(dma::DONE_FLAG)? & 0x01 == 0x01)
        })?;
        conn.read_register(dma::CRC_RESULT)
    }

    pub fn run(
        &mut self,
        image: &FirmwareImage,
        request: HostDownloadRequest,
    ) -> Result<(), UpgradeError> {
        log::info!("Host download ({:?})", request);
        self.connection
            .enter_ice_mode(self.chip.variant().ice_mode_addr)
            .map_err(|e| UpgradeError::new(Phase::MaintenanceMode, e))?;

        let result = match self.chip.set_watchdog(self.connection, false) {
            Ok(()) => self.download(image, request),
            Err(e) => Err(UpgradeError::new(Phase::Watchdog, e)),
        };
        let restore = self.chip.set_watchdog(self.connection, true);
        let mut result = with_cleanup(result, restore, Phase::Watchdog);

        if !matches!(request, HostDownloadRequest::Gesture(_)) {
            log::debug!("code reset");
            let reset = self
                .connection
                .with_reset_in_progress(|c| c.write_register(CODE_RESET, CODE_RESET_KEY, 1));
            result = with_cleanup(result, reset, Phase::Download);
        }
        let exit = self.connection.exit_ice_mode();
        with_cleanup(result, exit, Phase::MaintenanceMode)
    }

    fn download(
        &mut self,
        image: &FirmwareImage,
        request: HostDownloadRequest,
    ) -> Result<(), UpgradeError> {
        let at = |e| UpgradeError::new(Phase::Download, e);
        match request {
            HostDownloadRequest::Normal => {
                let segments = self.segments(image).map_err(at)?;
                for seg in &segments {
                    log::info!("Download {} to {:#x}", seg.kind, seg.addr);
                    self.write_block(seg.addr, seg.data).map_err(at)?;
                }
                self.verify(&segments)
            }
            HostDownloadRequest::Test => {
                let mp = required(image, BlockKind::Mp).map_err(at)?;
                let mp = match image.block_info(BlockKind::Mp) {
                    Some(info) if image.tag == HexTag::BlockTable => &mp[..info.len().min(mp.len())],
                    _ => mp,
                };
                log::info!("Download MP code");
                self.write_block(0, mp).map_err(at)?;
                let chunk = self.chunk;
                self.compare(0, mp, chunk)
            }
            HostDownloadRequest::Gesture(target) => {
                let gesture = image
                    .gesture
                    .clone()
                    .ok_or_else(|| Error::Config("image carries no gesture info".into()))
                    .map_err(at)?;
                let addr = gesture.ap_start_addr;
                let data = match target {
                    GestureTarget::GestureCode => {
                        let code = required(image, BlockKind::Gesture).map_err(at)?;
                        padded(code, gesture.length as usize)
                    }
                    GestureTarget::ApCode => {
                        let ap = required(image, BlockKind::Ap).map_err(at)?;
                        let start = (addr as usize).min(ap.len());
                        padded(&ap[start..], gesture.ap_length as usize)
                    }
                };
                log::info!("Download {:?} to {:#x}", target, addr);
                let chunk = data.len().max(1);
                self.write_chunked(addr, &data, chunk).map_err(at)?;
                self.compare(addr, &data, chunk)
            }
        }
    }

    fn segments<'i>(&self, image: &'i FirmwareImage) -> Result<Vec<Segment<'i>>, Error> {
        let layout = &self.chip.variant().layout;
        let dlm = layout.dlm_start_addr;
        let mut segments = Vec::new();
        match image.tag {
            HexTag::BlockTable => {
                let data_len = image
                    .block(BlockKind::Data)
                    .map_or(layout.dlm_size, <[u8]>::len);
                for (kind, addr) in [
                    (BlockKind::Ap, 0),
                    (BlockKind::Data, dlm),
                    (BlockKind::Tuning, dlm + data_len as u32),
                ] {
                    if let Some(data) = image.block(kind) {
                        segments.push(Segment {
                            kind,
                            addr,
                            data,
                            crc_len: data.len().saturating_sub(4),
                        });
                    }
                }
            }
            _ => {
                let ap = required(image, BlockKind::Ap)?;
                segments.push(Segment {
                    kind: BlockKind::Ap,
                    addr: 0,
                    data: ap,
                    crc_len: ap.len().saturating_sub(4),
                });
                if let Some(data) = image.block(BlockKind::Data) {
                    segments.push(Segment {
                        kind: BlockKind::Data,
                        addr: dlm,
                        data,
                        crc_len: data.len(),
                    });
                }
            }
        }
        Ok(segments)
    }

    fn verify(&mut self, segments: &[Segment]) -> Result<(), UpgradeError> {
        let at = |e| UpgradeError::new(Phase::Verify, e);
        for seg in segments {
            if self.chip.has_dma_crc() {
                let expected = crc32(&seg.data[..seg.crc_len]);
                let actual = self.dma_crc(seg.addr, seg.crc_len as u32).map_err(at)?;
                if expected != actual {
                    log::warn!("{} DMA CRC mismatch", seg.kind);
                    return Err(at(Error::VerifyFailed {
                        start: seg.addr,
                        len: seg.crc_len as u32,
                        expected,
                        actual,
                    }));
                }
                log::debug!("{} CRC {:#010x}", seg.kind, actual);
            } else {
                let chunk = self.chunk;
                self.compare(seg.addr, seg.data, chunk)?;
            }
        }
        log::info!("Download verified");
        Ok(())
    }

    fn compare(&mut self, addr: u32, expected: &[u8], chunk: usize) -> Result<(), UpgradeError> {
        let at = |e| UpgradeError::new(Phase::Verify, e);
        let actual = self.read_chunked(addr, expected.len(), chunk).map_err(at)?;
        if actual != expected {
            let offset = actual
                .iter()
                .zip(expected)
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            log::warn!("read back differs at {:#x}", addr + offset as u32);
            return Err(at(Error::VerifyFailed {
                start: addr,
                len: expected.len() as u32,
                expected: crc32(expected),
                actual: crc32(&actual),
            }));
        }
        Ok(())
    }
}

fn required(image: &FirmwareImage, kind: BlockKind) -> Result<&[u8], Error> {
    image
        .block(kind)
        .ok_or_else(|| Error::Config(format!("image has no {} block", kind)))
}

fn padded(data: &[u8], len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = data.iter().copied().take(len).collect();
    out.resize(len, 0xFF);
    out
}
