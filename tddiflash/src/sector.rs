use crate::image::{FirmwareImage, HexTag};
use crate::session::Trigger;
use crate::Error;
use serde::Deserialize;
use std::ops::Range;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashGeometry {
    pub sector_size: u32,
    pub page_size: u32,
    pub mem_size: u32,
}

impl Default for FlashGeometry {
    fn default() -> Self {
        FlashGeometry {
            sector_size: 0x1000,
            page_size: 0x100,
            mem_size: 0x20000,
        }
    }
}

impl FlashGeometry {
    pub fn sector_count(&self) -> Result<usize, Error> {
        if self.sector_size == 0 || self.page_size == 0 || self.mem_size == 0 {
            return Err(Error::Config(format!("zero sized flash geometry {:?}", self)));
        }
        if self.mem_size % self.sector_size != 0 {
            return Err(Error::Config(format!(
                "flash size {:#x} is not a multiple of the sector size {:#x}",
                self.mem_size, self.sector_size
            )));
        }
        if self.sector_size % self.page_size != 0 {
            return Err(Error::Config(format!(
                "sector size {:#x} is not a multiple of the page size {:#x}",
                self.sector_size, self.page_size
            )));
        }
        Ok((self.mem_size / self.sector_size) as usize)
    }
}

/// Inclusive address window that boot-time upgrades never erase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReservedWindow {
    pub start: u32,
    pub end: u32,
}

impl Default for ReservedWindow {
    fn default() -> Self {
        ReservedWindow {
            start: 0x1D000,
            end: 0x1DFFF,
        }
    }
}

impl ReservedWindow {
    fn overlaps(&self, start: u32, end: u32) -> bool {
        start <= self.end && self.start <= end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlashSector {
    pub ss_addr: u32,
    /// Inclusive.
    pub se_addr: u32,
    pub dlength: u32,
    /// The image supplies bytes for this sector.
    pub data_flag: bool,
    /// The sector lies entirely inside one image block.
    pub inside_block: bool,
}

impl FlashSector {
    pub fn is_selected(&self, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Boot => self.inside_block,
            Trigger::Manual => self.data_flag,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SectorMap {
    geometry: FlashGeometry,
    sectors: Vec<FlashSector>,
}

impl SectorMap {
    pub fn build(
        geometry: FlashGeometry,
        reserved: ReservedWindow,
        image: &FirmwareImage,
    ) -> Result<Self, Error> {
        let count = geometry.sector_count()?;
        if image.end_addr > geometry.mem_size {
            return Err(Error::Config(format!(
                "image data ends at {:#x}, beyond the {:#x} byte flash",
                image.end_addr, geometry.mem_size
            )));
        }

        let size = geometry.sector_size;
        let mut sectors: Vec<FlashSector> = (0..count as u32)
            .map(|i| FlashSector {
                ss_addr: i * size,
                se_addr: (i + 1) * size - 1,
                dlength: size,
                ..Default::default()
            })
            .collect();

        for span in &image.spans {
            if span.start >= span.end {
                continue;
            }
            let first = (span.start / size) as usize;
            let last = ((span.end - 1) / size) as usize;
            for sector in &mut sectors[first..=last] {
                sector.data_flag = true;
            }
        }

        for sector in &mut sectors {
            if image.tag != HexTag::None {
                sector.inside_block = image
                    .blocks
                    .iter()
                    .any(|b| sector.ss_addr >= b.start_addr && sector.se_addr <= b.end_addr);
            }
            if reserved.overlaps(sector.ss_addr, sector.se_addr) {
                sector.inside_block = false;
            }
            log::trace!(
                "sector {:#07x}..={:#07x} data {} inside block {}",
                sector.ss_addr,
                sector.se_addr,
                sector.data_flag,
                sector.inside_block
            );
        }

        Ok(SectorMap { geometry, sectors })
    }

    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlashSector> {
        self.sectors.iter()
    }

    pub fn selected(&self, trigger: Trigger) -> impl Iterator<Item = &FlashSector> {
        self.sectors.iter().filter(move |s| s.is_selected(trigger))
    }

    /// Contiguous address ranges made of selected sectors.
    pub fn selected_runs(&self, trigger: Trigger) -> Vec<Range<u32>> {
        let mut runs: Vec<Range<u32>> = Vec::new();
        for sector in self.selected(trigger) {
            match runs.last_mut() {
                Some(run) if run.end == sector.ss_addr => run.end = sector.se_addr + 1,
                _ => runs.push(sector.ss_addr..sector.se_addr + 1),
            }
        }
        runs
    }
}
