use env_logger::Env;
use main_error::MainError;
use std::fs::read;
use std::path::PathBuf;
use structopt::StructOpt;
use tddiflash::{
    chip::{self, Chip},
    image::FirmwareImage,
    sector::SectorMap,
    Config, Error, Trigger,
};

#[derive(StructOpt)]
struct Common {
    /// Path to the configuration file, default to be tddiflash.toml
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Chip name, overrides the configuration file
    #[structopt(long)]
    chip: Option<String>,
    /// Hex or bin firmware image
    #[structopt(parse(from_os_str))]
    image: PathBuf,
}

#[derive(StructOpt)]
struct InfoOpt {
    #[structopt(flatten)]
    common: Common,
    /// Print every flash sector
    #[structopt(short, long)]
    sectors: bool,
}

#[derive(StructOpt)]
struct VerifyOpt {
    #[structopt(flatten)]
    common: Common,
}

#[derive(StructOpt)]
enum Opt {
    /// Show the blocks, version and sector plan of an image
    Info(InfoOpt),
    /// Check the CRC stored at the end of each block
    Verify(VerifyOpt),
}

impl Common {
    fn load(&self) -> Result<(Config, Box<dyn Chip>, FirmwareImage), Error> {
        let config = Config::load(self.config.as_deref())?;
        let chip = chip::by_name(self.chip.as_deref().unwrap_or(config.chip.as_str()))?;
        let data = read(&self.image)?;
        let image = FirmwareImage::parse(&data, &chip.variant().layout)?;
        log::trace!("Config: {:x?}", config);
        Ok((config, chip, image))
    }
}

fn info(opt: InfoOpt) -> Result<(), Error> {
    let (config, chip, image) = opt.common.load()?;
    log::info!("Chip: {}", chip.variant().name);
    log::info!("Format: {:?}", image.tag);
    log::info!("Firmware version: {:#010x}", image.fw_version);
    log::info!(
        "Data: {:#x}..{:#x}, checksum {:#010x}",
        image.start_addr,
        image.end_addr,
        image.checksum
    );
    for block in &image.blocks {
        let kind = block
            .kind()
            .map_or_else(|| format!("#{}", block.number), |k| k.to_string());
        log::info!(
            "  {:8} {:#07x}..={:#07x} crc {:#010x} computed {:#010x}",
            kind,
            block.start_addr,
            block.end_addr,
            block.hex_crc,
            image.computed_crc(block)
        );
    }
    if let Some(gesture) = &image.gesture {
        log::info!(
            "Gesture: area {} flash {:#x}..{:#x} AP offset {:#x} length {:#x}",
            gesture.area_section,
            gesture.start_addr,
            gesture.end_addr,
            gesture.ap_start_addr,
            gesture.length
        );
    }

    let sectors = SectorMap::build(config.flash, config.reserved, &image)?;
    for trigger in [Trigger::Manual, Trigger::Boot] {
        log::info!(
            "{:?} upgrade touches {} of {} sectors",
            trigger,
            sectors.selected(trigger).count(),
            sectors.len()
        );
    }
    if opt.sectors {
        for sector in sectors.iter() {
            println!(
                "{:#07x}..={:#07x} data={} block={}",
                sector.ss_addr, sector.se_addr, sector.data_flag as u8, sector.inside_block as u8
            );
        }
    }
    Ok(())
}

fn verify(opt: VerifyOpt) -> Result<(), Error> {
    let (_, _, image) = opt.common.load()?;
    let mut first_bad = None;
    for block in &image.blocks {
        let computed = image.computed_crc(block);
        if computed == block.hex_crc {
            log::info!("Block {} CRC {:#010x} ok", block.number, computed);
            continue;
        }
        log::error!(
            "Block {} CRC mismatch: stored {:#010x}, computed {:#010x}",
            block.number,
            block.hex_crc,
            computed
        );
        if first_bad.is_none() {
            let range = block.crc_range();
            first_bad = Some(Error::VerifyFailed {
                start: range.start,
                len: range.end - range.start,
                expected: block.hex_crc,
                actual: computed,
            });
        }
    }
    if let Some(e) = first_bad {
        return Err(e);
    }
    log::info!("Success");
    Ok(())
}

#[paw::main]
fn main(args: Opt) -> Result<(), MainError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("tddiflash=info"))
        .format_timestamp(None)
        .init();

    match args {
        Opt::Info(opt) => info(opt)?,
        Opt::Verify(opt) => verify(opt)?,
    };

    Ok(())
}
