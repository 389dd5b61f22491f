use crate::checksum::VerifyMode;
use crate::sector::{FlashGeometry, ReservedWindow};
use crate::Error;
use serde::Deserialize;
use std::fs::read;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "tddiflash.toml";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeMode {
    /// Erase and reprogram the SPI flash behind the controller.
    Flash,
    /// Load code straight into the controller's RAM.
    HostDownload,
}

impl Default for UpgradeMode {
    fn default() -> Self {
        UpgradeMode::Flash
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chip: String,
    pub mode: UpgradeMode,
    pub flash: FlashGeometry,
    pub reserved: ReservedWindow,
    /// Overrides the chip's own verify mode.
    pub verify: Option<VerifyMode>,
    /// Overrides the chip's host download chunk size.
    pub download_chunk: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chip: "ili9881".to_string(),
            mode: UpgradeMode::default(),
            flash: FlashGeometry::default(),
            reserved: ReservedWindow::default(),
            verify: None,
            download_chunk: None,
        }
    }
}

impl Config {
    /// Loads `path`, or `tddiflash.toml` in the working directory when no path
    /// is given. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path {
            Some(path) => Self::from_slice(&read(path)?)?,
            None => match read(DEFAULT_CONFIG_FILE) {
                Ok(data) => Self::from_slice(&data)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
                Err(e) => return Err(e.into()),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        Ok(toml::from_slice(data)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.flash.sector_count()?;
        if self.reserved.start > self.reserved.end {
            return Err(Error::Config(format!(
                "reserved window {:#x}..={:#x} is empty",
                self.reserved.start, self.reserved.end
            )));
        }
        if self.download_chunk == Some(0) {
            return Err(Error::Config("download_chunk must not be zero".into()));
        }
        Ok(())
    }
}
