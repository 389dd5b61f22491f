pub mod bus;
pub mod checksum;
pub mod chip;
mod config;
mod connection;
mod error;
mod flasher;
pub mod gatekeeper;
mod host_download;
pub mod image;
pub mod sector;
mod session;
#[cfg(test)]
mod sim;

pub use config::{Config, UpgradeMode, DEFAULT_CONFIG_FILE};
pub use connection::{Connection, ICE_CMD};
pub use error::{AbortReason, Error, ParseError, Phase, UpgradeError};
pub use flasher::{FlashCtrl, FlashOutcome, FlashState, Flasher};
pub use host_download::{GestureTarget, HostDownloadRequest, HostDownloader};
pub use session::{
    Monitor, Platform, RunningFirmware, Trigger, UpgradeSession, UpgradeState, UpgradeTicket,
    Upgrader,
};
