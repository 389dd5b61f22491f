//! One upgrade request from start to end: serialization, progress reporting
//! and the host platform hooks around the flash programmer.

use crate::checksum::VerifyMode;
use crate::chip::Chip;
use crate::config::{Config, UpgradeMode};
use crate::connection::Connection;
use crate::error::{Phase, UpgradeError};
use crate::flasher::{FlashOutcome, Flasher};
use crate::host_download::{HostDownloadRequest, HostDownloader};
use crate::image::FirmwareImage;
use crate::sector::SectorMap;
use crate::Error;
use std::fs::read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

/// Highest progress reported before the upgrade is known to have succeeded.
const PROGRESS_CAP: u64 = 90;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Requested by an operator; always flashes every sector carrying data.
    Manual,
    /// Automatic upgrade at driver start from the linked-in image.
    Boot,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Monitor {
    Power,
    Esd,
}

/// Progress and exclusivity shared between the upgrade and its observers.
///
/// `status` is 0..=100 while running or after success, and a negative
/// [`Phase::code`] after a failure.
#[derive(Debug, Default)]
pub struct UpgradeState {
    status: AtomicI32,
    upgrading: AtomicBool,
}

impl UpgradeState {
    pub fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrading.load(Ordering::SeqCst)
    }

    /// Claims the upgrade slot; fails with [`Error::Busy`] while another
    /// upgrade holds it.
    pub fn begin(self: &Arc<Self>) -> Result<UpgradeTicket, Error> {
        self.upgrading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy)?;
        self.set_status(0);
        Ok(UpgradeTicket(Arc::clone(self)))
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn report(&self, percent: u64) {
        self.set_status(percent.min(PROGRESS_CAP) as i32);
    }
}

/// Releases the upgrade slot on drop.
#[derive(Debug)]
pub struct UpgradeTicket(Arc<UpgradeState>);

impl Drop for UpgradeTicket {
    fn drop(&mut self) {
        self.0.upgrading.store(false, Ordering::SeqCst);
    }
}

/// Version of the firmware currently running on the controller.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RunningFirmware {
    pub version: [u8; 4],
    pub protocol_major: u8,
}

impl RunningFirmware {
    /// Protocol 3 and later report four version bytes, older ones three.
    pub fn word(&self) -> u32 {
        let [a, b, c, d] = self.version;
        if self.protocol_major >= 3 {
            u32::from_be_bytes([a, b, c, d])
        } else {
            u32::from_be_bytes([0, a, b, c])
        }
    }
}

/// Everything the upgrade needs from the host besides the bus.
pub trait Platform {
    /// Pulses the reset line; `hold` keeps the controller in reset until the
    /// next ICE entry.
    fn reset(&mut self, hold: bool) -> Result<(), Error>;

    fn set_irq(&mut self, enabled: bool);

    /// Stops a background monitor. Returns true if it was running.
    fn suspend_monitor(&mut self, monitor: Monitor) -> bool;

    fn resume_monitor(&mut self, monitor: Monitor);

    fn running_firmware(&mut self) -> Result<RunningFirmware, Error>;

    /// Re-reads chip and firmware information after an upgrade.
    fn refresh_info(&mut self) -> Result<(), Error>;
}

/// State of one flash upgrade, dropped when the run ends.
#[derive(Debug)]
pub struct UpgradeSession {
    pub trigger: Trigger,
    pub old_fw_version: u32,
    pub new_fw_version: u32,
    pub verify_mode: VerifyMode,
    pub max_transfer_count: u32,
    pub image: FirmwareImage,
    pub sectors: Option<SectorMap>,
}

pub struct Upgrader<P: Platform> {
    connection: Connection,
    chip: Box<dyn Chip>,
    platform: P,
    config: Config,
    state: Arc<UpgradeState>,
    embedded: Option<Vec<u8>>,
}

impl<P: Platform> Upgrader<P> {
    pub fn new(connection: Connection, chip: Box<dyn Chip>, platform: P, config: Config) -> Self {
        Upgrader {
            connection,
            chip,
            platform,
            config,
            state: Arc::new(UpgradeState::default()),
            embedded: None,
        }
    }

    /// Image used for boot-time upgrades.
    pub fn with_embedded_image(mut self, image: Vec<u8>) -> Self {
        self.embedded = Some(image);
        self
    }

    /// Shares the progress counter and upgrade slot with other upgraders.
    pub fn with_state(mut self, state: Arc<UpgradeState>) -> Self {
        self.state = state;
        self
    }

    pub fn progress(&self) -> Arc<UpgradeState> {
        Arc::clone(&self.state)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn into_parts(self) -> (Connection, P) {
        (self.connection, self.platform)
    }

    pub fn upgrade_from_path(&mut self, path: &Path) -> Result<(), UpgradeError> {
        log::info!("Upgrade from {}", path.display());
        self.run(Trigger::Manual, None, |_| Ok(read(path)?))
    }

    pub fn upgrade_from_embedded_image(&mut self) -> Result<(), UpgradeError> {
        self.run(Trigger::Boot, None, |upgrader| {
            upgrader
                .embedded
                .clone()
                .ok_or_else(|| Error::Config("no embedded firmware image".into()))
        })
    }

    /// Runs one host download of `data`, whatever the configured mode.
    pub fn host_download(
        &mut self,
        data: &[u8],
        request: HostDownloadRequest,
    ) -> Result<(), UpgradeError> {
        self.run(Trigger::Manual, Some(request), |_| Ok(data.to_vec()))
    }

    fn run<F>(
        &mut self,
        trigger: Trigger,
        request: Option<HostDownloadRequest>,
        load: F,
    ) -> Result<(), UpgradeError>
    where
        F: FnOnce(&Self) -> Result<Vec<u8>, Error>,
    {
        let _ticket = self
            .state
            .begin()
            .map_err(|e| UpgradeError::new(Phase::Load, e))?;
        let result = self.with_monitors_suspended(|upgrader| {
            let data = load(&*upgrader).map_err(|e| UpgradeError::new(Phase::Load, e))?;
            upgrader.upgrade(&data, trigger, request)
        });
        match &result {
            Ok(()) => {
                self.state.set_status(100);
                log::info!("Upgrade succeeded");
            }
            Err(e) => {
                self.state.set_status(e.code());
                log::error!("Upgrade failed ({}): {}", e.code(), e);
            }
        }
        result
    }

    fn with_monitors_suspended<T, F: FnOnce(&mut Self) -> T>(&mut self, f: F) -> T {
        let suspended: Vec<Monitor> = [Monitor::Power, Monitor::Esd]
            .iter()
            .copied()
            .filter(|&m| self.platform.suspend_monitor(m))
            .collect();
        log::debug!("suspended monitors {:?}", suspended);
        let result = f(self);
        for monitor in suspended {
            self.platform.resume_monitor(monitor);
        }
        result
    }

    fn upgrade(
        &mut self,
        data: &[u8],
        trigger: Trigger,
        request: Option<HostDownloadRequest>,
    ) -> Result<(), UpgradeError> {
        let variant = self.chip.variant();
        let image = FirmwareImage::parse(data, &variant.layout)
            .map_err(|e| UpgradeError::new(Phase::Parse, e.into()))?;

        let request = match (request, self.config.mode) {
            (Some(request), _) => Some(request),
            (None, UpgradeMode::HostDownload) => Some(HostDownloadRequest::Normal),
            (None, UpgradeMode::Flash) => None,
        };

        if let Some(request) = request {
            let mut downloader =
                HostDownloader::new(&mut self.connection, self.chip.as_ref(), &self.state);
            if let Some(chunk) = self.config.download_chunk {
                downloader = downloader.with_chunk(chunk);
            }
            downloader.run(&image, request)?;
        } else {
            let running = self
                .platform
                .running_firmware()
                .map_err(|e| UpgradeError::new(Phase::Load, e))?;
            let sectors = SectorMap::build(self.config.flash, self.config.reserved, &image)
                .map_err(|e| UpgradeError::new(Phase::Parse, e))?;
            let mut session = UpgradeSession {
                trigger,
                old_fw_version: running.word(),
                new_fw_version: image.fw_version,
                verify_mode: self.config.verify.unwrap_or(variant.verify_mode),
                max_transfer_count: variant.max_transfer_count,
                image,
                sectors: Some(sectors),
            };
            let outcome = Flasher::new(
                &mut self.connection,
                self.chip.as_ref(),
                &mut self.platform,
                &self.state,
            )
            .run(&mut session)?;
            if outcome == FlashOutcome::UpToDate {
                return Ok(());
            }
        }

        self.platform
            .refresh_info()
            .map_err(|e| UpgradeError::new(Phase::Refresh, e))
    }
}
