use crate::checksum::VerifyMode;
use crate::chip::Chip;
use crate::connection::Connection;
use crate::error::{AbortReason, Phase, UpgradeError};
use crate::gatekeeper::{self, CrcProbe, UpdateDecision};
use crate::image::FirmwareImage;
use crate::sector::SectorMap;
use crate::session::{Platform, Trigger, UpgradeSession, UpgradeState};
use crate::Error;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::time::Instant;

pub(crate) fn get_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("  {wide_bar} {bytes}/{total_bytes} {bytes_per_sec} {eta}  ")
            .progress_chars("#>-"),
    );
    bar
}

/// Keeps the first failure; a failed cleanup step only surfaces when the main
/// work succeeded.
pub(crate) fn with_cleanup<T>(
    result: Result<T, UpgradeError>,
    cleanup: Result<(), Error>,
    phase: Phase,
) -> Result<T, UpgradeError> {
    match (result, cleanup) {
        (Ok(v), Ok(())) => Ok(v),
        (Ok(_), Err(e)) => Err(UpgradeError::new(phase, e)),
        (Err(e), Err(cleanup)) => {
            log::error!("{} cleanup failed: {}", phase, cleanup);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}

fn at(phase: Phase) -> impl FnOnce(Error) -> UpgradeError {
    move |e| UpgradeError::new(phase, e)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    EnteringMaintenanceMode,
    WatchdogDisabled,
    CheckingUpgradeNeed,
    Erasing,
    Programming,
    ExitingForReset,
    ReVerifying,
    Done,
    Aborted(AbortReason),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlashOutcome {
    Updated,
    /// The flash already matched the image; nothing was erased.
    UpToDate,
}

pub struct Flasher<'a> {
    connection: &'a mut Connection,
    chip: &'a dyn Chip,
    platform: &'a mut dyn Platform,
    progress: &'a UpgradeState,
    history: Vec<FlashState>,
}

impl<'a> Flasher<'a> {
    pub fn new(
        connection: &'a mut Connection,
        chip: &'a dyn Chip,
        platform: &'a mut dyn Platform,
        progress: &'a UpgradeState,
    ) -> Self {
        Flasher {
            connection,
            chip,
            platform,
            progress,
            history: vec![FlashState::Idle],
        }
    }

    pub fn state(&self) -> FlashState {
        self.history.last().copied().unwrap_or(FlashState::Idle)
    }

    /// Every state the run has passed through, in order.
    pub fn history(&self) -> &[FlashState] {
        &self.history
    }

    fn enter(&mut self, state: FlashState) {
        log::debug!("{:?} -> {:?}", self.state(), state);
        self.history.push(state);
    }

    pub fn run(&mut self, session: &mut UpgradeSession) -> Result<FlashOutcome, UpgradeError> {
        if let Some(FlashState::Done) | Some(FlashState::Aborted(_)) = self.history.last() {
            return Err(UpgradeError::new(
                Phase::MaintenanceMode,
                Error::Protocol("flasher already finished".into()),
            ));
        }
        let result = self.run_upgrade(session);
        match &result {
            Ok(_) => self.enter(FlashState::Done),
            Err(e) => {
                log::error!("{}", e);
                self.enter(FlashState::Aborted(e.source.abort_reason()));
            }
        }
        result
    }

    fn run_upgrade(&mut self, session: &mut UpgradeSession) -> Result<FlashOutcome, UpgradeError> {
        self.platform
            .reset(true)
            .map_err(at(Phase::MaintenanceMode))?;
        self.platform.set_irq(false);
        let result = self.with_maintenance_mode(|flasher| {
            flasher.with_watchdog_disabled(|flasher| flasher.update(session))
        });
        self.platform.set_irq(true);
        result
    }

    fn with_maintenance_mode<T, F: FnOnce(&mut Self) -> Result<T, UpgradeError>>(
        &mut self,
        f: F,
    ) -> Result<T, UpgradeError> {
        self.enter(FlashState::EnteringMaintenanceMode);
        log::info!("Enter ICE mode");
        self.connection
            .enter_ice_mode(self.chip.variant().ice_mode_addr)
            .map_err(at(Phase::MaintenanceMode))?;
        self.connection.delay(25);
        let result = f(self);
        let exit = self.connection.exit_ice_mode();
        with_cleanup(result, exit, Phase::MaintenanceMode)
    }

    fn with_watchdog_disabled<T, F: FnOnce(&mut Self) -> Result<T, UpgradeError>>(
        &mut self,
        f: F,
    ) -> Result<T, UpgradeError> {
        let result = match self.chip.set_watchdog(self.connection, false) {
            Ok(()) => {
                self.enter(FlashState::WatchdogDisabled);
                f(self)
            }
            Err(e) => Err(UpgradeError::new(Phase::Watchdog, e)),
        };
        let restore = self.chip.set_watchdog(self.connection, true);
        if restore.is_ok() {
            log::debug!("watchdog enabled");
        }
        with_cleanup(result, restore, Phase::Watchdog)
    }

    fn update(&mut self, session: &mut UpgradeSession) -> Result<FlashOutcome, UpgradeError> {
        self.enter(FlashState::CheckingUpgradeNeed);
        let decision = {
            let mut ctrl = FlashCtrl::new(self.connection, self.chip, session.verify_mode);
            gatekeeper::decide(
                session.trigger,
                session.new_fw_version,
                session.old_fw_version,
                &mut session.image.blocks,
                &mut ctrl,
            )
        };
        match decision {
            UpdateDecision::NeedUpdate => log::info!("Firmware differs, upgrading"),
            UpdateDecision::NoUpdateNeeded => {
                log::info!("Firmware CRC matches, nothing to do");
                return Ok(FlashOutcome::UpToDate);
            }
            UpdateDecision::CheckFailed(e) => {
                return Err(UpgradeError::new(
                    Phase::Check,
                    Error::CheckFailed(Box::new(e)),
                ))
            }
        }

        let sectors = session
            .sectors
            .as_ref()
            .ok_or_else(|| Error::Config("no sector map for flash upgrade".into()))
            .map_err(at(Phase::Erase))?;

        FlashCtrl::new(self.connection, self.chip, session.verify_mode)
            .protect_off()
            .map_err(at(Phase::Erase))?;
        self.erase(sectors, session.trigger)?;
        self.connection.delay(1);
        self.program(&session.image, sectors, session.trigger)?;

        self.enter(FlashState::ExitingForReset);
        self.platform.reset(true).map_err(at(Phase::Reset))?;
        self.connection
            .delay(self.chip.variant().delay_after_upgrade_ms);

        self.enter(FlashState::ReVerifying);
        log::info!("Enter ICE mode again");
        self.connection
            .enter_ice_mode(self.chip.variant().ice_mode_addr)
            .map_err(at(Phase::Verify))?;
        self.connection.delay(20);
        self.verify(session, sectors)?;

        Ok(FlashOutcome::Updated)
    }

    fn erase(&mut self, sectors: &SectorMap, trigger: Trigger) -> Result<(), UpgradeError> {
        self.enter(FlashState::Erasing);
        let mut ctrl = FlashCtrl::new(self.connection, self.chip, VerifyMode::Crc32);
        let mut count = 0;
        for sector in sectors.selected(trigger) {
            log::debug!("Erase sector {:#x}", sector.ss_addr);
            ctrl.erase_sector(sector.ss_addr)
                .map_err(at(Phase::Erase))?;
            count += 1;
        }
        log::info!("Erased {} sectors", count);
        Ok(())
    }

    fn program(
        &mut self,
        image: &FirmwareImage,
        sectors: &SectorMap,
        trigger: Trigger,
    ) -> Result<(), UpgradeError> {
        self.enter(FlashState::Programming);
        let page = sectors.geometry().page_size;
        let end = image.end_addr;
        let pages: Vec<u32> = sectors
            .selected(trigger)
            .flat_map(|s| (s.ss_addr..=s.se_addr).step_by(page as usize))
            .filter(|&addr| addr < end)
            .collect();

        let total = pages.len() as u64 * u64::from(page);
        let start = Instant::now();
        log::info!("Program flash...");
        let pb = get_bar(total);
        let mut ctrl = FlashCtrl::new(self.connection, self.chip, VerifyMode::Crc32);
        for addr in pages {
            let data = image.flash_range(addr..addr + page);
            ctrl.program_page(addr, &data)
                .map_err(at(Phase::Program))?;
            self.progress
                .report(u64::from(addr) * 101 / u64::from(end.max(1)));
            pb.inc(u64::from(page));
        }
        pb.finish_and_clear();
        let elapsed = start.elapsed();
        log::info!(
            "Program done {:?} {}/s",
            elapsed,
            HumanBytes((total as f64 / elapsed.as_millis().max(1) as f64 * 1000.0) as u64)
        );
        Ok(())
    }

    fn verify(&mut self, session: &UpgradeSession, sectors: &SectorMap) -> Result<(), UpgradeError> {
        let image = &session.image;
        let limit = session
            .max_transfer_count
            .saturating_sub(sectors.geometry().page_size)
            .max(1);
        let mut ctrl = FlashCtrl::new(self.connection, self.chip, session.verify_mode);
        for run in sectors.selected_runs(session.trigger) {
            let run_end = run.end.min(image.end_addr);
            let mut start = run.start;
            while start < run_end {
                let len = (run_end - start).min(limit);
                let expected = session
                    .verify_mode
                    .compute(&image.flash_range(start..start + len));
                let actual = ctrl.checksum(start, len).map_err(at(Phase::Verify))?;
                if expected != actual {
                    log::warn!(
                        "{:#x}+{:#x} mismatch: {:#010x} != {:#010x}",
                        start,
                        len,
                        actual,
                        expected
                    );
                    return Err(UpgradeError::new(
                        Phase::Verify,
                        Error::VerifyFailed {
                            start,
                            len,
                            expected,
                            actual,
                        },
                    ));
                }
                log::debug!("{:#x}+{:#x} verified {:#010x}", start, len, actual);
                start += len;
            }
        }
        log::info!("Data correct");
        Ok(())
    }
}

/// SPI NOR flash behind the controller's flash interface, driven one byte at a
/// time through ICE register writes.
pub struct FlashCtrl<'a> {
    conn: &'a mut Connection,
    chip: &'a dyn Chip,
    mode: VerifyMode,
}

impl<'a> FlashCtrl<'a> {
    pub fn new(conn: &'a mut Connection, chip: &'a dyn Chip, mode: VerifyMode) -> Self {
        FlashCtrl { conn, chip, mode }
    }

    fn select(&mut self) -> Result<(), Error> {
        self.conn.write_register(protocol::CS, protocol::CS_LOW, 1)?;
        self.conn.write_register(protocol::KEY, protocol::KEY_VALUE, 3)
    }

    fn deselect(&mut self) -> Result<(), Error> {
        self.conn.write_register(protocol::CS, protocol::CS_HIGH, 1)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &b in bytes {
            self.conn.write_register(protocol::TX, u32::from(b), 1)?;
        }
        Ok(())
    }

    fn send_command(&mut self, cmd: u8, addr: u32) -> Result<(), Error> {
        self.send(&[cmd, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8])
    }

    fn receive(&mut self) -> Result<u8, Error> {
        self.send(&[protocol::DUMMY])?;
        self.conn.read_one_byte(protocol::RX)
    }

    pub fn write_enable(&mut self) -> Result<(), Error> {
        self.select()?;
        self.send(&[protocol::WRITE_ENABLE])?;
        self.deselect()
    }

    /// Clears the block protection bits in the status register.
    pub fn protect_off(&mut self) -> Result<(), Error> {
        self.write_enable()?;
        self.select()?;
        self.send(&[protocol::WRITE_STATUS, 0x00])?;
        self.deselect()?;
        self.wait_idle()
    }

    pub fn wait_idle(&mut self) -> Result<(), Error> {
        self.select()?;
        self.send(&[protocol::READ_STATUS])?;
        let polled = self.conn.poll(
            "flash busy",
            protocol::BUSY_POLL_TRIES,
            protocol::BUSY_POLL_INTERVAL_MS,
            |c| {
                c.write_register(protocol::TX, u32::from(protocol::DUMMY), 1)?;
                Ok(c.read_one_byte(protocol::RX)? & protocol::STATUS_BUSY == 0)
            },
        );
        let deselect = self.deselect();
        polled.and(deselect)
    }

    pub fn erase_sector(&mut self, addr: u32) -> Result<(), Error> {
        self.write_enable()?;
        self.select()?;
        self.send_command(protocol::SECTOR_ERASE, addr)?;
        self.deselect()?;
        self.conn.delay(1);
        self.wait_idle()?;

        self.select()?;
        self.send_command(protocol::READ, addr)?;
        let value = self.receive()?;
        self.deselect()?;
        if value != 0xFF {
            log::warn!("Failed to erase {:#x}: read back {:#04x}", addr, value);
            return Err(Error::EraseVerifyFailed { addr, value });
        }
        Ok(())
    }

    pub fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        self.write_enable()?;
        self.select()?;
        self.send_command(protocol::PAGE_PROGRAM, addr)?;
        self.conn.write_block(protocol::TX, data)?;
        self.deselect()?;
        self.wait_idle()
    }

    pub fn read(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        self.select()?;
        self.send_command(protocol::READ, addr)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(self.receive()?);
        }
        self.deselect()?;
        Ok(data)
    }

    /// Lets the controller's checksum engine sum `len` flash bytes at `start`.
    pub fn checksum(&mut self, start: u32, len: u32) -> Result<u32, Error> {
        let variant = self.chip.variant();
        if len > variant.max_transfer_count {
            return Err(Error::Protocol(format!(
                "checksum length {:#x} exceeds {:#x}",
                len, variant.max_transfer_count
            )));
        }
        log::trace!("checksum {:#x}+{:#x}", start, len);
        self.select()?;
        self.send_command(protocol::DUAL_READ, start)?;
        self.conn.write_register(protocol::DUAL_RX, 0x01, 1)?;
        self.send(&[protocol::DUMMY])?;
        self.conn
            .write_register(protocol::RECEIVE_COUNT, len, variant.receive_count_width())?;
        self.chip.arm_checksum_engine(self.conn)?;
        self.conn.write_register(protocol::RX, 0xFF, 1)?;

        let chip = self.chip;
        let polled = self.conn.poll(
            "checksum engine",
            protocol::CHECKSUM_POLL_TRIES,
            1,
            |c| chip.checksum_done(c),
        );
        let deselect = self.deselect();
        polled.and(deselect)?;

        self.conn.write_register(protocol::DUAL_RX, 0x00, 1)?;
        self.conn.read_register(match self.mode {
            VerifyMode::Crc32 => protocol::CRC_RESULT,
            VerifyMode::Checksum => protocol::CHECKSUM_RESULT,
        })
    }
}

impl CrcProbe for FlashCtrl<'_> {
    fn hardware_crc(&mut self, start: u32, len: u32) -> Result<u32, Error> {
        self.checksum(start, len)
    }

    fn read_flash(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        self.read(addr, len)
    }
}

mod protocol {
    pub const CS: u32 = 0x041000;
    pub const CS_LOW: u32 = 0x0;
    pub const CS_HIGH: u32 = 0x1;
    pub const DUAL_RX: u32 = 0x041003;
    pub const KEY: u32 = 0x041004;
    pub const KEY_VALUE: u32 = 0x66aa55;
    pub const TX: u32 = 0x041008;
    pub const RECEIVE_COUNT: u32 = 0x04100C;
    pub const RX: u32 = 0x041010;
    pub const CHECKSUM_RESULT: u32 = 0x041018;
    pub const CRC_RESULT: u32 = 0x04101C;

    pub const WRITE_STATUS: u8 = 0x01;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const READ: u8 = 0x03;
    pub const READ_STATUS: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const DUAL_READ: u8 = 0x3B;
    pub const DUMMY: u8 = 0xFF;

    pub const STATUS_BUSY: u8 = 0x03;
    pub const BUSY_POLL_TRIES: u32 = 300;
    pub const BUSY_POLL_INTERVAL_MS: u64 = 1;
    pub const CHECKSUM_POLL_TRIES: u32 = 500;
}
