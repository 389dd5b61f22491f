//! In-memory model of a TDDI controller reached in ICE mode: register space,
//! instruction RAM, the SPI flash behind the flash controller, the checksum
//! and DMA CRC engines, and the watchdog.

use crate::bus::{Bus, BusError};
use crate::checksum::{additive, crc32};
use crate::connection::{Connection, ICE_CMD};
use crate::session::{Monitor, Platform, RunningFirmware};
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

const ICE_ENTER: u32 = 0x181062;
const RAM_SIZE: usize = 0x40000;
const FLASH_SIZE: usize = 0x20000;
const SECTOR: usize = 0x1000;

pub struct SimState {
    pub ice: bool,
    pub ram: Vec<u8>,
    pub flash: Vec<u8>,
    regs: HashMap<u32, u8>,
    selected: Option<u32>,

    pub cs_low: bool,
    keyed: bool,
    tx: Vec<u8>,
    rx: u8,
    write_enabled: bool,
    busy_reads: u32,
    pub flash_status: u8,
    pub dual_rx: u8,

    pub watchdog_on: bool,
    wdt_armed: bool,
    pub events: Vec<SimEvent>,

    pub erased: Vec<u32>,
    pub programmed: Vec<u32>,
    pub ram_frames: usize,
    pub code_resets: usize,
    pub dma_runs: usize,

    pub erase_never_completes: bool,
    pub erase_leaves: Option<u8>,
    pub corrupt_program_at: Option<u32>,
    pub checksum_engine_dead: bool,
    pub dma_corrupt: bool,
    pub nak_code_reset: bool,
    pub watchdog_stuck: bool,
}

impl Default for SimState {
    fn default() -> Self {
        SimState {
            ice: false,
            ram: vec![0; RAM_SIZE],
            flash: vec![0xFF; FLASH_SIZE],
            regs: HashMap::new(),
            selected: None,
            cs_low: false,
            keyed: false,
            tx: Vec::new(),
            rx: 0,
            write_enabled: false,
            busy_reads: 0,
            flash_status: 0x1C,
            dual_rx: 0,
            watchdog_on: true,
            wdt_armed: false,
            events: Vec::new(),
            erased: Vec::new(),
            programmed: Vec::new(),
            ram_frames: 0,
            code_resets: 0,
            dma_runs: 0,
            erase_never_completes: false,
            erase_leaves: None,
            corrupt_program_at: None,
            checksum_engine_dead: false,
            dma_corrupt: false,
            nak_code_reset: false,
            watchdog_stuck: false,
        }
    }
}

/// Control-path events, in the order the chip saw them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimEvent {
    WatchdogDisabled,
    WatchdogEnabled,
    IceExit,
}

fn nak() -> BusError {
    BusError::Other("nak".into())
}

impl SimState {
    fn reg(&self, addr: u32) -> u8 {
        self.regs.get(&addr).copied().unwrap_or(0)
    }

    fn reg_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.reg(addr),
            self.reg(addr + 1),
            self.reg(addr + 2),
            self.reg(addr + 3),
        ])
    }

    fn set_u32(&mut self, addr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.regs.insert(addr + i as u32, *b);
        }
    }

    fn flash_addr(&self) -> usize {
        (usize::from(self.tx[1]) << 16) | (usize::from(self.tx[2]) << 8) | usize::from(self.tx[3])
    }

    fn status(&mut self) -> u8 {
        if self.erase_never_completes && self.busy_reads > 0 {
            return self.flash_status | 0x03;
        }
        if self.busy_reads > 0 {
            self.busy_reads -= 1;
            return self.flash_status | 0x01;
        }
        self.flash_status
    }

    /// True when the watchdog was switched back on explicitly before the
    /// last ICE exit, rather than by the reset that exit causes.
    pub fn watchdog_restored_before_exit(&self) -> bool {
        let exit = self.events.iter().rposition(|e| *e == SimEvent::IceExit);
        let enable = self.events.iter().rposition(|e| *e == SimEvent::WatchdogEnabled);
        let disable = self.events.iter().rposition(|e| *e == SimEvent::WatchdogDisabled);
        match (disable, enable, exit) {
            (Some(d), Some(en), Some(x)) => d < en && en < x,
            _ => false,
        }
    }

    fn reset(&mut self) {
        self.ice = false;
        self.watchdog_on = true;
        self.wdt_armed = false;
        self.cs_low = false;
        self.tx.clear();
        self.selected = None;
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), BusError> {
        if frame.len() < 4 || frame[0] != ICE_CMD {
            return Err(nak());
        }
        let addr = u32::from(frame[1]) | u32::from(frame[2]) << 8 | u32::from(frame[3]) << 16;
        let payload = &frame[4..];
        if payload.is_empty() {
            if addr == ICE_ENTER {
                self.ice = true;
                return Ok(());
            }
            if !self.ice {
                return Err(nak());
            }
            self.selected = Some(addr);
            return Ok(());
        }
        if !self.ice {
            return Err(nak());
        }
        if (addr as usize) < RAM_SIZE {
            let start = addr as usize;
            let end = (start + payload.len()).min(RAM_SIZE);
            self.ram[start..end].copy_from_slice(&payload[..end - start]);
            self.ram_frames += 1;
            return Ok(());
        }
        self.register_write(addr, payload)
    }

    fn register_write(&mut self, addr: u32, payload: &[u8]) -> Result<(), BusError> {
        let mut value = [0u8; 4];
        let n = payload.len().min(4);
        value[..n].copy_from_slice(&payload[..n]);
        let value = LittleEndian::read_u32(&value);

        match addr {
            0x041000 => {
                if value == 0 {
                    self.cs_low = true;
                    self.keyed = false;
                    self.tx.clear();
                } else {
                    self.cs_low = false;
                    self.execute();
                }
                return Ok(());
            }
            0x041004 => {
                self.keyed = value == 0x66aa55;
                return Ok(());
            }
            0x041008 => {
                if self.cs_low && self.keyed {
                    for &b in payload {
                        self.shift(b);
                    }
                }
                return Ok(());
            }
            0x041003 => self.dual_rx = payload[0],
            0x041010 => {
                if self.tx.first() == Some(&0x3B) && !self.checksum_engine_dead {
                    self.run_checksum();
                }
                return Ok(());
            }
            0x048007 | 0x048006 => {
                // write one to clear
                let cur = self.reg(addr);
                self.regs.insert(addr, cur & !payload[0]);
                return Ok(());
            }
            0x04004E if value & 0xFF == 0x01 && self.reg_u32(0x04004C) & 0xFFFF == 0x2120 => {
                self.events.push(SimEvent::IceExit);
                self.reset();
                return Err(nak());
            }
            0x040040 if value & 0xFF == 0xAE => {
                self.code_resets += 1;
                if self.nak_code_reset {
                    return Err(nak());
                }
                return Ok(());
            }
            0x5100C => {
                match value & 0xFF {
                    0x01 => {
                        self.watchdog_on = true;
                        self.events.push(SimEvent::WatchdogEnabled);
                    }
                    0x81 => self.wdt_armed = true,
                    0x98 if self.wdt_armed && !self.watchdog_stuck => {
                        self.watchdog_on = false;
                        self.events.push(SimEvent::WatchdogDisabled);
                    }
                    _ => {}
                }
                if value & 0xFF != 0x81 {
                    self.wdt_armed = false;
                }
                return Ok(());
            }
            0x072100 if value == 0x0100_0000 => {
                self.run_dma();
                return Ok(());
            }
            _ => {}
        }
        for (i, &b) in payload.iter().enumerate() {
            self.regs.insert(addr + i as u32, b);
        }
        Ok(())
    }

    /// One byte clocked out on the flash interface.
    fn shift(&mut self, byte: u8) {
        self.tx.push(byte);
        match self.tx[0] {
            0x05 if self.tx.len() >= 2 => self.rx = self.status(),
            0x03 if self.tx.len() >= 5 => {
                let at = self.flash_addr() + self.tx.len() - 5;
                self.rx = self.flash.get(at).copied().unwrap_or(0xFF);
            }
            _ => {}
        }
    }

    /// Command completed by raising chip select.
    fn execute(&mut self) {
        if !self.keyed || self.tx.is_empty() {
            return;
        }
        match self.tx[0] {
            0x06 => self.write_enabled = true,
            0x01 if self.write_enabled && self.tx.len() >= 2 => {
                self.flash_status = self.tx[1];
                self.write_enabled = false;
            }
            0x20 if self.write_enabled && self.tx.len() >= 4 => {
                let start = self.flash_addr() / SECTOR * SECTOR;
                let fill = self.erase_leaves.unwrap_or(0xFF);
                self.flash[start..start + SECTOR].iter_mut().for_each(|b| *b = fill);
                self.erased.push(start as u32);
                self.write_enabled = false;
                self.busy_reads = 2;
            }
            0x02 if self.write_enabled && self.tx.len() >= 4 => {
                let start = self.flash_addr();
                for (i, &b) in self.tx[4..].iter().enumerate() {
                    let at = start + i;
                    if at < FLASH_SIZE {
                        self.flash[at] &= b;
                    }
                }
                if let Some(bad) = self.corrupt_program_at {
                    let bad = bad as usize;
                    if (start..start + self.tx.len() - 4).contains(&bad) {
                        self.flash[bad] ^= 0x01;
                    }
                }
                self.programmed.push(start as u32);
                self.write_enabled = false;
                self.busy_reads = 1;
            }
            _ => {}
        }
    }

    fn run_checksum(&mut self) {
        let start = self.flash_addr();
        let count = (self.reg_u32(0x04100C) & 0xFF_FFFF) as usize;
        let end = (start + count).min(FLASH_SIZE);
        let data = &self.flash[start.min(end)..end];
        let (crc, sum) = (crc32(data), additive(data));
        self.set_u32(0x04101C, crc);
        self.set_u32(0x041018, sum);
        let flag = self.reg(0x048007);
        self.regs.insert(0x048007, flag | 0x02);
        let ctrl = self.reg(0x041014);
        self.regs.insert(0x041014, ctrl | 0x01);
    }

    fn run_dma(&mut self) {
        let start = self.reg_u32(0x072104) as usize;
        let size = self.reg_u32(0x07211C) as usize;
        let end = (start + size).min(RAM_SIZE);
        let mut crc = crc32(&self.ram[start.min(end)..end]);
        if self.dma_corrupt {
            crc ^= 1;
        }
        self.set_u32(0x04101C, crc);
        let flag = self.reg(0x048006);
        self.regs.insert(0x048006, flag | 0x01);
        self.dma_runs += 1;
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, BusError> {
        let addr = match self.selected.take() {
            Some(addr) if self.ice => addr,
            _ => return Err(nak()),
        };
        if addr == 0x041010 {
            return Ok(vec![self.rx; len]);
        }
        if addr == 0x51018 {
            return Ok(vec![if self.watchdog_on { 0x40 } else { 0x00 }; len]);
        }
        Ok((0..len as u32)
            .map(|i| {
                let at = addr + i;
                match self.ram.get(at as usize) {
                    Some(&b) => b,
                    None => self.reg(at),
                }
            })
            .collect())
    }
}

#[derive(Clone, Default)]
pub struct SimChip(Rc<RefCell<SimState>>);

impl SimChip {
    pub fn new() -> Self {
        SimChip::default()
    }

    pub fn state(&self) -> RefMut<'_, SimState> {
        self.0.borrow_mut()
    }

    pub fn connection(&self) -> Connection {
        Connection::new(self.clone(), 0x41)
    }

    /// Connection with the model already in ICE mode.
    pub fn ice_connection(&self) -> Connection {
        self.state().ice = true;
        self.connection()
    }
}

impl Bus for SimChip {
    fn write(&mut self, _slave: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.0.borrow_mut().write(bytes)
    }

    fn read(&mut self, _slave: u8, len: usize) -> Result<Vec<u8>, BusError> {
        self.0.borrow_mut().read(len)
    }
}

pub struct SimPlatform {
    chip: SimChip,
    pub irq: bool,
    pub running: RunningFirmware,
    pub suspended: Vec<Monitor>,
    pub resumed: Vec<Monitor>,
    pub resets: usize,
    pub refreshed: usize,
}

impl SimPlatform {
    pub fn new(chip: SimChip) -> Self {
        SimPlatform {
            chip,
            irq: true,
            running: RunningFirmware {
                version: [0, 0, 0, 1],
                protocol_major: 3,
            },
            suspended: Vec::new(),
            resumed: Vec::new(),
            resets: 0,
            refreshed: 0,
        }
    }
}

impl Platform for SimPlatform {
    fn reset(&mut self, _hold: bool) -> Result<(), Error> {
        self.resets += 1;
        self.chip.state().reset();
        Ok(())
    }

    fn set_irq(&mut self, enabled: bool) {
        self.irq = enabled;
    }

    fn suspend_monitor(&mut self, monitor: Monitor) -> bool {
        self.suspended.push(monitor);
        true
    }

    fn resume_monitor(&mut self, monitor: Monitor) {
        self.resumed.push(monitor);
    }

    fn running_firmware(&mut self) -> Result<RunningFirmware, Error> {
        Ok(self.running)
    }

    fn refresh_info(&mut self) -> Result<(), Error> {
        self.refreshed += 1;
        Ok(())
    }
}
