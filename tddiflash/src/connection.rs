//! ICE-mode register access.
//!
//! While the controller is in ICE mode every internal register and RAM byte is
//! reachable through one frame shape: `0x25`, a 24-bit little-endian address,
//! then the payload. A frame without payload selects the address for the next
//! bus read.

use crate::bus::{Bus, BusError};
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};
use deku::prelude::*;
use std::thread::sleep;
use std::time::Duration;

pub const ICE_CMD: u8 = 0x25;

const EXIT_ICE_KEY_ADDR: u32 = 0x04004C;
const EXIT_ICE_KEY: u32 = 0x2120;
const EXIT_ICE_RESET_ADDR: u32 = 0x04004E;

#[derive(Debug, DekuWrite)]
#[deku(magic = b"\x25", endian = "little")]
pub struct IceFrame {
    #[deku(bytes = "3")]
    pub addr: u32,
    pub payload: Vec<u8>,
}

pub struct Connection {
    bus: Box<dyn Bus>,
    slave: u8,
    reset_in_progress: bool,
}

impl Connection {
    pub fn new(bus: impl Bus + 'static, slave: u8) -> Self {
        Connection {
            bus: Box::new(bus),
            slave,
            reset_in_progress: false,
        }
    }

    pub fn into_inner(self) -> Box<dyn Bus> {
        self.bus
    }

    pub fn slave(&self) -> u8 {
        self.slave
    }

    pub fn delay(&self, ms: u64) {
        sleep(Duration::from_millis(ms));
    }

    /// Runs `f` while the chip is expected to drop off the bus. Write errors
    /// inside `f` are logged and swallowed; every other failure still
    /// propagates.
    pub fn with_reset_in_progress<T, F: FnMut(&mut Connection) -> Result<T, Error>>(
        &mut self,
        mut f: F,
    ) -> Result<T, Error> {
        let old = self.reset_in_progress;
        self.reset_in_progress = true;
        let result = f(self);
        self.reset_in_progress = old;
        result
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.bus.write(self.slave, buf) {
            Ok(()) => Ok(()),
            Err(e) if self.reset_in_progress => {
                log::debug!("ignoring bus error during reset: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let read = self.bus.read(self.slave, len);
        self.check_read(read, len)
    }

    /// Writes `req` and reads `len` bytes back as one bus transfer.
    pub fn transfer(&mut self, req: &[u8], len: usize) -> Result<Vec<u8>, Error> {
        let read = self.bus.transfer(self.slave, req, len);
        self.check_read(read, len)
    }

    fn check_read(
        &self,
        read: Result<Vec<u8>, BusError>,
        len: usize,
    ) -> Result<Vec<u8>, Error> {
        let buf = match read {
            Ok(buf) => buf,
            Err(e) if self.reset_in_progress => {
                log::debug!("ignoring bus error during reset: {}", e);
                return Ok(vec![0; len]);
            }
            Err(e) => return Err(e.into()),
        };
        if buf.len() != len {
            return Err(Error::Protocol(format!(
                "short read: wanted {} bytes, got {}",
                len,
                buf.len()
            )));
        }
        Ok(buf)
    }

    fn to_frame(addr: u32, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let frame = IceFrame {
            addr: addr & 0x00FF_FFFF,
            payload: payload.to_vec(),
        };
        Ok(frame.to_bytes()?)
    }

    pub fn enter_ice_mode(&mut self, ice_addr: u32) -> Result<(), Error> {
        log::debug!("enter ICE mode");
        let req = Self::to_frame(ice_addr, &[])?;
        self.bus
            .enter_ice(self.slave, &req)
            .map_err(|e| Error::Protocol(format!("failed to enter ICE mode: {}", e)))
    }

    pub fn exit_ice_mode(&mut self) -> Result<(), Error> {
        log::debug!("exit ICE mode");
        self.write_register(EXIT_ICE_KEY_ADDR, EXIT_ICE_KEY, 2)
            .map_err(|e| Error::Protocol(format!("failed to exit ICE mode: {}", e)))?;
        self.delay(10);
        self.with_reset_in_progress(|c| c.write_register(EXIT_ICE_RESET_ADDR, 0x01, 1))?;
        self.delay(50);
        self.bus.exit_ice(self.slave)?;
        Ok(())
    }

    /// Writes the low `width` bytes of `data`, little-endian.
    pub fn write_register(&mut self, addr: u32, data: u32, width: usize) -> Result<(), Error> {
        if !(1..=4).contains(&width) {
            return Err(Error::Protocol(format!(
                "register write width {} at {:#x}",
                width, addr
            )));
        }
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, data);
        log::trace!("ice write {:#08x} <- {:#x} ({})", addr, data, width);
        let req = Self::to_frame(addr, &bytes[..width])?;
        self.write_all(&req)
    }

    pub fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        let req = Self::to_frame(addr, data)?;
        self.write_all(&req)
    }

    pub fn read_block(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, Error> {
        let req = Self::to_frame(addr, &[])?;
        self.transfer(&req, len)
    }

    pub fn read_one_byte(&mut self, addr: u32) -> Result<u8, Error> {
        Ok(self.read_block(addr, 1)?[0])
    }

    pub fn read_register(&mut self, addr: u32) -> Result<u32, Error> {
        let data = self.read_block(addr, 4)?;
        let value = LittleEndian::read_u32(&data);
        log::trace!("ice read {:#08x} -> {:#x}", addr, value);
        Ok(value)
    }

    /// Calls `f` up to `max_tries` times, sleeping `interval_ms` before each
    /// attempt, until it reports completion.
    pub fn poll<F: FnMut(&mut Connection) -> Result<bool, Error>>(
        &mut self,
        what: &'static str,
        max_tries: u32,
        interval_ms: u64,
        mut f: F,
    ) -> Result<(), Error> {
        for _ in 0..max_tries {
            self.delay(interval_ms);
            if f(self)? {
                return Ok(());
            }
        }
        log::warn!("{} did not complete after {} tries", what, max_tries);
        Err(Error::Timeout(what))
    }

    /// Waits for every bit of `mask` in the byte at `status_addr` to clear.
    pub fn poll_until_idle(
        &mut self,
        status_addr: u32,
        mask: u8,
        max_tries: u32,
        interval_ms: u64,
    ) -> Result<(), Error> {
        self.poll("status register idle", max_tries, interval_ms, |c| {
            Ok(c.read_one_byte(status_addr)? & mask == 0)
        })
    }
}
