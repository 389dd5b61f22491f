//! Byte transports the chip is reached through.
//!
//! The upgrade engine only needs plain writes and reads addressed to the
//! controller. [`I2cBus`] and [`SpiBus`] adapt `embedded-hal` devices to that
//! shape; anything else can implement [`Bus`] directly.

use crate::checksum::packet_checksum;
use byteorder::{BigEndian, ByteOrder};
use embedded_hal::i2c::{self, I2c};
use embedded_hal::spi::{self, Operation, SpiDevice};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("i2c: {0:?}")]
    I2c(i2c::ErrorKind),
    #[error("spi: {0:?}")]
    Spi(spi::ErrorKind),
    #[error("transfer of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },
    #[error("bus lock poisoned")]
    Poisoned,
    #[error("chip answered {0:#04x} instead of the recovery marker")]
    RecoveryMarker(u8),
    #[error("{0} not ready")]
    NotReady(&'static str),
    #[error("{0}")]
    Other(String),
}

pub trait Bus {
    fn write(&mut self, slave: u8, bytes: &[u8]) -> Result<(), BusError>;
    fn read(&mut self, slave: u8, len: usize) -> Result<Vec<u8>, BusError>;

    /// Write `tx` then read `rx_len` bytes back.
    fn transfer(&mut self, slave: u8, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, BusError> {
        self.write(slave, tx)?;
        self.read(slave, rx_len)
    }

    /// Sends the ICE enable `frame`. Transports with their own handshake
    /// override this.
    fn enter_ice(&mut self, slave: u8, frame: &[u8]) -> Result<(), BusError> {
        self.write(slave, frame)
    }

    /// Called once the chip has left ICE mode.
    fn exit_ice(&mut self, _slave: u8) -> Result<(), BusError> {
        Ok(())
    }
}

impl<B: Bus + ?Sized> Bus for Box<B> {
    fn write(&mut self, slave: u8, bytes: &[u8]) -> Result<(), BusError> {
        (**self).write(slave, bytes)
    }

    fn read(&mut self, slave: u8, len: usize) -> Result<Vec<u8>, BusError> {
        (**self).read(slave, len)
    }

    fn transfer(&mut self, slave: u8, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, BusError> {
        (**self).transfer(slave, tx, rx_len)
    }

    fn enter_ice(&mut self, slave: u8, frame: &[u8]) -> Result<(), BusError> {
        (**self).enter_ice(slave, frame)
    }

    fn exit_ice(&mut self, slave: u8) -> Result<(), BusError> {
        (**self).exit_ice(slave)
    }
}

pub struct I2cBus<T> {
    i2c: T,
}

impl<T: I2c> I2cBus<T> {
    pub fn new(i2c: T) -> Self {
        I2cBus { i2c }
    }

    pub fn into_inner(self) -> T {
        self.i2c
    }
}

impl<T: I2c> Bus for I2cBus<T> {
    fn write(&mut self, slave: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.i2c
            .write(slave, bytes)
            .map_err(|e| BusError::I2c(i2c::Error::kind(&e)))
    }

    fn read(&mut self, slave: u8, len: usize) -> Result<Vec<u8>, BusError> {
        let mut buf = vec![0u8; len];
        self.i2c
            .read(slave, &mut buf)
            .map_err(|e| BusError::I2c(i2c::Error::kind(&e)))?;
        Ok(buf)
    }
}

/// First byte of every SPI transaction, selecting the transfer direction.
pub const SPI_WRITE: u8 = 0x82;
pub const SPI_READ: u8 = 0x83;

/// Controller-side DMA limit for one SPI segment.
pub const SPI_MAX_CHUNK: usize = 1024;
/// Largest transfer the controller buffers accept at all.
pub const SPI_MAX_TRANSFER: usize = 64 * 1024;

/// Reply to a bare write header when the chip is ready to switch to ICE mode.
pub const SPI_RECOVERY_MARKER: u8 = 0xA3;

const SPI_ICE_ENABLE: u8 = 0x1F;
const SPI_ICE_DISABLE: u8 = 0x1B;
const SPI_ICE_ADDR: [u8; 3] = [0x62, 0x10, 0x18];

// Outside ICE mode command packets go through a locked mailbox.
mod mailbox {
    pub const WRITE: [u8; 4] = [0x25, 0x04, 0x00, 0x02];
    pub const WRITE_LOCK: [u8; 4] = [0x25, 0x00, 0x00, 0x02];
    pub const READ: [u8; 4] = [0x25, 0x98, 0x00, 0x02];
    pub const READ_LOCK: [u8; 4] = [0x25, 0x94, 0x00, 0x02];
    pub const WRITE_LOCK_KEY: [u8; 2] = [0x5A, 0xA5];
    pub const READ_UNLOCK_KEY: [u8; 2] = [0x98, 0x81];
    pub const RX_READY: u16 = 0x5AA5;
    pub const TX_FREE: u16 = 0x9881;
    pub const TRIES: u32 = 100;
}

fn spi_err<E: spi::Error>(e: E) -> BusError {
    BusError::Spi(e.kind())
}

struct SpiShared<D> {
    dev: D,
    ice: bool,
}

impl<D: SpiDevice> SpiShared<D> {
    fn write_frame(&mut self, bytes: &[u8], max_chunk: usize) -> Result<(), BusError> {
        let mut frame = Vec::with_capacity(bytes.len() + 1);
        frame.push(SPI_WRITE);
        frame.extend_from_slice(bytes);
        let mut ops: Vec<Operation<'_, u8>> =
            frame.chunks(max_chunk).map(Operation::Write).collect();
        self.dev.transaction(&mut ops).map_err(spi_err)
    }

    fn read_frame(&mut self, len: usize, max_chunk: usize) -> Result<Vec<u8>, BusError> {
        let mut buf = vec![0u8; len];
        {
            let header = [SPI_READ];
            let mut ops: Vec<Operation<'_, u8>> = vec![Operation::Write(&header)];
            ops.extend(buf.chunks_mut(max_chunk).map(Operation::Read));
            self.dev.transaction(&mut ops).map_err(spi_err)?;
        }
        Ok(buf)
    }

    fn ice_enable(&mut self, addr: &[u8]) -> Result<(), BusError> {
        let mut marker = [0u8];
        self.dev
            .transaction(&mut [Operation::Write(&[SPI_WRITE]), Operation::Read(&mut marker)])
            .map_err(spi_err)?;
        if marker[0] != SPI_RECOVERY_MARKER {
            log::warn!("recovery marker check failed ({:#04x})", marker[0]);
            return Err(BusError::RecoveryMarker(marker[0]));
        }
        let mut frame = vec![SPI_ICE_ENABLE];
        frame.extend_from_slice(addr);
        self.write_frame(&frame, usize::MAX)
    }

    fn ice_disable(&mut self) -> Result<(), BusError> {
        let mut frame = vec![SPI_ICE_DISABLE];
        frame.extend_from_slice(&SPI_ICE_ADDR);
        self.write_frame(&frame, usize::MAX)
    }

    /// Polls the mailbox status word behind `select` until its low half reads
    /// `expect`, then returns the high half.
    fn wait_mailbox(
        &mut self,
        select: &[u8],
        expect: u16,
        what: &'static str,
    ) -> Result<u16, BusError> {
        for _ in 0..mailbox::TRIES {
            self.write_frame(select, usize::MAX)?;
            let status = self.read_frame(4, usize::MAX)?;
            if BigEndian::read_u16(&status[2..]) == expect {
                return Ok(BigEndian::read_u16(&status[..2]));
            }
            sleep(Duration::from_millis(1));
        }
        log::warn!("{} not ready after {} tries", what, mailbox::TRIES);
        Err(BusError::NotReady(what))
    }

    fn locked_write(&mut self, data: &[u8], max_chunk: usize) -> Result<(), BusError> {
        let size = data.len() + 1;
        let size = u16::try_from(size).map_err(|_| BusError::TooLong {
            len: size,
            max: usize::from(u16::MAX),
        })?;
        self.ice_enable(&SPI_ICE_ADDR)?;

        let mut frame = mailbox::WRITE.to_vec();
        frame.extend_from_slice(data);
        frame.push(packet_checksum(data));
        while (frame.len() - mailbox::WRITE.len()) % 4 != 0 {
            frame.push(0);
        }
        self.write_frame(&frame, max_chunk)?;

        let mut lock = mailbox::WRITE_LOCK.to_vec();
        lock.extend_from_slice(&size.to_be_bytes());
        lock.extend_from_slice(&mailbox::WRITE_LOCK_KEY);
        self.write_frame(&lock, usize::MAX)?;

        let result = self
            .wait_mailbox(&mailbox::WRITE_LOCK, mailbox::TX_FREE, "tx mailbox")
            .map(|_| ());
        let disable = self.ice_disable();
        result.and(disable)
    }

    fn unlocked_read(&mut self, max_chunk: usize) -> Result<Vec<u8>, BusError> {
        self.ice_enable(&SPI_ICE_ADDR)?;
        let size = self.wait_mailbox(&mailbox::READ_LOCK, mailbox::RX_READY, "rx mailbox")?;

        self.write_frame(&mailbox::READ, usize::MAX)?;
        let data = self.read_frame(usize::from(size), max_chunk)?;

        let mut unlock = mailbox::READ_LOCK.to_vec();
        unlock.extend_from_slice(&size.to_be_bytes());
        unlock.extend_from_slice(&mailbox::READ_UNLOCK_KEY);
        self.write_frame(&unlock, usize::MAX)?;
        self.ice_disable()?;
        Ok(data)
    }

    fn write(&mut self, bytes: &[u8], max_chunk: usize) -> Result<(), BusError> {
        if self.ice {
            self.write_frame(bytes, max_chunk)
        } else {
            self.locked_write(bytes, max_chunk)
        }
    }

    fn read(&mut self, len: usize, max_chunk: usize) -> Result<Vec<u8>, BusError> {
        if self.ice {
            self.read_frame(len, max_chunk)
        } else {
            self.unlocked_read(max_chunk)
        }
    }
}

/// SPI transport. Long transfers are split into `max_chunk` segments inside a
/// single chip-select assertion.
///
/// The device sits behind a mutex so clones of this handle can be shared with
/// other users of the same bus. The lock is held for one `write`, `read` or
/// `transfer`, so a register read selected by [`Bus::transfer`] cannot be
/// split by another user. Outside ICE mode writes and reads go through the
/// chip's locked mailbox instead of raw frames.
pub struct SpiBus<D> {
    shared: Arc<Mutex<SpiShared<D>>>,
    max_chunk: usize,
}

impl<D> Clone for SpiBus<D> {
    fn clone(&self) -> Self {
        SpiBus {
            shared: self.shared.clone(),
            max_chunk: self.max_chunk,
        }
    }
}

impl<D: SpiDevice> SpiBus<D> {
    pub fn new(dev: D) -> Self {
        Self::with_chunk(dev, SPI_MAX_CHUNK)
    }

    pub fn with_chunk(dev: D, max_chunk: usize) -> Self {
        SpiBus {
            shared: Arc::new(Mutex::new(SpiShared { dev, ice: false })),
            max_chunk: max_chunk.max(1),
        }
    }

    fn check_len(len: usize) -> Result<(), BusError> {
        if len > SPI_MAX_TRANSFER {
            return Err(BusError::TooLong {
                len,
                max: SPI_MAX_TRANSFER,
            });
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SpiShared<D>>, BusError> {
        self.shared.lock().map_err(|_| BusError::Poisoned)
    }
}

impl<D: SpiDevice> Bus for SpiBus<D> {
    fn write(&mut self, _slave: u8, bytes: &[u8]) -> Result<(), BusError> {
        Self::check_len(bytes.len())?;
        self.lock()?.write(bytes, self.max_chunk)
    }

    fn read(&mut self, _slave: u8, len: usize) -> Result<Vec<u8>, BusError> {
        Self::check_len(len)?;
        self.lock()?.read(len, self.max_chunk)
    }

    fn transfer(&mut self, _slave: u8, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, BusError> {
        Self::check_len(tx.len())?;
        Self::check_len(rx_len)?;
        let mut shared = self.lock()?;
        shared.write(tx, self.max_chunk)?;
        shared.read(rx_len, self.max_chunk)
    }

    /// SPI uses its own enable command (`0x1F`) in front of the ICE address
    /// carried by `frame`, after the recovery marker check.
    fn enter_ice(&mut self, _slave: u8, frame: &[u8]) -> Result<(), BusError> {
        let addr = frame
            .get(1..4)
            .ok_or_else(|| BusError::Other("short ICE enable frame".into()))?;
        let mut shared = self.lock()?;
        shared.ice_enable(addr)?;
        shared.ice = true;
        Ok(())
    }

    fn exit_ice(&mut self, _slave: u8) -> Result<(), BusError> {
        self.lock()?.ice = false;
        Ok(())
    }
}
