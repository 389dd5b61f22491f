use crate::bus::BusError;
use crate::image::BlockKind;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("unexpected response from chip: {0}")]
    Protocol(String),
    #[error("timeout while waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid firmware image: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("verify failed at {start:#x}+{len:#x}: expected {expected:#010x}, chip reports {actual:#010x}")]
    VerifyFailed {
        start: u32,
        len: u32,
        expected: u32,
        actual: u32,
    },
    #[error("erase failed at {addr:#x}: read back {value:#04x}")]
    EraseVerifyFailed { addr: u32, value: u8 },
    #[error("upgrade check failed: {0}")]
    CheckFailed(Box<Error>),
    #[error("an upgrade is already in progress")]
    Busy,
    #[error("unknown chip {0}")]
    UnrecognizedChip(String),
    #[error("Parse toml error")]
    TomlError(#[from] toml::de::Error),
    #[error("encode error: {0}")]
    Deku(#[from] deku::DekuError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("image is empty")]
    Empty,
    #[error("line {line}: record does not start with ':'")]
    MissingColon { line: usize },
    #[error("line {line}: invalid hex digit")]
    InvalidHex { line: usize },
    #[error("line {line}: record is truncated")]
    Truncated { line: usize },
    #[error("line {line}: checksum mismatch, record says {expected:#04x}, computed {actual:#04x}")]
    Checksum {
        line: usize,
        expected: u8,
        actual: u8,
    },
    #[error("address {addr:#x} is beyond the maximum image size {max:#x}")]
    AddressOutOfRange { addr: u32, max: u32 },
    #[error("more than {0} block descriptors")]
    TooManyBlocks(usize),
    #[error("block {start:#x}..={end:#x} ends before it starts")]
    InvalidBlock { start: u32, end: u32 },
    #[error("second {0} block descriptor")]
    DuplicateBlock(BlockKind),
    #[error("block {start:#x}..={end:#x} overlaps the block at {other:#x}")]
    OverlappingBlock { start: u32, end: u32, other: u32 },
    #[error("binary image shorter than its {0} byte header")]
    ShortHeader(usize),
}

/// Which kind of failure ended a flash or download run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    Io,
    Protocol,
    Timeout,
    EraseVerifyFailed,
    VerifyFailed,
    CheckFailed,
    Config,
    Other,
}

impl Error {
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            Error::Bus(_) | Error::IO(_) => AbortReason::Io,
            Error::Protocol(_) | Error::Deku(_) => AbortReason::Protocol,
            Error::Timeout(_) => AbortReason::Timeout,
            Error::EraseVerifyFailed { .. } => AbortReason::EraseVerifyFailed,
            Error::VerifyFailed { .. } => AbortReason::VerifyFailed,
            Error::CheckFailed(_) => AbortReason::CheckFailed,
            Error::Config(_) => AbortReason::Config,
            _ => AbortReason::Other,
        }
    }
}

/// Step of an upgrade a failure is attributed to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Load,
    Parse,
    MaintenanceMode,
    Watchdog,
    Check,
    Erase,
    Program,
    Reset,
    Verify,
    Download,
    Refresh,
}

impl Phase {
    /// Negative value published in the progress counter when this phase fails.
    pub fn code(self) -> i32 {
        match self {
            Phase::Load => -1,
            Phase::Parse => -2,
            Phase::MaintenanceMode => -3,
            Phase::Watchdog => -4,
            Phase::Check => -5,
            Phase::Erase => -6,
            Phase::Program => -7,
            Phase::Reset => -8,
            Phase::Verify => -9,
            Phase::Download => -10,
            Phase::Refresh => -11,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Load => "load",
            Phase::Parse => "parse",
            Phase::MaintenanceMode => "maintenance mode",
            Phase::Watchdog => "watchdog",
            Phase::Check => "upgrade check",
            Phase::Erase => "erase",
            Phase::Program => "program",
            Phase::Reset => "reset",
            Phase::Verify => "verify",
            Phase::Download => "host download",
            Phase::Refresh => "info refresh",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("upgrade failed during {phase}: {source}")]
pub struct UpgradeError {
    pub phase: Phase,
    #[source]
    pub source: Error,
}

impl UpgradeError {
    pub fn new(phase: Phase, source: Error) -> Self {
        UpgradeError { phase, source }
    }

    pub fn code(&self) -> i32 {
        self.phase.code()
    }
}
