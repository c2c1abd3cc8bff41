//! Error taxonomy of the control core

use packed_struct::PackingError;

/// Errors surfaced by register access, the I2C bridges and the Power Unit
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Transport failure: {0}")]
    Transport(String),
    #[error("No reply from module {module:#04x} address {addr:#04x} after {retries} attempts")]
    Timeout { module: u8, addr: u8, retries: usize },
    #[error("Transaction id mismatch: expected {expected:#06x}, found {found:#06x}")]
    TransactionIdMismatch { expected: u16, found: u16 },
    #[error("Illegal address {addr:#04x} in module {module:#04x}")]
    IllegalAddress { module: u8, addr: u8 },
    #[error("Illegal access to module {module:#04x} address {addr:#04x}")]
    IllegalAccess { module: u8, addr: u8 },
    #[error("I2C transaction failed: completed bytes {completed}, arbitration lost {al}, noack {noack}")]
    I2cBadStatus { completed: u32, al: u32, noack: u32 },
    #[error("Interlock fired, tripped flags {0:#04x}")]
    InterlockFired(u16),
    #[error("Calibration missing: {0}")]
    CalibrationMissing(String),
    #[error("Hardware inconsistency: {0}")]
    HardwareInconsistency(String),
    #[error("The channel to the board has been closed")]
    ChannelClosed,
    #[error("Value out of range: {0}")]
    OutOfRange(String),
    #[error("Precondition not met: {0}")]
    Precondition(String),
    #[error("Register packing failed: {0:?}")]
    Packing(PackingError),
    #[error(transparent)]
    Codec(#[from] swt::Error),
    #[error(transparent)]
    Config(#[from] ru_utils::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<PackingError> for Error {
    fn from(e: PackingError) -> Self {
        Error::Packing(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns an [`Error::OutOfRange`] unless `cond` holds
macro_rules! ensure_range {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::OutOfRange(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_range;
