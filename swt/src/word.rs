//! Single-word transactions and their uplink replies

use crate::{
    Error,
    MAX_MODULE_ID,
};
use std::time::{
    SystemTime,
    UNIX_EPOCH,
};
use tracing::trace;

const WRITE_FLAG: u8 = 0x80;
const ERROR_FLAG: u16 = 0x8000;

/// A single 32-bit wishbone transaction on the downlink
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Swt {
    /// Target wishbone module, 7 bits
    pub module: u8,
    /// Register address inside the module
    pub addr: u8,
    /// Payload, ignored by the slave for reads
    pub data: u16,
    /// `true` for a write, `false` for a read
    pub write: bool,
}

impl Swt {
    /// Builds a write transaction
    /// # Errors
    /// Returns an error if `module` doesn't fit in the module field
    pub fn write(module: u8, addr: u8, data: u16) -> Result<Self, Error> {
        Self::check_module(module)?;
        Ok(Self {
            module,
            addr,
            data,
            write: true,
        })
    }

    /// Builds a read transaction
    /// # Errors
    /// Returns an error if `module` doesn't fit in the module field
    pub fn read(module: u8, addr: u8) -> Result<Self, Error> {
        Self::check_module(module)?;
        Ok(Self {
            module,
            addr,
            data: 0,
            write: false,
        })
    }

    fn check_module(module: u8) -> Result<(), Error> {
        if module > MAX_MODULE_ID {
            return Err(Error::InvalidModule(module));
        }
        Ok(())
    }

    /// Wire representation: `[data_lo, data_hi, addr, rd_nwr << 7 | module]`
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        let [lo, hi] = self.data.to_le_bytes();
        let flag = if self.write { WRITE_FLAG } else { 0 };
        [lo, hi, self.addr, flag | self.module]
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            module: bytes[3] & MAX_MODULE_ID,
            addr: bytes[2],
            data: u16::from_le_bytes([bytes[0], bytes[1]]),
            write: bytes[3] & WRITE_FLAG == WRITE_FLAG,
        }
    }

    /// The `(module, address)` word the slave echoes back for this transaction
    #[must_use]
    pub fn echo(&self) -> u16 {
        (u16::from(self.module) << 8) | u16::from(self.addr)
    }
}

/// A reply to a read transaction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Reply {
    pub module: u8,
    pub addr: u8,
    pub data: u16,
    /// Set by the slave when the read could not be served
    pub error: bool,
}

impl Reply {
    #[must_use]
    pub fn new(module: u8, addr: u8, data: u16) -> Self {
        Self {
            module: module & MAX_MODULE_ID,
            addr,
            data,
            error: false,
        }
    }

    /// Builds an error reply, `data` carries the slave's error code
    #[must_use]
    pub fn error(module: u8, addr: u8, data: u16) -> Self {
        Self {
            error: true,
            ..Self::new(module, addr, data)
        }
    }

    /// The echoed `(module, address)` word, without the error flag
    #[must_use]
    pub fn echo(&self) -> u16 {
        (u16::from(self.module) << 8) | u16::from(self.addr)
    }

    /// Wire representation: little-endian echo word (error flag in bit 15) then data
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 4] {
        let flag = if self.error { ERROR_FLAG } else { 0 };
        let [e0, e1] = (self.echo() | flag).to_le_bytes();
        let [d0, d1] = self.data.to_le_bytes();
        [e0, e1, d0, d1]
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        let echo = u16::from_le_bytes([bytes[0], bytes[1]]);
        let data = u16::from_le_bytes([bytes[2], bytes[3]]);
        let reply = Self {
            module: ((echo >> 8) as u8) & MAX_MODULE_ID,
            addr: (echo & 0xFF) as u8,
            data,
            error: echo & ERROR_FLAG == ERROR_FLAG,
        };
        trace!(echo, data, "Decoded reply");
        reply
    }
}

/// Per-channel source of 15-bit transaction ids derived from the microsecond clock.
///
/// Two consecutive ids are never equal, so a stale FIFO entry can't be mistaken for the reply to a
/// freshly issued transaction.
#[derive(Debug, Default)]
pub struct TransactionIds {
    last: Option<u16>,
}

impl TransactionIds {
    const MASK: u16 = 0x7FFF;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out the next id
    pub fn next_id(&mut self) -> u16 {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        let mut id = (micros & u128::from(Self::MASK)) as u16;
        if Some(id) == self.last {
            id = id.wrapping_add(1) & Self::MASK;
        }
        self.last = Some(id);
        id
    }
}
