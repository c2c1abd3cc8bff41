//! Wire formats for the Readout Unit control link.
//!
//! The downlink carries 32-bit single-word transactions (SWT) addressed to a wishbone module and
//! register, the uplink answers every read with an echo of `(module, address)` plus 16 bits of
//! data. Trigger frames travel on a separate stream and are encoded here too.

pub mod trigger;
pub mod word;

pub use trigger::{
    TriggerBit,
    TriggerFrame,
    TriggerType,
};
pub use word::{
    Reply,
    Swt,
    TransactionIds,
};

/// Number of reply records the uplink FIFO can hold
pub const FIFO_DEPTH: usize = 256;

/// Largest module id that fits in the 7-bit module field
pub const MAX_MODULE_ID: u8 = 0x7F;

/// Errors that can be thrown while encoding or decoding link words
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Module id {0:#04x} does not fit in 7 bits")]
    InvalidModule(u8),
    #[error("Bunch crossing {0:#x} does not fit in 12 bits")]
    BunchCrossing(u16),
    #[error("Not enough bytes in the payload: expected {expected}, got {got}")]
    Incomplete { expected: usize, got: usize },
}
