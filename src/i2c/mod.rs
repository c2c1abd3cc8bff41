//! Indirect I2C masters of the Readout Unit.
//!
//! A write to one of their registers starts an I2C transaction on the board. The Power Unit buses
//! answer reads through a FIFO tagged with a software chosen transaction id; the GBTx bus answers
//! directly and reports its health through a counter monitor.

pub mod gbtx;
pub mod gbtx_bridge;
pub mod pu;

pub use gbtx::Gbtx;
pub use gbtx_bridge::GbtxBridge;
pub use pu::{
    I2cBridge,
    PuBus,
};
