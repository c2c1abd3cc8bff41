//! # rucontrol
//!
//! Control-plane core for Readout Unit boards: the wishbone master proxy that speaks single-word
//! transactions over the control link, the register-mapped firmware modules, the I2C bridges to
//! the Power Unit and the GBTx chips, the trigger handler and sequencer, the Power Unit controller
//! with its interlocks and voltage-drop compensation, and the bring-up orchestrator that ties them
//! together.
//!
//! Every module holds a weak handle to the [`master::WishboneMaster`] of its channel, so one
//! [`bringup::ReadoutUnit`] owns the link and all register objects borrow it.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bringup;
pub mod core;
pub mod error;
pub mod i2c;
pub mod master;
pub mod modules;
pub mod power;
pub mod prelude;
pub mod transport;
pub mod trigger;

pub use crate::{
    core::{
        Address,
        ModuleId,
        RegisterMap,
    },
    error::{
        Error,
        Result,
    },
};
