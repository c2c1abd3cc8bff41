//! Register-mapped firmware modules of the Readout Unit

pub mod alpide_control;
pub mod calibration_lane;
pub mod clock_health;
pub mod data_lane;
pub mod gbt_packer;
pub mod gpio;
pub mod gth;
pub mod identity;
pub mod monitor;
pub mod readout_master;
pub mod wait;
