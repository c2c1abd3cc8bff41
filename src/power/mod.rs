//! Power subsystem: the Power Unit on each of the two connectors and the firmware controller
//! that mirrors its readings and enforces the interlocks.

pub mod compensation;
pub mod controller;
pub mod conversions;
pub mod power_unit;
pub mod topology;

pub use compensation::{
    AdjustReport,
    CableModel,
    OffsetEstimate,
    PowerBusModel,
};
pub use controller::{
    BiasAdc,
    ModuleAdc,
    PuController,
    TemperatureLimit,
};
pub use conversions::{
    Conversions,
    PowerUnitVersion,
    RtdSensor,
};
pub use power_unit::{
    PowerSetup,
    PowerUnit,
    PowerValues,
    Rail,
};
pub use topology::{
    InterlockTopology,
    TrippedBit,
    TrippedFlags,
};

/// Highest AVDD set-point ever written, in volts
pub const MAX_AVDD: f64 = 2.30;
/// Highest DVDD set-point ever written, in volts
pub const MAX_DVDD: f64 = 2.40;
/// Highest AVDD used when returning to uncompensated voltages
pub const MAX_AVDD_RESET: f64 = 1.82;
/// Highest DVDD used when returning to uncompensated voltages
pub const MAX_DVDD_RESET: f64 = 1.82;
/// Current limit of one channel, in amps
pub const MAX_CURRENT: f64 = 3.0;
/// Most negative back-bias, in volts
pub const MIN_BB_VOLTAGE: f64 = -4.5;
/// Bias DAC set-point used when no back-bias is requested
pub const IDLE_BB_VOLTAGE: f64 = -3.0;
/// Modules one Power Unit can feed
pub const MODULES: u8 = 8;
/// Temperatures above this, in °C, mean the PT100 is not connected
pub const PT100_DISCONNECTED: f64 = 720.0;
