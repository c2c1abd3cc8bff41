//! Clock health status: jitter cleaner and timebase loss-of-lock flags with the timestamps of the
//! last event.

use crate::{
    core::{
        address,
        Address,
        ModuleHandle,
        RegisterMap,
    },
    error::Result,
    transport::Transport,
};
use packed_struct::prelude::*;
use tracing::warn;

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum ClockHealthRegister {
    ResetClockHealthFlags = 0x00,
    ConfigReset = 0x01,
    ClockHealthFlags = 0x02,
    TimebaseEventTimestampUptimeLsb = 0x03,
    TimebaseEventTimestampUptimeCsb = 0x04,
    TimebaseEventTimestampUptimeMsb = 0x05,
    ClkEventTimestampUptimeLsb = 0x06,
    ClkEventTimestampUptimeCsb = 0x07,
    ClkEventTimestampUptimeMsb = 0x08,
    TimebaseEventTimestampOrbitLsb = 0x09,
    TimebaseEventTimestampOrbitMsb = 0x0A,
    ClkEventTimestampOrbitLsb = 0x0B,
    ClkEventTimestampOrbitMsb = 0x0C,
    ClkEventTimestampOrbitCsb = 0x0D,
    TimebaseEventTimestampOrbitCsb = 0x0E,
}

/// Which events clear a sticky loss of timebase
#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x01)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct ConfigReset {
    /// Cleared when the trigger handler is enabled
    #[packed_field(bits = "0")]
    pub enable_th: bool,
    /// Cleared on the next start of run
    #[packed_field(bits = "1")]
    pub sox: bool,
}

#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x02)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct ClockHealthFlags {
    #[packed_field(bits = "0")]
    pub jitter_cleaner_los: bool,
    #[packed_field(bits = "1")]
    pub jitter_cleaner_lol: bool,
    #[packed_field(bits = "2")]
    pub lol_timebase: bool,
    #[packed_field(bits = "3")]
    pub xcku_clock_lol: bool,
}

impl ClockHealthFlags {
    /// Any flag raised by a clock event, as opposed to a timebase event
    #[must_use]
    pub fn is_any_clk_event_flags_set(&self) -> bool {
        self.jitter_cleaner_los || self.jitter_cleaner_lol || self.xcku_clock_lol
    }
}

/// Uptime and orbit of an event
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EventTimestamp {
    pub uptime: u64,
    pub orbit: u64,
}

#[derive(Debug)]
pub struct ClockHealth<T> {
    handle: ModuleHandle<T>,
}

impl<T> ClockHealth<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self { handle }
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_clock_health_flags(&self) -> Result<()> {
        self.handle.write(ClockHealthRegister::ResetClockHealthFlags, 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn config_reset(&self) -> Result<ConfigReset> {
        self.handle.read_packed()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_config_reset(&self, config: &ConfigReset) -> Result<()> {
        self.handle.write_packed(config)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn flags(&self) -> Result<ClockHealthFlags> {
        self.handle.read_packed()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_any_clk_event_flags_set(&self) -> Result<bool> {
        Ok(self.flags()?.is_any_clk_event_flags_set())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn timebase_event_timestamp(&self) -> Result<EventTimestamp> {
        use ClockHealthRegister::*;
        Ok(EventTimestamp {
            uptime: self.handle.read_wide(&[
                TimebaseEventTimestampUptimeLsb,
                TimebaseEventTimestampUptimeCsb,
                TimebaseEventTimestampUptimeMsb,
            ])?,
            orbit: self.handle.read_wide(&[
                TimebaseEventTimestampOrbitLsb,
                TimebaseEventTimestampOrbitCsb,
                TimebaseEventTimestampOrbitMsb,
            ])?,
        })
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn clk_event_timestamp(&self) -> Result<EventTimestamp> {
        use ClockHealthRegister::*;
        Ok(EventTimestamp {
            uptime: self.handle.read_wide(&[
                ClkEventTimestampUptimeLsb,
                ClkEventTimestampUptimeCsb,
                ClkEventTimestampUptimeMsb,
            ])?,
            orbit: self.handle.read_wide(&[
                ClkEventTimestampOrbitLsb,
                ClkEventTimestampOrbitCsb,
                ClkEventTimestampOrbitMsb,
            ])?,
        })
    }

    /// Logs the flags and event timestamps if any clock event happened, returns whether one did
    /// # Errors
    /// Returns an error on bad transport
    pub fn log_clock_event(&self) -> Result<bool> {
        let flags = self.flags()?;
        if flags.is_any_clk_event_flags_set() {
            let ts = self.clk_event_timestamp()?;
            warn!(
                ?flags,
                uptime = ts.uptime,
                orbit = ts.orbit,
                "Clock event detected"
            );
        }
        if flags.lol_timebase {
            let ts = self.timebase_event_timestamp()?;
            warn!(uptime = ts.uptime, orbit = ts.orbit, "Timebase lost");
        }
        Ok(flags.is_any_clk_event_flags_set())
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<ClockHealthRegister>("CLOCK HEALTH STATUS")
    }
}
