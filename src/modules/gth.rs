//! The GTH transceiver frontend receiving the nine inner barrel lanes
use crate::{
    core::{
        ModuleHandle,
        RegisterMap,
    },
    error::{
        ensure_range,
        Result,
    },
    transport::Transport,
};
use tracing::{
    error,
    info,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum GthRegister {
    EnableAlignment = 0,
    AlignmentStatus = 1,
    EnableData = 2,
    GthReset = 5,
    GthStatus = 6,
    EnablePrbsCheck = 7,
    PrbsCounterReset = 8,
    GthRxRstDoneCntr = 9,
}

/// Bits of the reset register
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum GthReset {
    All = 15,
    RxPllAndDatapath = 14,
    RxDatapath = 13,
}

pub const LANES: u8 = 9;
const ALL_LANES: u16 = 0x1FF;
const RESET_DONE: u16 = 1 << 15;
const RESET_PULSE_CYCLES: u32 = 15;

#[derive(Debug)]
pub struct Gth<T> {
    handle: ModuleHandle<T>,
    /// Lanes touched by the masked writes
    lanes: u16,
}

impl<T> Gth<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self {
            handle,
            lanes: ALL_LANES,
        }
    }

    /// Restricts the following operations to `lanes`
    /// # Errors
    /// Returns an error if a lane doesn't exist
    pub fn set_lanes(&mut self, lanes: &[u8]) -> Result<()> {
        let mut mask = 0;
        for lane in lanes {
            ensure_range!(*lane < LANES, "GTH lane {lane}");
            mask |= 1 << lane;
        }
        self.lanes = mask;
        Ok(())
    }

    #[must_use]
    pub fn lanes(&self) -> Vec<u8> {
        (0..LANES).filter(|l| self.lanes >> l & 1 == 1).collect()
    }

    /// Sets or clears the selected lanes' bits of `reg`, leaving the others untouched
    fn write_masked(&self, reg: GthRegister, flag: bool, readback: bool) -> Result<()> {
        let current = if self.lanes != ALL_LANES && readback {
            self.handle.read(reg)?
        } else {
            0
        };
        let value = if flag {
            current | self.lanes
        } else {
            current & !self.lanes
        };
        self.handle.write(reg, value)
    }

    fn pulse_reset(&self, value: u16) -> Result<()> {
        self.handle.queue_write(GthRegister::GthReset, value)?;
        self.handle.wait(RESET_PULSE_CYCLES)?;
        self.handle.write(GthRegister::GthReset, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_gth(&self) -> Result<()> {
        self.pulse_reset(1 << GthReset::All as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_rx_pll_and_datapath(&self) -> Result<()> {
        self.pulse_reset(1 << GthReset::RxPllAndDatapath as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_rx_datapath(&self) -> Result<()> {
        self.pulse_reset(1 << GthReset::RxDatapath as u16)
    }

    /// Resets the PMA of a single lane
    /// # Errors
    /// Returns an error on bad transport or a lane that doesn't exist
    pub fn reset_lane(&self, lane: u8) -> Result<()> {
        ensure_range!(lane < LANES, "GTH lane {lane}");
        self.pulse_reset(1 << lane)
    }

    /// Disables data and alignment, resets the block and waits for the reset to complete.
    /// Returns whether it did within `max_retries` polls.
    /// # Errors
    /// Returns an error on bad transport
    pub fn initialize(&self, max_retries: usize) -> Result<bool> {
        self.enable_data(false)?;
        self.enable_alignment(false)?;
        self.reset_gth()?;
        self.handle.wait(100)?;
        let mut done = self.is_reset_done()?;
        let mut retries = 0;
        while !done && retries < max_retries {
            self.handle.wait(200)?;
            done = self.is_reset_done()?;
            retries += 1;
        }
        if done {
            info!("GTH: Reset done");
        } else {
            error!("GTH: Reset not done");
        }
        Ok(done)
    }

    /// Enables alignment and polls until every selected lane reports aligned
    /// # Errors
    /// Returns an error on bad transport
    pub fn align_transceivers(&self, max_retries: usize) -> Result<bool> {
        self.enable_alignment(true)?;
        let mut aligned = self.is_aligned()?;
        let mut retries = 0;
        while !aligned && retries < max_retries {
            self.handle.wait(100)?;
            aligned = self.is_aligned()?;
            retries += 1;
        }
        Ok(aligned)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_reset_done(&self) -> Result<bool> {
        Ok(self.handle.read(GthRegister::GthStatus)? & RESET_DONE != 0)
    }

    /// CDR lock of every lane, as a bit mask
    /// # Errors
    /// Returns an error on bad transport
    pub fn cdr_locked(&self) -> Result<u16> {
        Ok(self.handle.read(GthRegister::GthStatus)? & ALL_LANES)
    }

    /// Whether every selected lane has its CDR locked
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_cdr_locked(&self) -> Result<bool> {
        Ok(self.cdr_locked()? & self.lanes == self.lanes)
    }

    /// Whether every selected lane is aligned to the comma
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_aligned(&self) -> Result<bool> {
        Ok(self.handle.read(GthRegister::AlignmentStatus)? & self.lanes == self.lanes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_alignment(&self, enable: bool) -> Result<()> {
        self.write_masked(GthRegister::EnableAlignment, enable, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_data(&self, enable: bool) -> Result<()> {
        self.write_masked(GthRegister::EnableData, enable, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_prbs(&self, enable: bool) -> Result<()> {
        self.write_masked(GthRegister::EnablePrbsCheck, enable, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_prbs_counter(&self) -> Result<()> {
        self.write_masked(GthRegister::PrbsCounterReset, true, false)?;
        self.handle.write(GthRegister::PrbsCounterReset, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn rx_reset_done_counter(&self) -> Result<u16> {
        self.handle.read(GthRegister::GthRxRstDoneCntr)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle.dump_config::<GthRegister>("GTH FRONTEND")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::ModuleId,
        master::WishboneMaster,
        transport::mock::Mock,
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    fn gth() -> (Arc<Mutex<WishboneMaster<Mock>>>, Gth<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::GthControl);
        (master, Gth::new(handle))
    }

    #[test]
    fn test_initialize_and_align() {
        let (_master, gth) = gth();
        assert!(gth.initialize(10).unwrap());
        assert!(gth.is_cdr_locked().unwrap());
        assert!(!gth.is_aligned().unwrap());
        assert!(gth.align_transceivers(10).unwrap());
        gth.enable_data(true).unwrap();
        assert_eq!(gth.handle.read(GthRegister::EnableData).unwrap(), ALL_LANES);
    }

    #[test]
    fn test_masked_writes_keep_other_lanes() {
        let (_master, mut gth) = gth();
        gth.enable_data(true).unwrap();
        gth.set_lanes(&[0, 3]).unwrap();
        gth.enable_data(false).unwrap();
        assert_eq!(
            gth.handle.read(GthRegister::EnableData).unwrap(),
            ALL_LANES & !0b1001
        );
        assert_eq!(gth.lanes(), vec![0, 3]);
        assert!(gth.set_lanes(&[9]).is_err());
    }

    #[test]
    fn test_unlocked_lane_never_aligns() {
        let (master, gth) = gth();
        master.lock().unwrap().transport_mut().set_lane_locked(4, false);
        assert!(!gth.is_cdr_locked().unwrap());
        assert!(!gth.align_transceivers(3).unwrap());
    }
}
