//! The GPIO frontend receiving the 28 outer barrel lanes. Every lane mask is split over a low and
//! a high register.
use crate::{
    core::{
        ModuleHandle,
        RegisterMap,
    },
    error::{
        ensure_range,
        Error,
        Result,
    },
    transport::Transport,
};
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum GpioRegister {
    EnableAlignmentL = 0,
    EnableAlignmentH = 1,
    AlignmentStatusL = 2,
    AlignmentStatusH = 3,
    EnableRealignL = 4,
    EnableRealignH = 5,
    EnableDataL = 6,
    EnableDataH = 7,
    IdelayValue = 8,
    IdelayLoadL = 9,
    IdelayLoadH = 10,
    EnablePrbsCheckL = 11,
    EnablePrbsCheckH = 12,
    InputInverterL = 13,
    InputInverterH = 14,
    PrbsResetCounterL = 15,
    PrbsResetCounterH = 16,
    PrbsCounterLane0 = 17,
    PrbsCounterLane1 = 18,
    PrbsCounterLane2 = 19,
    PrbsCounterLane3 = 20,
    PrbsCounterLane4 = 21,
    PrbsCounterLane5 = 22,
    PrbsCounterLane6 = 23,
    PrbsCounterLane7 = 24,
    PrbsCounterLane8 = 25,
    PrbsCounterLane9 = 26,
    PrbsCounterLane10 = 27,
    PrbsCounterLane11 = 28,
    PrbsCounterLane12 = 29,
    PrbsCounterLane13 = 30,
    PrbsCounterLane14 = 31,
    PrbsCounterLane15 = 32,
    PrbsCounterLane16 = 33,
    PrbsCounterLane17 = 34,
    PrbsCounterLane18 = 35,
    PrbsCounterLane19 = 36,
    PrbsCounterLane20 = 37,
    PrbsCounterLane21 = 38,
    PrbsCounterLane22 = 39,
    PrbsCounterLane23 = 40,
    PrbsCounterLane24 = 41,
    PrbsCounterLane25 = 42,
    PrbsCounterLane26 = 43,
    PrbsCounterLane27 = 44,
}

pub const LANES: u8 = 28;
const ALL_LANES: u32 = 0xFFF_FFFF;
pub const MAX_IDELAY: u16 = 0x1FF;

/// A (low, high) register pair
type Pair = (GpioRegister, GpioRegister);

const ENABLE_ALIGNMENT: Pair = (GpioRegister::EnableAlignmentL, GpioRegister::EnableAlignmentH);
const ALIGNMENT_STATUS: Pair = (GpioRegister::AlignmentStatusL, GpioRegister::AlignmentStatusH);
const ENABLE_REALIGN: Pair = (GpioRegister::EnableRealignL, GpioRegister::EnableRealignH);
const ENABLE_DATA: Pair = (GpioRegister::EnableDataL, GpioRegister::EnableDataH);
const IDELAY_LOAD: Pair = (GpioRegister::IdelayLoadL, GpioRegister::IdelayLoadH);
const ENABLE_PRBS_CHECK: Pair = (GpioRegister::EnablePrbsCheckL, GpioRegister::EnablePrbsCheckH);
const PRBS_RESET_COUNTER: Pair = (
    GpioRegister::PrbsResetCounterL,
    GpioRegister::PrbsResetCounterH,
);

#[derive(Debug)]
pub struct Gpio<T> {
    handle: ModuleHandle<T>,
    lanes: u32,
}

impl<T> Gpio<T>
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
            ensure_range!(*lane < LANES, "GPIO lane {lane}");
            mask |= 1 << lane;
        }
        self.lanes = mask;
        Ok(())
    }

    #[must_use]
    pub fn lanes(&self) -> Vec<u8> {
        (0..LANES).filter(|l| self.lanes >> l & 1 == 1).collect()
    }

    /// Reads the high then the low half
    fn read_hl(&self, (low, high): Pair) -> Result<u32> {
        let regs = self.handle.read_many(&[high, low])?;
        Ok(regs.iter().fold(0, |acc, r| acc << 16 | u32::from(*r)))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write_masked(&self, (low, high): Pair, flag: bool, readback: bool) -> Result<()> {
        let current = if self.lanes != ALL_LANES && readback {
            self.read_hl((low, high))?
        } else {
            0
        };
        let value = if flag {
            current | self.lanes
        } else {
            current & !self.lanes
        };
        self.handle.queue_write(low, value as u16)?;
        self.handle.wait(10)?;
        self.handle.write(high, (value >> 16) as u16)
    }

    /// Disables data and alignment on the selected lanes
    /// # Errors
    /// Returns an error on bad transport
    pub fn initialize(&self) -> Result<()> {
        self.enable_data(false)?;
        self.enable_alignment(false)
    }

    /// Enables alignment and realignment, then polls until every selected lane is aligned
    /// # Errors
    /// Returns an error on bad transport
    pub fn align_transceivers(&self, max_retries: usize) -> Result<bool> {
        self.enable_alignment(true)?;
        self.enable_realign(true)?;
        let mut aligned = self.is_aligned()?;
        let mut retries = 0;
        while !aligned && retries < max_retries {
            self.handle.wait(100)?;
            aligned = self.is_aligned()?;
            retries += 1;
        }
        debug!(aligned, retries, "GPIO alignment");
        Ok(aligned)
    }

    /// Alignment of every lane, as a bit mask
    /// # Errors
    /// Returns an error on bad transport
    pub fn alignment_status(&self) -> Result<u32> {
        self.read_hl(ALIGNMENT_STATUS)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_aligned(&self) -> Result<bool> {
        Ok(self.alignment_status()? & self.lanes == self.lanes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_alignment(&self, enable: bool) -> Result<()> {
        self.write_masked(ENABLE_ALIGNMENT, enable, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_realign(&self, enable: bool) -> Result<()> {
        self.write_masked(ENABLE_REALIGN, enable, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_data(&self, enable: bool) -> Result<()> {
        self.write_masked(ENABLE_DATA, enable, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enabled_data(&self) -> Result<u32> {
        self.read_hl(ENABLE_DATA)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_prbs(&self, enable: bool) -> Result<()> {
        self.write_masked(ENABLE_PRBS_CHECK, enable, true)
    }

    /// Loads the input delay `value` into the selected lanes
    /// # Errors
    /// Returns an error on bad transport or a delay past [`MAX_IDELAY`]
    pub fn load_idelay(&self, value: u16) -> Result<()> {
        ensure_range!(value <= MAX_IDELAY, "idelay {value}");
        self.handle.queue_write(GpioRegister::IdelayValue, value)?;
        self.write_masked(IDELAY_LOAD, true, false)?;
        self.handle.queue_write(GpioRegister::IdelayLoadL, 0)?;
        self.handle.write(GpioRegister::IdelayLoadH, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_input_inverter(&self, lanes: u32) -> Result<()> {
        self.handle
            .queue_write(GpioRegister::InputInverterL, lanes as u16)?;
        self.handle
            .write(GpioRegister::InputInverterH, (lanes >> 16) as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_prbs_counter(&self) -> Result<()> {
        self.write_masked(PRBS_RESET_COUNTER, true, false)?;
        self.handle.queue_write(GpioRegister::PrbsResetCounterH, 0)?;
        self.handle.write(GpioRegister::PrbsResetCounterL, 0)
    }

    /// PRBS errors of every selected lane, in lane order
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_prbs_counters(&self) -> Result<Vec<u16>> {
        let regs = self
            .lanes()
            .iter()
            .map(|l| {
                GpioRegister::from_addr(GpioRegister::PrbsCounterLane0.addr() + l)
                    .ok_or_else(|| Error::OutOfRange(format!("GPIO lane {l}")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.handle.read_many(&regs)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle.dump_config::<GpioRegister>("GPIO FRONTEND")
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

    fn gpio() -> (Arc<Mutex<WishboneMaster<Mock>>>, Gpio<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::GpioControl);
        (master, Gpio::new(handle))
    }

    #[test]
    fn test_align() {
        let (_master, gpio) = gpio();
        gpio.initialize().unwrap();
        assert_eq!(gpio.alignment_status().unwrap(), 0);
        assert!(gpio.align_transceivers(10).unwrap());
        gpio.enable_data(true).unwrap();
        assert_eq!(gpio.enabled_data().unwrap(), ALL_LANES);
    }

    #[test]
    fn test_split_masked_write() {
        let (_master, mut gpio) = gpio();
        gpio.set_lanes(&[1, 17, 27]).unwrap();
        gpio.enable_data(true).unwrap();
        assert_eq!(gpio.enabled_data().unwrap(), 1 << 1 | 1 << 17 | 1 << 27);
        gpio.set_lanes(&[17]).unwrap();
        gpio.enable_data(false).unwrap();
        assert_eq!(gpio.enabled_data().unwrap(), 1 << 1 | 1 << 27);
    }

    #[test]
    fn test_idelay_and_prbs() {
        let (_master, mut gpio) = gpio();
        assert!(gpio.load_idelay(0x200).is_err());
        gpio.load_idelay(0x100).unwrap();
        gpio.set_lanes(&[0, 27]).unwrap();
        gpio.reset_prbs_counter().unwrap();
        assert_eq!(gpio.read_prbs_counters().unwrap(), vec![0, 0]);
    }
}
