//! The readout master, which selects the lanes whose data is read out and tracks faulty ones
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

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum ReadoutMasterRegister {
    IbEnabledLanes = 0,
    ObEnabledLanesLsb = 1,
    ObEnabledLanesMsb = 2,
    MaxNokLanes = 3,
    IbFaultyLanes = 4,
    ObFaultyLanesLsb = 5,
    ObFaultyLanesMsb = 6,
    Status = 7,
    IbNokLanes = 8,
    ObNokLanesLsb = 9,
    ObNokLanesMsb = 10,
}

pub const IB_LANES: u32 = 9;
pub const OB_LANES: u32 = 28;
pub const IB_LANE_MASK: u16 = 0x1FF;
pub const OB_LANE_MASK: u32 = 0xFFF_FFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ReadoutStatus {
    pub raw: u16,
    pub fero_okay: bool,
    pub no_pending_detector_data: bool,
    pub no_pending_lane_data: bool,
}

impl From<u16> for ReadoutStatus {
    fn from(raw: u16) -> Self {
        Self {
            raw,
            fero_okay: raw & 1 == 1,
            no_pending_detector_data: raw >> 1 & 1 == 1,
            no_pending_lane_data: raw >> 2 & 1 == 1,
        }
    }
}

#[derive(Debug)]
pub struct ReadoutMaster<T> {
    handle: ModuleHandle<T>,
}

impl<T> ReadoutMaster<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self { handle }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_ob(&self, lsb: ReadoutMasterRegister, msb: ReadoutMasterRegister) -> Result<u32> {
        Ok(self.handle.read_wide(&[lsb, msb])? as u32)
    }

    /// # Errors
    /// Returns an error on bad transport or a lane past the ninth
    pub fn set_ib_enabled_lanes(&self, lanes: u16) -> Result<()> {
        ensure_range!(lanes | IB_LANE_MASK == IB_LANE_MASK, "IB lanes {lanes:#x}");
        self.handle.write(ReadoutMasterRegister::IbEnabledLanes, lanes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ib_enabled_lanes(&self) -> Result<u16> {
        self.handle.read(ReadoutMasterRegister::IbEnabledLanes)
    }

    /// # Errors
    /// Returns an error on bad transport or a lane past the 28th
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_ob_enabled_lanes(&self, lanes: u32) -> Result<()> {
        ensure_range!(lanes | OB_LANE_MASK == OB_LANE_MASK, "OB lanes {lanes:#x}");
        self.handle
            .queue_write(ReadoutMasterRegister::ObEnabledLanesLsb, lanes as u16)?;
        self.handle
            .write(ReadoutMasterRegister::ObEnabledLanesMsb, (lanes >> 16) as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ob_enabled_lanes(&self) -> Result<u32> {
        self.read_ob(
            ReadoutMasterRegister::ObEnabledLanesLsb,
            ReadoutMasterRegister::ObEnabledLanesMsb,
        )
    }

    /// Toggles every IB lane off and on again
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_ib_lanes(&self) -> Result<()> {
        self.set_ib_enabled_lanes(0)?;
        self.set_ib_enabled_lanes(IB_LANE_MASK)
    }

    /// Toggles every OB lane off and on again
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_ob_lanes(&self) -> Result<()> {
        self.set_ob_enabled_lanes(0)?;
        self.set_ob_enabled_lanes(OB_LANE_MASK)
    }

    /// Number of lanes in error that stops the triggers
    /// # Errors
    /// Returns an error on bad transport or more lanes than exist
    pub fn set_max_nok_lanes(&self, lanes: u16) -> Result<()> {
        ensure_range!(u32::from(lanes) <= OB_LANES, "max nok lanes {lanes}");
        self.handle.write(ReadoutMasterRegister::MaxNokLanes, lanes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ib_faulty_lanes(&self) -> Result<u16> {
        self.handle.read(ReadoutMasterRegister::IbFaultyLanes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ob_faulty_lanes(&self) -> Result<u32> {
        self.read_ob(
            ReadoutMasterRegister::ObFaultyLanesLsb,
            ReadoutMasterRegister::ObFaultyLanesMsb,
        )
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ib_nok_lanes(&self) -> Result<u16> {
        self.handle.read(ReadoutMasterRegister::IbNokLanes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ob_nok_lanes(&self) -> Result<u32> {
        self.read_ob(
            ReadoutMasterRegister::ObNokLanesLsb,
            ReadoutMasterRegister::ObNokLanesMsb,
        )
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn status(&self) -> Result<ReadoutStatus> {
        Ok(self.handle.read(ReadoutMasterRegister::Status)?.into())
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<ReadoutMasterRegister>("READOUT MASTER")
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

    fn readout_master() -> (Arc<Mutex<WishboneMaster<Mock>>>, ReadoutMaster<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::ReadoutMaster);
        (master, ReadoutMaster::new(handle))
    }

    #[test]
    fn test_ob_lanes() {
        let (_master, rm) = readout_master();
        rm.set_ob_enabled_lanes(0xABC_DEF0).unwrap();
        assert_eq!(rm.ob_enabled_lanes().unwrap(), 0xABC_DEF0);
        assert!(rm.set_ob_enabled_lanes(0x1000_0000).is_err());
        rm.reset_ob_lanes().unwrap();
        assert_eq!(rm.ob_enabled_lanes().unwrap(), OB_LANE_MASK);
    }

    #[test]
    fn test_ib_lanes() {
        let (_master, rm) = readout_master();
        rm.reset_ib_lanes().unwrap();
        assert_eq!(rm.ib_enabled_lanes().unwrap(), IB_LANE_MASK);
        assert!(rm.set_ib_enabled_lanes(0x200).is_err());
    }

    #[test]
    fn test_status_decode() {
        let status = ReadoutStatus::from(0b101);
        assert!(status.fero_okay && status.no_pending_lane_data);
        assert!(!status.no_pending_detector_data);
        let (_master, rm) = readout_master();
        assert!(rm.status().unwrap().fero_okay);
        assert_eq!(rm.ob_faulty_lanes().unwrap(), 0);
    }
}
