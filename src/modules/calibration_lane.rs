//! The calibration lane, which tags calibration events with a 48-bit user field
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
pub enum CalibrationLaneRegister {
    UserField0 = 0,
    UserField1 = 1,
    UserField2 = 2,
    Reset = 3,
}

pub const USER_FIELD_BITS: u32 = 48;

#[derive(Debug)]
pub struct CalibrationLane<T> {
    handle: ModuleHandle<T>,
}

impl<T> CalibrationLane<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self { handle }
    }

    /// Sets the user field sent with the next calibration events, most significant word first
    /// # Errors
    /// Returns an error on bad transport or a value wider than 48 bits
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_user_field(&self, value: u64) -> Result<()> {
        ensure_range!(value >> USER_FIELD_BITS == 0, "user field {value:#X} wider than 48 bits");
        let [field0, field1, field2] = [0, 16, 32].map(|shift| (value >> shift) as u16);
        self.handle
            .queue_write(CalibrationLaneRegister::UserField2, field2)?;
        self.handle
            .queue_write(CalibrationLaneRegister::UserField1, field1)?;
        self.handle
            .write(CalibrationLaneRegister::UserField0, field0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn user_field(&self) -> Result<u64> {
        self.handle.read_wide(&[
            CalibrationLaneRegister::UserField0,
            CalibrationLaneRegister::UserField1,
            CalibrationLaneRegister::UserField2,
        ])
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset(&self) -> Result<()> {
        self.handle.write(CalibrationLaneRegister::Reset, 0)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<CalibrationLaneRegister>("CALIBRATION LANE")
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

    fn calibration_lane() -> (Arc<Mutex<WishboneMaster<Mock>>>, CalibrationLane<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::CalibrationLane);
        (master, CalibrationLane::new(handle))
    }

    #[test]
    fn test_user_field() {
        let (_master, lane) = calibration_lane();
        lane.set_user_field(0xABCD_1234_5678).unwrap();
        assert_eq!(lane.user_field().unwrap(), 0xABCD_1234_5678);
        assert!(lane.set_user_field(1 << 48).is_err());
        assert_eq!(lane.user_field().unwrap(), 0xABCD_1234_5678);
    }

    #[test]
    fn test_dump() {
        let (_master, lane) = calibration_lane();
        lane.set_user_field(0x0002_0000_0001).unwrap();
        lane.reset().unwrap();
        let dump = lane.dump_config().unwrap();
        assert!(dump.starts_with("--- CALIBRATION LANE module ---"));
        assert!(dump.contains("USER_FIELD0 : 0x0001"));
        assert!(dump.contains("USER_FIELD2 : 0x0002"));
        assert!(dump.contains("RESET : 0x0000"));
    }
}
