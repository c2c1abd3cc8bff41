//! The firmware wait module, which stalls the wishbone master for a number of clock cycles
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
pub enum WaitRegister {
    WaitValue = 0,
    RstCtrlCntrs = 1,
    ReadWaitExecCntr = 2,
}

#[derive(Debug)]
pub struct WishboneWait<T> {
    handle: ModuleHandle<T>,
}

impl<T> WishboneWait<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self { handle }
    }

    /// Issues a single wait instruction of `value` cycles
    /// # Errors
    /// Returns an error on bad transport or a value wider than 16 bits
    #[allow(clippy::cast_possible_truncation)]
    pub fn single_wait(&self, value: u32) -> Result<()> {
        ensure_range!(value <= 0xFFFF, "single wait of {value} cycles");
        self.handle.write(WaitRegister::WaitValue, value as u16)
    }

    /// Waits for `cycles` clock cycles, split into as many instructions as needed
    /// # Errors
    /// Returns an error on bad transport
    pub fn wait(&self, cycles: u32) -> Result<()> {
        self.handle.wait(cycles)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_counters(&self) -> Result<()> {
        self.handle.queue_write(WaitRegister::RstCtrlCntrs, 1)?;
        self.handle.write(WaitRegister::RstCtrlCntrs, 0)
    }

    /// Number of wait instructions executed since the last reset
    /// # Errors
    /// Returns an error on bad transport
    pub fn wait_exec_counter(&self) -> Result<u16> {
        self.handle.read(WaitRegister::ReadWaitExecCntr)
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

    #[test]
    fn test_exec_counter() {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let wait = WishboneWait::new(ModuleHandle::new(
            Arc::downgrade(&master),
            ModuleId::FwWait,
        ));
        wait.reset_counters().unwrap();
        assert_eq!(wait.wait_exec_counter().unwrap(), 0);
        wait.single_wait(100).unwrap();
        wait.wait(0x1_0000).unwrap();
        assert_eq!(wait.wait_exec_counter().unwrap(), 3);
        assert!(wait.single_wait(0x1_0000).is_err());
    }
}
