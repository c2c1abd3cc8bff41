//! The GBT packer, which frames lane data into the three uplink GBT streams
use crate::{
    core::{
        ModuleHandle,
        ModuleId,
        RegisterMap,
    },
    error::{
        ensure_range,
        Result,
    },
    modules::monitor::{
        CounterMonitor,
        GBT_PACKER_MONITOR,
    },
    transport::Transport,
};
use kstring::KString;
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum GbtPackerRegister {
    TimeoutToStart = 0,
    TimeoutStartStop = 1,
    TimeoutInIdle = 2,
    Reset = 3,
    GbtxFifoEmpty = 4,
    LaneFifoEmpty = 5,
    ProtocolConfig = 6,
    SkipItsPayload = 7,
    DataExclusivePacket = 8,
}

#[derive(Debug)]
pub struct GbtPacker<T> {
    handle: ModuleHandle<T>,
    /// One monitor per uplink, the first one drives latch and reset of the others
    monitors: [CounterMonitor<T>; 3],
}

impl<T> GbtPacker<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        let monitor = |id, name| CounterMonitor::new(handle.sibling(id), name, GBT_PACKER_MONITOR);
        let monitors = [
            monitor(ModuleId::GbtPacker0Monitor, "GBT PACKER 0 MONITOR"),
            monitor(ModuleId::GbtPacker1Monitor, "GBT PACKER 1 MONITOR"),
            monitor(ModuleId::GbtPacker2Monitor, "GBT PACKER 2 MONITOR"),
        ];
        Self { handle, monitors }
    }

    /// Time from a trigger to the first start from a lane
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_timeout_to_start(&self, value: u16) -> Result<()> {
        self.handle.write(GbtPackerRegister::TimeoutToStart, value)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn timeout_to_start(&self) -> Result<u16> {
        self.handle.read(GbtPackerRegister::TimeoutToStart)
    }

    /// Time from the first start until the last stop
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_timeout_start_stop(&self, value: u16) -> Result<()> {
        self.handle.write(GbtPackerRegister::TimeoutStartStop, value)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn timeout_start_stop(&self) -> Result<u16> {
        self.handle.read(GbtPackerRegister::TimeoutStartStop)
    }

    /// Time all lanes may stay silent after a start
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_timeout_in_idle(&self, value: u16) -> Result<()> {
        self.handle.write(GbtPackerRegister::TimeoutInIdle, value)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn timeout_in_idle(&self) -> Result<u16> {
        self.handle.read(GbtPackerRegister::TimeoutInIdle)
    }

    /// Holds (or releases) the packer in reset, flushing its trigger FIFO
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_reset(&self, reset: bool) -> Result<()> {
        self.handle.write(GbtPackerRegister::Reset, u16::from(reset))
    }

    /// Pulses the reset
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset(&self) -> Result<()> {
        self.handle.queue_write(GbtPackerRegister::Reset, 1)?;
        self.handle.write(GbtPackerRegister::Reset, 0)
    }

    /// # Errors
    /// Returns an error on bad transport or a FIFO past the third
    pub fn is_gbtx_fifo_empty(&self, fifo: u8) -> Result<bool> {
        ensure_range!(fifo < 3, "GBTx FIFO {fifo}");
        Ok(self.handle.read(GbtPackerRegister::GbtxFifoEmpty)? >> fifo & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn are_gbtx_fifos_empty(&self) -> Result<bool> {
        Ok(self.handle.read(GbtPackerRegister::GbtxFifoEmpty)? & 0x7 == 0x7)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn are_lane_fifos_empty(&self) -> Result<bool> {
        Ok(self.handle.read(GbtPackerRegister::LaneFifoEmpty)? & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport or a value wider than 2 bits
    pub fn write_protocol_config(&self, value: u16) -> Result<()> {
        ensure_range!(value | 0x3 == 0x3, "protocol config {value:#x}");
        self.handle.write(GbtPackerRegister::ProtocolConfig, value)
    }

    /// Only send the data header words in heartbeat frames that carry triggers
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_ddw_and_ihw_on_trigger_only(&self) -> Result<()> {
        self.write_protocol_config(0x3)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn clear_protocol_config(&self) -> Result<()> {
        self.write_protocol_config(0x0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_skip_its_payload(&self, skip: bool) -> Result<()> {
        self.handle
            .write(GbtPackerRegister::SkipItsPayload, u16::from(skip))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_data_exclusive_packet(&self, exclusive: bool) -> Result<()> {
        self.handle
            .write(GbtPackerRegister::DataExclusivePacket, u16::from(exclusive))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_all_counters(&self) -> Result<()> {
        self.monitors[0].reset_all_counters()
    }

    /// Latches through the first monitor and reads all three
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_counters(&self, reset_after: bool) -> Result<[BTreeMap<KString, u32>; 3]> {
        Ok([
            self.monitors[0].read_counters(None, true, reset_after)?,
            self.monitors[1].read_counters(None, false, false)?,
            self.monitors[2].read_counters(None, false, false)?,
        ])
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle.dump_config::<GbtPackerRegister>("GBT PACKER")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        master::WishboneMaster,
        transport::mock::Mock,
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    fn packer() -> (Arc<Mutex<WishboneMaster<Mock>>>, GbtPacker<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::GbtPacker);
        (master, GbtPacker::new(handle))
    }

    #[test]
    fn test_timeouts() {
        let (_master, p) = packer();
        p.set_timeout_to_start(0x100).unwrap();
        p.set_timeout_start_stop(0x200).unwrap();
        p.set_timeout_in_idle(0x300).unwrap();
        assert_eq!(p.timeout_to_start().unwrap(), 0x100);
        assert_eq!(p.timeout_start_stop().unwrap(), 0x200);
        assert_eq!(p.timeout_in_idle().unwrap(), 0x300);
    }

    #[test]
    fn test_fifos_empty_at_rest() {
        let (_master, p) = packer();
        p.reset().unwrap();
        assert!(p.are_gbtx_fifos_empty().unwrap());
        assert!(p.is_gbtx_fifo_empty(2).unwrap());
        assert!(p.is_gbtx_fifo_empty(3).is_err());
        assert!(p.are_lane_fifos_empty().unwrap());
    }

    #[test]
    fn test_protocol_config() {
        let (_master, p) = packer();
        p.set_ddw_and_ihw_on_trigger_only().unwrap();
        assert_eq!(p.handle.read(GbtPackerRegister::ProtocolConfig).unwrap(), 3);
        assert!(p.write_protocol_config(4).is_err());
    }

    #[test]
    fn test_counters_cleared() {
        let (_master, p) = packer();
        p.reset_all_counters().unwrap();
        let counters = p.read_counters(false).unwrap();
        for monitor in &counters {
            assert!(monitor.values().all(|v| *v == 0));
            assert_eq!(monitor.len(), GBT_PACKER_MONITOR.len());
        }
    }
}
