//! The core types shared by every register module on the Readout Unit
use crate::{
    error::{
        Error,
        Result,
    },
    master::WishboneMaster,
    transport::Transport,
};
use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use packed_struct::prelude::*;
use std::{
    fmt::Write,
    sync::{
        Mutex,
        Weak,
    },
    time::Duration,
};
use swt::Reply;

pub use rucontrol_derive::{
    address,
    RegisterMap,
};

/// Bunch crossings in one LHC orbit
pub const ORBIT_BC: u32 = 3564;
/// LHC bunch crossing frequency
pub const LHC_FREQUENCY_HZ: f64 = 40.078_97e6;
/// The wishbone clock runs at four times the bunch crossing frequency
pub const WB_CLOCK_HZ: f64 = 4.0 * LHC_FREQUENCY_HZ;

/// Wishbone slave ids of the Readout Unit firmware
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ModuleId {
    MasterMonitor = 0,
    Identity = 1,
    GthControl = 2,
    DatalaneMonitorIb = 3,
    AlpideControl = 4,
    I2cGbt = 5,
    I2cPu1 = 6,
    I2cPu2 = 7,
    Gbtx0 = 8,
    Gbtx2 = 9,
    FwWait = 10,
    Radmon = 11,
    Sysmon = 12,
    GbtxFlowMonitor = 13,
    UsbIf = 14,
    MasterUsbMonitor = 15,
    TriggerHandler = 16,
    TriggerHandlerMonitor = 17,
    GpioControl = 18,
    DatalaneMonitorOb1 = 19,
    DatalaneMonitorOb2 = 20,
    GbtPacker = 21,
    GthMonitor = 22,
    GthDrp = 23,
    GbtPacker0Monitor = 24,
    GpioMonitor = 25,
    MmcmGbtxRxrdyMonitor = 26,
    MasterCanMonitor = 27,
    CanHlp = 28,
    CanHlpMonitor = 29,
    GbtPacker1Monitor = 30,
    SystemResetControl = 31,
    GbtPacker2Monitor = 32,
    ClockHealthStatus = 33,
    I2cMonitorGbtx = 34,
    I2cPu1Aux = 35,
    I2cPu2Aux = 36,
    I2cPu1Controller = 37,
    I2cPu2Controller = 38,
    MonitorPu1Main = 39,
    MonitorPu1Aux = 40,
    MonitorPu2Main = 41,
    MonitorPu2Aux = 42,
    Gbtx2PrbsChk = 43,
    Pa3Fifo = 44,
    AlpideControlMonitor = 45,
    Pa3FifoMonitor = 46,
    DataLaneIb = 47,
    DataLaneOb = 48,
    CalibrationLane = 49,
    ReadoutMaster = 50,
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", *self as u8)
    }
}

/// Implemented (via `#[derive(RegisterMap)]`) by the register enum of every module
pub trait RegisterMap: Copy + 'static {
    /// Every register of the module, in address order
    const ALL: &'static [Self];

    fn addr(self) -> u8;

    fn name(self) -> &'static str;

    fn from_addr(addr: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.addr() == addr)
    }
}

/// Implemented (via `#[address(..)]`) by packed register structs that live at a fixed address
pub trait Address {
    fn addr() -> u8;
}

/// A module's view of the channel it lives on
#[derive(Debug)]
pub struct ModuleHandle<T> {
    /// Upwards pointer to the parent class' transport
    master: Weak<Mutex<WishboneMaster<T>>>,
    id: ModuleId,
}

impl<T> Clone for ModuleHandle<T> {
    fn clone(&self) -> Self {
        Self {
            master: self.master.clone(),
            id: self.id,
        }
    }
}

impl<T> ModuleHandle<T>
where
    T: Transport,
{
    pub fn new(master: Weak<Mutex<WishboneMaster<T>>>, id: ModuleId) -> Self {
        Self { master, id }
    }

    #[must_use]
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Handle to another module on the same channel
    #[must_use]
    pub fn sibling(&self, id: ModuleId) -> Self {
        Self {
            master: self.master.clone(),
            id,
        }
    }

    /// Runs `f` with exclusive access to the channel
    /// # Errors
    /// Returns [`Error::ChannelClosed`] if the board was dropped, otherwise whatever `f` returns
    pub fn with<R>(&self, f: impl FnOnce(&mut WishboneMaster<T>) -> Result<R>) -> Result<R> {
        let marc = self.master.upgrade().ok_or(Error::ChannelClosed)?;
        let mut master = marc.lock().map_err(|_| Error::ChannelClosed)?;
        f(&mut master)
    }

    /// Writes `data` to register `reg` of this module and commits it
    /// # Errors
    /// Returns an error on bad transport
    pub fn write<R: RegisterMap>(&self, reg: R, data: u16) -> Result<()> {
        self.write_addr(reg.addr(), data)
    }

    /// Queues a write to register `reg` of this module
    /// # Errors
    /// Returns an error on bad transport
    pub fn queue_write<R: RegisterMap>(&self, reg: R, data: u16) -> Result<()> {
        let id = self.id as u8;
        self.with(|m| m.queue_write(id, reg.addr(), data))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn write_addr(&self, addr: u8, data: u16) -> Result<()> {
        let id = self.id as u8;
        self.with(|m| m.write(id, addr, data, true))
    }

    /// Reads register `reg` of this module
    /// # Errors
    /// Returns an error on bad transport or if the slave flags the read
    pub fn read<R: RegisterMap>(&self, reg: R) -> Result<u16> {
        self.read_addr(reg.addr())
    }

    /// # Errors
    /// Returns an error on bad transport or if the slave flags the read
    pub fn read_addr(&self, addr: u8) -> Result<u16> {
        let id = self.id as u8;
        self.with(|m| m.read(id, addr))
    }

    /// Reads several registers in one batch, the results follow the order of `regs`
    /// # Errors
    /// Returns an error on bad transport or if the slave flags any of the reads
    pub fn read_many<R: RegisterMap>(&self, regs: &[R]) -> Result<Vec<u16>> {
        let id = self.id as u8;
        self.with(|m| {
            for reg in regs {
                m.queue_read(id, reg.addr())?;
            }
            let replies = m.flush_and_read_results(regs.len())?;
            Ok(replies.iter().map(|r| r.data).collect())
        })
    }

    /// Combines `regs` (least significant first) into one wide value
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_wide<R: RegisterMap>(&self, regs: &[R]) -> Result<u64> {
        Ok(self
            .read_many(regs)?
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, v)| acc | (u64::from(*v) << (16 * i))))
    }

    /// Reads a packed register struct from its address
    /// # Errors
    /// Returns an error on bad transport or an unpackable value
    pub fn read_packed<P>(&self) -> Result<P>
    where
        P: PackedStruct<ByteArray = [u8; 2]> + Address,
    {
        let raw = self.read_addr(P::addr())?;
        Ok(P::unpack(&raw.to_be_bytes())?)
    }

    /// Writes a packed register struct to its address
    /// # Errors
    /// Returns an error on bad transport
    pub fn write_packed<P>(&self, value: &P) -> Result<()>
    where
        P: PackedStruct<ByteArray = [u8; 2]> + Address,
    {
        let raw = u16::from_be_bytes(value.pack()?);
        self.write_addr(P::addr(), raw)
    }

    /// Queues a hardware wait of `cycles` wishbone clock cycles and commits it
    /// # Errors
    /// Returns an error on bad transport
    pub fn wait(&self, cycles: u32) -> Result<()> {
        self.with(|m| m.wait(cycles, true))
    }

    /// Lets the board settle for `duration` of wall time
    /// # Errors
    /// Returns an error on bad transport
    pub fn settle(&self, duration: Duration) -> Result<()> {
        self.with(|m| m.settle(duration))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn flush(&self) -> Result<()> {
        self.with(WishboneMaster::flush)
    }

    /// Lists every register of `R` as `- NAME : 0xVVVV`, tolerating failed reads
    /// # Errors
    /// Returns an error if the channel is gone
    pub fn dump_config<R: RegisterMap>(&self, title: &str) -> Result<String> {
        let id = self.id as u8;
        self.with(|m| {
            let mut out = format!("--- {title} module ---\n");
            let was_enabled = m.rderr_exception();
            m.disable_rderr_exception();
            for reg in R::ALL {
                m.queue_read(id, reg.addr())?;
            }
            let replies = m.flush_and_read_results(R::ALL.len());
            if was_enabled {
                m.enable_rderr_exception();
            }
            for (reg, reply) in R::ALL.iter().zip(replies?.iter()) {
                write_dump_line(&mut out, reg.name(), reply);
            }
            Ok(out)
        })
    }
}

fn write_dump_line(out: &mut String, name: &str, reply: &Reply) {
    // Writing into a String can't fail
    let _ = if reply.error {
        writeln!(out, "    - {name} : FAILED")
    } else {
        writeln!(out, "    - {name} : {:#06X}", reply.data)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        modules::gbt_packer::GbtPackerRegister,
        transport::mock::Mock,
    };
    use num_traits::FromPrimitive;
    use paste::paste;
    use std::sync::Arc;

    fn handle(id: ModuleId) -> (Arc<Mutex<WishboneMaster<Mock>>>, ModuleHandle<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), id);
        (master, handle)
    }

    macro_rules! test_rw_reg {
        ($reg:ident, $v:literal) => {
            paste! {
                #[test]
                fn [<test_rw_ $reg:snake>]() {
                    let (_master, packer) = handle(ModuleId::GbtPacker);
                    packer.write(GbtPackerRegister::$reg, $v).unwrap();
                    assert_eq!(packer.read(GbtPackerRegister::$reg).unwrap(), $v);
                }
            }
        };
    }

    test_rw_reg!(TimeoutToStart, 0xDEAD);
    test_rw_reg!(TimeoutStartStop, 0x0BEE);
    test_rw_reg!(TimeoutInIdle, 0x1234);
    test_rw_reg!(SkipItsPayload, 0x1);

    #[test]
    fn test_module_ids() {
        assert_eq!(ModuleId::from_u8(16), Some(ModuleId::TriggerHandler));
        assert_eq!(ModuleId::from_u8(50), Some(ModuleId::ReadoutMaster));
        assert_eq!(ModuleId::from_u8(51), None);
        assert_eq!(ModuleId::I2cPu2Aux.to_string(), "I2cPu2Aux(36)");
    }

    #[test]
    fn test_closed_channel() {
        let (master, packer) = handle(ModuleId::GbtPacker);
        drop(master);
        assert!(matches!(
            packer.read(GbtPackerRegister::Reset),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn test_dump_config() {
        let (_master, packer) = handle(ModuleId::GbtPacker);
        packer.write(GbtPackerRegister::TimeoutInIdle, 0x42).unwrap();
        let dump = packer.dump_config::<GbtPackerRegister>("GBT PACKER").unwrap();
        assert!(dump.starts_with("--- GBT PACKER module ---"));
        assert!(dump.contains("    - TIMEOUT_IN_IDLE : 0x0042"));
        // The exception setting is restored
        assert!(packer.with(|m| Ok(m.rderr_exception())).unwrap());
    }

    #[test]
    fn test_from_addr() {
        assert_eq!(
            GbtPackerRegister::from_addr(2),
            Some(GbtPackerRegister::TimeoutInIdle)
        );
        assert_eq!(GbtPackerRegister::from_addr(0x40), None);
    }
}
