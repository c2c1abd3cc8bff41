//! The two I2C buses of a Power Unit.
//!
//! The main bus reaches the DACs, ADCs, RTD converters and the bias IO expander, the auxiliary bus
//! the two IO expanders that switch the power channels. Both masters share the same read protocol:
//! writing a transaction id to a read address starts the I2C read, whose result is pushed into a
//! FIFO together with that id.
use crate::{
    core::{
        ModuleHandle,
        ModuleId,
        RegisterMap,
    },
    error::{
        ensure_range,
        Error,
        Result,
    },
    modules::monitor::{
        CounterMonitor,
        PU_MONITOR,
    },
    transport::Transport,
};
use kstring::KString;
use std::collections::BTreeMap;
use swt::FIFO_DEPTH;
use tracing::{
    debug,
    info,
    warn,
};

/// Registers of the main bus master
#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum PuMainRegister {
    InternalRegister = 0x00,
    TempThreshConfig = 0x01,
    ThresCurr0 = 0x02,
    ThresCurr1 = 0x03,
    ThresCurr2 = 0x04,
    ThresCurr3 = 0x05,
    PotPower0 = 0x06,
    PotPower1 = 0x07,
    PotPower2 = 0x08,
    PotPower3 = 0x09,
    PotBias = 0x0A,
    AdcSetup0 = 0x0B,
    AdcSetup1 = 0x0C,
    AdcSetup2 = 0x0D,
    AdcSetup3 = 0x0E,
    AdcBiasSetup = 0x0F,
    Adc0 = 0x10,
    Adc1 = 0x11,
    Adc2 = 0x12,
    Adc3 = 0x13,
    AdcBias = 0x14,
    Reserved0 = 0x15,
    IoExpanderBias = 0x16,
    TempThreshRd = 0x17,
    Adc0Read = 0x18,
    Adc1Read = 0x19,
    Adc2Read = 0x1A,
    Adc3Read = 0x1B,
    AdcBiasRead = 0x1C,
    Reserved1 = 0x1D,
    IoExpanderBiasRead = 0x1E,
    TempThreshRdRead = 0x1F,
    I2cDataEmpty = 0x20,
    I2cData = 0x21,
}

/// Registers of the auxiliary bus master
#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum PuAuxRegister {
    Reserved = 0x0,
    IoExpanderPower0 = 0x1,
    IoExpanderPower1 = 0x2,
    IoExpanderPower0Read = 0x3,
    IoExpanderPower1Read = 0x4,
    I2cDataEmpty = 0x5,
    I2cData = 0x6,
}

/// Which of the two Power Unit connectors of the board
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PuConnector {
    One,
    Two,
}

impl PuConnector {
    /// Module of the I2C master driving `bus`
    #[must_use]
    pub fn bus(self, bus: PuBus) -> ModuleId {
        match (self, bus) {
            (PuConnector::One, PuBus::Main) => ModuleId::I2cPu1,
            (PuConnector::One, PuBus::Aux) => ModuleId::I2cPu1Aux,
            (PuConnector::Two, PuBus::Main) => ModuleId::I2cPu2,
            (PuConnector::Two, PuBus::Aux) => ModuleId::I2cPu2Aux,
        }
    }

    /// Module counting the transactions of `bus`
    #[must_use]
    pub fn monitor(self, bus: PuBus) -> ModuleId {
        match (self, bus) {
            (PuConnector::One, PuBus::Main) => ModuleId::MonitorPu1Main,
            (PuConnector::One, PuBus::Aux) => ModuleId::MonitorPu1Aux,
            (PuConnector::Two, PuBus::Main) => ModuleId::MonitorPu2Main,
            (PuConnector::Two, PuBus::Aux) => ModuleId::MonitorPu2Aux,
        }
    }

    #[must_use]
    pub fn controller(self) -> ModuleId {
        match self {
            PuConnector::One => ModuleId::I2cPu1Controller,
            PuConnector::Two => ModuleId::I2cPu2Controller,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PuBus {
    Main,
    Aux,
}

impl PuBus {
    /// Polls of the FIFO status before a read is given up
    #[must_use]
    pub fn max_retries(self) -> usize {
        match self {
            PuBus::Main => 10_000,
            PuBus::Aux => 1_000,
        }
    }

    #[must_use]
    pub fn data_empty_addr(self) -> u8 {
        match self {
            PuBus::Main => PuMainRegister::I2cDataEmpty.addr(),
            PuBus::Aux => PuAuxRegister::I2cDataEmpty.addr(),
        }
    }

    #[must_use]
    pub fn data_addr(self) -> u8 {
        match self {
            PuBus::Main => PuMainRegister::I2cData.addr(),
            PuBus::Aux => PuAuxRegister::I2cData.addr(),
        }
    }

    /// Whether a write to `addr` starts a read transaction
    #[must_use]
    pub fn is_read_addr(self, addr: u8) -> bool {
        match self {
            PuBus::Main => {
                (PuMainRegister::Adc0Read.addr()..=PuMainRegister::TempThreshRdRead.addr())
                    .contains(&addr)
            }
            PuBus::Aux => (PuAuxRegister::IoExpanderPower0Read.addr()
                ..=PuAuxRegister::IoExpanderPower1Read.addr())
                .contains(&addr),
        }
    }

    fn monitor_name(self) -> &'static str {
        match self {
            PuBus::Main => "PU MAIN MONITOR",
            PuBus::Aux => "PU AUX MONITOR",
        }
    }
}

const TID_MASK: u16 = 0x7FFF;
const EMPTY_FLAG: u16 = 0x8000;
/// Wishbone cycles between two polls of the FIFO status
const POLL_CYCLES: u32 = 1000;
/// Wishbone cycles given to in-flight transactions before stale results are drained
const DRAIN_SETTLE_CYCLES: u32 = 800_000;

/// State of the result FIFO
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FifoStatus {
    pub empty: bool,
    /// Transaction id of the entry at the head of the FIFO
    pub tid: u16,
}

impl From<u16> for FifoStatus {
    fn from(raw: u16) -> Self {
        Self {
            empty: raw & EMPTY_FLAG != 0,
            tid: raw & TID_MASK,
        }
    }
}

/// The I2C master of one Power Unit bus, with the monitor counting its transactions
#[derive(Debug)]
pub struct I2cBridge<T> {
    handle: ModuleHandle<T>,
    bus: PuBus,
    monitor: CounterMonitor<T>,
}

impl<T> I2cBridge<T>
where
    T: Transport,
{
    /// Builds the bridge of `bus` on Power Unit `connector`, `handle` may point at any module of
    /// the board
    pub fn new(handle: &ModuleHandle<T>, connector: PuConnector, bus: PuBus) -> Self {
        Self {
            handle: handle.sibling(connector.bus(bus)),
            bus,
            monitor: CounterMonitor::new(
                handle.sibling(connector.monitor(bus)),
                bus.monitor_name(),
                PU_MONITOR,
            ),
        }
    }

    #[must_use]
    pub fn bus(&self) -> PuBus {
        self.bus
    }

    #[must_use]
    pub fn monitor(&self) -> &CounterMonitor<T> {
        &self.monitor
    }

    /// Starts an I2C write, which needs no reply
    /// # Errors
    /// Returns an error on bad transport
    pub fn write<R: RegisterMap>(&self, reg: R, data: u16) -> Result<()> {
        self.handle.write(reg, data)
    }

    /// Queues an I2C write without committing it
    /// # Errors
    /// Returns an error on bad transport
    pub fn queue_write<R: RegisterMap>(&self, reg: R, data: u16) -> Result<()> {
        self.handle.queue_write(reg, data)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn fifo_status(&self) -> Result<FifoStatus> {
        Ok(self.handle.read_addr(self.bus.data_empty_addr())?.into())
    }

    /// Reads one value through the result FIFO, with a fresh transaction id
    /// # Errors
    /// See [`Self::read_with_tid`]
    pub fn read<R: RegisterMap>(&self, reg: R) -> Result<u16> {
        let tid = self.handle.with(|m| Ok(m.next_tid()))?;
        self.read_with_tid(reg, tid)
    }

    /// Reads one value through the result FIFO.
    ///
    /// Stale results left by an interrupted transaction are drained (up to the FIFO depth) until
    /// the entry tagged with `tid` reaches the head.
    /// # Errors
    /// Returns [`Error::Timeout`] if no result shows up, [`Error::TransactionIdMismatch`] if the
    /// expected result can't be found, or an error on bad transport
    pub fn read_with_tid<R: RegisterMap>(&self, reg: R, tid: u16) -> Result<u16> {
        let addr = reg.addr();
        ensure_range!(
            self.bus.is_read_addr(addr),
            "{:?} bus register {addr:#04x} is not a read address",
            self.bus
        );
        ensure_range!(tid <= TID_MASK, "transaction id {tid:#06x}");
        self.handle.write_addr(addr, tid)?;
        self.handle.wait(POLL_CYCLES)?;
        let mut status = self.fifo_status()?;
        let mut retries = 0;
        while status.empty && retries < self.bus.max_retries() {
            retries += 1;
            self.handle.wait(POLL_CYCLES)?;
            status = self.fifo_status()?;
        }
        if status.empty {
            return Err(Error::Timeout {
                module: self.handle.id() as u8,
                addr,
                retries,
            });
        }
        if status.tid != tid {
            warn!("transaction_id mismatch 0x{tid:04x}!=0x{:04x}", status.tid);
            self.handle.wait(DRAIN_SETTLE_CYCLES)?;
            let first = status.tid;
            let mut count = 0;
            while status.tid != tid && !status.empty && count < FIFO_DEPTH {
                count += 1;
                self.handle.read_addr(self.bus.data_addr())?;
                status = self.fifo_status()?;
            }
            if status.tid != tid || status.empty {
                return Err(Error::TransactionIdMismatch {
                    expected: tid,
                    found: first,
                });
            }
            info!(
                "Recovered transaction_id mismatch for transaction 0x{tid:04x} after reading {count} previous transactions"
            );
        }
        self.handle.read_addr(self.bus.data_addr())
    }

    /// Drops every result left in the FIFO, returning how many there were
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_fifo(&self) -> Result<usize> {
        let mut count = 0;
        while !self.fifo_status()?.empty && count < FIFO_DEPTH {
            self.handle.read_addr(self.bus.data_addr())?;
            count += 1;
        }
        if count > 0 {
            debug!(bus = ?self.bus, count, "Drained I2C result FIFO");
        }
        Ok(count)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_counters(&self, reset_after: bool) -> Result<BTreeMap<KString, u32>> {
        self.monitor.read_counters(None, true, reset_after)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_counters(&self) -> Result<()> {
        self.monitor.reset_all_counters()
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        match self.bus {
            PuBus::Main => self.handle.dump_config::<PuMainRegister>("PU MAIN"),
            PuBus::Aux => self.handle.dump_config::<PuAuxRegister>("PU AUX"),
        }
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

    fn bridges() -> (
        Arc<Mutex<WishboneMaster<Mock>>>,
        I2cBridge<Mock>,
        I2cBridge<Mock>,
    ) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::Identity);
        let main = I2cBridge::new(&handle, PuConnector::One, PuBus::Main);
        let aux = I2cBridge::new(&handle, PuConnector::One, PuBus::Aux);
        (master, main, aux)
    }

    #[test]
    fn test_read_addresses() {
        assert!(PuBus::Main.is_read_addr(0x18));
        assert!(PuBus::Main.is_read_addr(0x1F));
        assert!(!PuBus::Main.is_read_addr(0x20));
        assert!(PuBus::Aux.is_read_addr(3));
        assert!(!PuBus::Aux.is_read_addr(5));
    }

    #[test]
    fn test_fifo_status_decode() {
        let status = FifoStatus::from(0x8123);
        assert!(status.empty);
        assert_eq!(status.tid, 0x123);
    }

    #[test]
    fn test_expander_readback() {
        let (_master, main, aux) = bridges();
        main.write(PuMainRegister::IoExpanderBias, 0x55).unwrap();
        assert_eq!(main.read(PuMainRegister::IoExpanderBiasRead).unwrap(), 0x55);
        aux.write(PuAuxRegister::IoExpanderPower1, 0x0F).unwrap();
        assert_eq!(aux.read(PuAuxRegister::IoExpanderPower1Read).unwrap(), 0x0F);
        assert!(main.fifo_status().unwrap().empty);
    }

    #[test]
    fn test_not_a_read_address() {
        let (_master, main, _aux) = bridges();
        assert!(matches!(
            main.read(PuMainRegister::PotBias),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_stale_results_recovered() {
        let (master, main, _aux) = bridges();
        main.write(PuMainRegister::IoExpanderBias, 0x33).unwrap();
        {
            let mut m = master.lock().unwrap();
            m.transport_mut().inject_pu_result(ModuleId::I2cPu1, 0x0101, 0xDEAD);
            m.transport_mut().inject_pu_result(ModuleId::I2cPu1, 0x0102, 0xBEEF);
        }
        let value = main
            .read_with_tid(PuMainRegister::IoExpanderBiasRead, 0x0200)
            .unwrap();
        assert_eq!(value, 0x33);
        assert!(main.fifo_status().unwrap().empty);
    }

    #[test]
    fn test_lost_result_is_a_mismatch() {
        let (master, main, _aux) = bridges();
        master
            .lock()
            .unwrap()
            .transport_mut()
            .inject_pu_result(ModuleId::I2cPu1, 0x0101, 0xDEAD);
        master.lock().unwrap().transport_mut().set_pu_silent(true);
        assert!(matches!(
            main.read_with_tid(PuMainRegister::IoExpanderBiasRead, 0x0200),
            Err(Error::TransactionIdMismatch {
                expected: 0x0200,
                found: 0x0101
            })
        ));
    }

    #[test]
    fn test_aux_timeout() {
        let (master, _main, aux) = bridges();
        master.lock().unwrap().transport_mut().set_pu_silent(true);
        assert!(matches!(
            aux.read(PuAuxRegister::IoExpanderPower0Read),
            Err(Error::Timeout { retries: 1000, .. })
        ));
    }

    #[test]
    fn test_reset_fifo() {
        let (master, main, _aux) = bridges();
        {
            let mut m = master.lock().unwrap();
            for tid in 0..5 {
                m.transport_mut().inject_pu_result(ModuleId::I2cPu1, tid, 0);
            }
        }
        assert_eq!(main.reset_fifo().unwrap(), 5);
        assert_eq!(main.reset_fifo().unwrap(), 0);
    }

    #[test]
    fn test_monitor_counts_transactions() {
        let (_master, main, _aux) = bridges();
        main.reset_counters().unwrap();
        main.write(PuMainRegister::PotBias, 0x1100).unwrap();
        let counters = main.read_counters(false).unwrap();
        assert!(counters["COUNTER_COMPLETED_BYTE"] > 0);
        assert_eq!(counters["COUNTER_NOACK_ERROR"], 0);
    }
}
