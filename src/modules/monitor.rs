//! Counter monitors.
//!
//! Every monitor slave shares the same layout: a latch register at 0x00, a reset register at 0x01
//! and a bank of counters above. Counters are either 32 bits wide (split over a low and a high
//! register), a single 16-bit register, or one byte of a register shared by two 8-bit counters.
//! One [`CounterMonitor`] type serves them all, parameterised by a static [`CounterDef`] table.
//! Data lane monitors repeat their table once per lane, each bank [`LANE_COUNTER_REGISTERS`] above
//! the previous one.

use crate::{
    core::ModuleHandle,
    error::{
        Error,
        Result,
    },
    transport::Transport,
};
use kstring::KString;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fmt::Write,
};

pub const LATCH_COUNTERS: u8 = 0x00;
pub const RESET_COUNTERS: u8 = 0x01;
pub const LATCH_CMD: u16 = 0x0001;
pub const RESET_ONE_CMD: u16 = 0xF000;
pub const RESET_ALL_CMD: u16 = 0xFFFF;
/// Registers in the counter bank of one data lane
pub const LANE_COUNTER_REGISTERS: u8 = 16;

/// How a counter is laid out over the monitor's registers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CounterWidth {
    /// 32 bits, the upper half at the given address
    Wide { msb: u8 },
    /// A full 16-bit register
    Single,
    /// Upper byte of a shared register
    High,
    /// Lower byte of a shared register
    Low,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CounterDef {
    pub name: &'static str,
    /// Address of the (low half of the) counter
    pub addr: u8,
    pub width: CounterWidth,
}

impl CounterDef {
    #[must_use]
    pub const fn wide(name: &'static str, lsb: u8, msb: u8) -> Self {
        Self {
            name,
            addr: lsb,
            width: CounterWidth::Wide { msb },
        }
    }

    #[must_use]
    pub const fn single(name: &'static str, addr: u8) -> Self {
        Self {
            name,
            addr,
            width: CounterWidth::Single,
        }
    }

    #[must_use]
    pub const fn high(name: &'static str, addr: u8) -> Self {
        Self {
            name,
            addr,
            width: CounterWidth::High,
        }
    }

    #[must_use]
    pub const fn low(name: &'static str, addr: u8) -> Self {
        Self {
            name,
            addr,
            width: CounterWidth::Low,
        }
    }

    /// Registers holding this counter
    #[must_use]
    pub fn registers(&self) -> Vec<u8> {
        match self.width {
            CounterWidth::Wide { msb } => vec![self.addr, msb],
            _ => vec![self.addr],
        }
    }

    /// Extracts the counter from raw register values
    #[must_use]
    pub fn decode(&self, regs: &HashMap<u8, u16>) -> u32 {
        let reg = |a: u8| u32::from(regs.get(&a).copied().unwrap_or_default());
        match self.width {
            CounterWidth::Wide { msb } => reg(self.addr) | (reg(msb) << 16),
            CounterWidth::Single => reg(self.addr),
            CounterWidth::High => (reg(self.addr) >> 8) & 0xFF,
            CounterWidth::Low => reg(self.addr) & 0xFF,
        }
    }

    /// Value of the register at `addr` for a counter value of `value`, if this counter lives there
    #[must_use]
    pub fn encode(&self, addr: u8, value: u32) -> Option<u16> {
        match self.width {
            CounterWidth::Wide { .. } if addr == self.addr => Some((value & 0xFFFF) as u16),
            CounterWidth::Wide { msb } if addr == msb => Some((value >> 16) as u16),
            CounterWidth::Single if addr == self.addr => Some(value.min(0xFFFF) as u16),
            CounterWidth::High if addr == self.addr => Some((value.min(0xFF) as u16) << 8),
            CounterWidth::Low if addr == self.addr => Some(value.min(0xFF) as u16),
            _ => None,
        }
    }
}

/// Looks up a counter by name in `table`
#[must_use]
pub fn find(table: &'static [CounterDef], name: &str) -> Option<&'static CounterDef> {
    table.iter().find(|c| c.name == name)
}

pub const MASTER_MONITOR: &[CounterDef] = &[
    CounterDef::wide("WR_ERRORS", 0x02, 0x03),
    CounterDef::wide("RD_ERRORS", 0x04, 0x05),
    CounterDef::wide("SEE_ERRORS", 0x06, 0x07),
    CounterDef::wide("WR_OPERATIONS", 0x08, 0x09),
    CounterDef::wide("RD_OPERATIONS", 0x0A, 0x0B),
];

pub const TRIGGER_HANDLER_MONITOR: &[CounterDef] = &[
    CounterDef::wide("TRIGGER_SENT", 0x02, 0x03),
    CounterDef::wide("TRIGGER_ECHOED", 0x04, 0x2E),
    CounterDef::single("TRIGGER_FIFO_0_FULL", 0x05),
    CounterDef::single("TRIGGER_FIFO_0_OVERFLOW", 0x06),
    CounterDef::single("TRIGGER_FIFO_1_FULL", 0x07),
    CounterDef::single("TRIGGER_FIFO_1_OVERFLOW", 0x08),
    CounterDef::single("TRIGGER_FIFO_2_FULL", 0x09),
    CounterDef::single("TRIGGER_FIFO_2_OVERFLOW", 0x0A),
    CounterDef::wide("PROCESSED_TRIGGERS", 0x0D, 0x0E),
    CounterDef::wide("TRIGGER_GATED", 0x0F, 0x10),
    CounterDef::wide("TRIGGER_CORRECTED", 0x11, 0x12),
    CounterDef::wide("ORBIT", 0x13, 0x14),
    CounterDef::wide("HB", 0x15, 0x16),
    CounterDef::wide("HBR", 0x17, 0x18),
    CounterDef::wide("HBC", 0x19, 0x1A),
    CounterDef::wide("PHYSICS", 0x1B, 0x1C),
    CounterDef::wide("PP", 0x1D, 0x1E),
    CounterDef::wide("CAL", 0x1F, 0x20),
    CounterDef::wide("SOT", 0x21, 0x22),
    CounterDef::wide("EOT", 0x23, 0x24),
    CounterDef::wide("SOC", 0x25, 0x26),
    CounterDef::wide("EOC", 0x27, 0x28),
    CounterDef::wide("TF", 0x29, 0x2A),
    CounterDef::single("TRIGGER_ILLEGAL_MODE_SWITCH", 0x2B),
    CounterDef::wide("TRIGGER_IGNORED", 0x2C, 0x2D),
    CounterDef::single("FERST", 0x2F),
    CounterDef::single("LOL_TIMEBASE", 0x30),
];

pub const ALPIDE_CONTROL_MONITOR: &[CounterDef] = &[
    CounterDef::wide("OPCODE", 0x02, 0x03),
    CounterDef::wide("BROADCAST", 0x04, 0x05),
    CounterDef::wide("TRIGGER_SENT", 0x06, 0x07),
    CounterDef::wide("OPCODE_REJECTED", 0x08, 0x09),
    CounterDef::wide("PULSE_SENT", 0x0A, 0x0B),
    CounterDef::wide("WRITE_OPCODE", 0x0C, 0x0D),
    CounterDef::wide("READ_OPCODE", 0x0E, 0x0F),
    CounterDef::wide("READ_DONE", 0x10, 0x11),
    CounterDef::wide("CHIPID_MISMATCH", 0x12, 0x13),
];

pub const I2C_GBTX_MONITOR: &[CounterDef] = &[
    CounterDef::wide("COUNTER_COMPLETED_BYTE", 0x02, 0x03),
    CounterDef::wide("COUNTER_AL_ERROR", 0x04, 0x05),
    CounterDef::wide("COUNTER_NOACK_ERROR", 0x06, 0x07),
];

pub const PU_MONITOR: &[CounterDef] = &[
    CounterDef::wide("COUNTER_COMPLETED_BYTE", 0x02, 0x03),
    CounterDef::wide("COUNTER_AL_ERROR", 0x04, 0x05),
    CounterDef::wide("COUNTER_NOACK_ERROR", 0x06, 0x07),
    CounterDef::wide("COUNTER_REQ_FIFO_OVF", 0x08, 0x09),
    CounterDef::wide("COUNTER_RES_FIFO_OVF", 0x0A, 0x0B),
    CounterDef::wide("COUNTER_RES_FIFO_UFL", 0x0C, 0x0D),
];

pub const GBT_PACKER_MONITOR: &[CounterDef] = &[
    CounterDef::wide("TRIGGER_READ", 0x02, 0x03),
    CounterDef::wide("SOP_SENT", 0x04, 0x05),
    CounterDef::wide("EOP_SENT", 0x06, 0x07),
    CounterDef::wide("PACKET_DONE", 0x08, 0x09),
    CounterDef::wide("PACKET_EMPTY", 0x0A, 0x0B),
    CounterDef::high("FIFO_OVERFLOW", 0x0C),
    CounterDef::low("PACKET_TIMEOUT", 0x0C),
    CounterDef::single("FIFO_FULL", 0x0D),
    CounterDef::wide("PACKET_SPLIT", 0x0E, 0x0F),
    CounterDef::high("IDLE_TIMEOUT", 0x10),
    CounterDef::low("START_TIMEOUT", 0x10),
    CounterDef::high("VIOLATION_START", 0x11),
    CounterDef::low("STOP_TIMEOUT", 0x11),
    CounterDef::high("VIOLATION_ACK", 0x12),
    CounterDef::low("VIOLATION_STOP", 0x12),
    CounterDef::high("VIOLATION_NO_VALID_STOP", 0x13),
    CounterDef::low("VIOLATION_NO_VALID_START", 0x13),
    CounterDef::single("VIOLATION_EMPTY", 0x14),
];

/// Counters of one data lane, at the addresses of the first lane's bank
pub const DATA_LANE_MONITOR: &[CounterDef] = &[
    CounterDef::single("8B10B_OOT", 0x02),
    CounterDef::wide("8B10B_OOT_TOLERATED", 0x03, 0x04),
    CounterDef::single("8B10B_OOT_IN_IDLE", 0x05),
    CounterDef::single("PROTOCOL_ERROR", 0x06),
    CounterDef::single("BUSY_EVENT", 0x07),
    CounterDef::single("8B10B_OOT_FATAL", 0x08),
    CounterDef::single("BUSY_VIOLATION", 0x09),
    CounterDef::high("DATA_OVERRUN", 0x0A),
    CounterDef::low("BCID_MISMATCH", 0x0A),
    CounterDef::high("DETECTOR_TIMEOUT", 0x0B),
    CounterDef::low("LANE_FIFO_OVERFLOW", 0x0B),
    CounterDef::single("RATE_OCCUPANCY_LIMIT", 0x0C),
    CounterDef::wide("LANE_FIFO_START", 0x0D, 0x0E),
    CounterDef::wide("LANE_FIFO_STOP", 0x0F, 0x10),
    CounterDef::high("LANE_FIFO_ERROR", 0x11),
    CounterDef::low("LANE_TIMEOUT", 0x11),
];

/// A counter monitor slave
#[derive(Debug)]
pub struct CounterMonitor<T> {
    handle: ModuleHandle<T>,
    name: &'static str,
    counters: &'static [CounterDef],
    /// Added to every counter address of the table
    offset: u8,
}

impl<T> CounterMonitor<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>, name: &'static str, counters: &'static [CounterDef]) -> Self {
        Self::banked(handle, name, counters, 0)
    }

    /// A monitor whose counters sit `offset` registers above the addresses of `counters`
    pub fn banked(
        handle: ModuleHandle<T>,
        name: &'static str,
        counters: &'static [CounterDef],
        offset: u8,
    ) -> Self {
        Self {
            handle,
            name,
            counters,
            offset,
        }
    }

    /// Names of every counter, in table order
    pub fn counter_names(&self) -> impl Iterator<Item = &'static str> {
        self.counters.iter().map(|c| c.name)
    }

    fn lookup(&self, name: &str) -> Result<&'static CounterDef> {
        find(self.counters, name)
            .ok_or_else(|| Error::OutOfRange(format!("{} has no counter {name}", self.name)))
    }

    /// Snapshots every counter into the readable registers
    /// # Errors
    /// Returns an error on bad transport
    pub fn latch(&self) -> Result<()> {
        self.handle.write_addr(LATCH_COUNTERS, LATCH_CMD)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_all_counters(&self) -> Result<()> {
        self.handle.write_addr(RESET_COUNTERS, RESET_ALL_CMD)
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown counter
    pub fn reset_counter(&self, name: &str) -> Result<()> {
        let def = self.lookup(name)?;
        self.handle.write_addr(
            RESET_COUNTERS,
            RESET_ONE_CMD | u16::from(def.addr + self.offset),
        )
    }

    /// Resets every counter of the table one by one, leaving the rest of the slave alone
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_table_counters(&self) -> Result<()> {
        let id = self.handle.id() as u8;
        self.handle.with(|m| {
            for def in self.counters {
                m.queue_write(id, RESET_COUNTERS, RESET_ONE_CMD | u16::from(def.addr + self.offset))?;
            }
            m.flush()
        })
    }

    /// Reads `names` (all counters when `None`) in one batch, optionally latching before and
    /// resetting after the reads.
    /// # Errors
    /// Returns an error on bad transport or an unknown counter
    pub fn read_counters(
        &self,
        names: Option<&[&str]>,
        latch_first: bool,
        reset_after: bool,
    ) -> Result<BTreeMap<KString, u32>> {
        let defs: Vec<&CounterDef> = match names {
            Some(names) => names
                .iter()
                .map(|n| self.lookup(n))
                .collect::<Result<_>>()?,
            None => self.counters.iter().collect(),
        };
        let mut addrs: Vec<u8> = defs.iter().flat_map(|d| d.registers()).collect();
        addrs.sort_unstable();
        addrs.dedup();

        let id = self.handle.id() as u8;
        let replies = self.handle.with(|m| {
            if latch_first {
                m.queue_write(id, LATCH_COUNTERS, LATCH_CMD)?;
            }
            for addr in &addrs {
                m.queue_read(id, addr + self.offset)?;
            }
            if reset_after {
                m.queue_write(id, RESET_COUNTERS, RESET_ALL_CMD)?;
            }
            m.flush_and_read_results(addrs.len())
        })?;
        let regs: HashMap<u8, u16> = replies
            .iter()
            .map(|r| (r.addr.wrapping_sub(self.offset), r.data))
            .collect();
        Ok(defs
            .iter()
            .map(|d| (KString::from_static(d.name), d.decode(&regs)))
            .collect())
    }

    /// Latches and reads one counter
    /// # Errors
    /// Returns an error on bad transport or an unknown counter
    pub fn read_counter(&self, name: &str) -> Result<u32> {
        let values = self.read_counters(Some(&[name]), true, false)?;
        values
            .get(name)
            .copied()
            .ok_or_else(|| Error::OutOfRange(format!("{} has no counter {name}", self.name)))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn dump_config(&self) -> Result<String> {
        let values = self.read_counters(None, true, false)?;
        let mut out = format!("--- {} module ---\n", self.name);
        for (name, value) in &values {
            let _ = writeln!(out, "    - {name} : {value:#010X}");
        }
        Ok(out)
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

    fn monitor() -> (Arc<Mutex<WishboneMaster<Mock>>>, CounterMonitor<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::MasterMonitor);
        (master, CounterMonitor::new(handle, "MASTER MONITOR", MASTER_MONITOR))
    }

    #[test]
    fn test_decode() {
        let regs = HashMap::from([(0x0C, 0xAB_CDu16), (0x02, 0x0001), (0x03, 0x0002)]);
        assert_eq!(find(GBT_PACKER_MONITOR, "FIFO_OVERFLOW").unwrap().decode(&regs), 0xAB);
        assert_eq!(find(GBT_PACKER_MONITOR, "PACKET_TIMEOUT").unwrap().decode(&regs), 0xCD);
        assert_eq!(find(MASTER_MONITOR, "WR_ERRORS").unwrap().decode(&regs), 0x0002_0001);
    }

    #[test]
    fn test_encode() {
        let def = CounterDef::wide("X", 2, 0x2E);
        assert_eq!(def.encode(2, 0x0001_0002), Some(2));
        assert_eq!(def.encode(0x2E, 0x0001_0002), Some(1));
        assert_eq!(def.encode(3, 0x0001_0002), None);
        assert_eq!(CounterDef::high("H", 5).encode(5, 300), Some(0xFF00));
    }

    #[test]
    fn test_errors_counted() {
        let (master, monitor) = monitor();
        monitor.reset_all_counters().unwrap();
        let before = monitor.read_counters(None, true, false).unwrap();
        assert_eq!(before["WR_ERRORS"], 0);
        assert_eq!(before["RD_ERRORS"], 0);
        {
            let mut m = master.lock().unwrap();
            // Identity registers are read-only, the wait register write-only
            m.write(ModuleId::Identity as u8, 0, 1, true).unwrap();
            m.disable_rderr_exception();
            m.read(ModuleId::FwWait as u8, 0).unwrap();
            m.enable_rderr_exception();
        }
        let after = monitor.read_counters(Some(&["WR_ERRORS", "RD_ERRORS"]), true, true).unwrap();
        assert_eq!(after["WR_ERRORS"], 1);
        assert_eq!(after["RD_ERRORS"], 1);
        assert_eq!(monitor.read_counter("WR_ERRORS").unwrap(), 0);
    }

    #[test]
    fn test_unknown_counter() {
        let (_master, monitor) = monitor();
        assert!(matches!(monitor.reset_counter("NOPE"), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_reset_one() {
        let (master, monitor) = monitor();
        {
            let mut m = master.lock().unwrap();
            m.write(ModuleId::Identity as u8, 0, 1, true).unwrap();
        }
        monitor.reset_counter("WR_ERRORS").unwrap();
        assert_eq!(monitor.read_counter("WR_ERRORS").unwrap(), 0);
        assert!(monitor.read_counter("WR_OPERATIONS").unwrap() > 0);
    }
}
