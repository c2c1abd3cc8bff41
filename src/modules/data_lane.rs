//! Data lanes: the per-lane settings of the inner and outer barrel datapaths, and the counter
//! monitors sitting behind them.
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
    modules::{
        monitor::{
            CounterMonitor,
            DATA_LANE_MONITOR,
            LANE_COUNTER_REGISTERS,
        },
        readout_master::{
            IB_LANES,
            OB_LANES,
        },
    },
    transport::Transport,
};
use kstring::KString;
use std::{
    collections::BTreeMap,
    fmt::Write,
    ops::Range,
};
use swt::FIFO_DEPTH;
use tracing::warn;

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum DataLaneRegister {
    DetectorTimeoutLsb = 0,
    DetectorTimeoutMsb = 1,
    StripDataControl = 2,
    SuppressEmptyControl = 3,
    ErrorSignature0 = 4,
    ErrorSignature1 = 5,
    ErrorSignature2 = 6,
    ErrorSignature3 = 7,
    ErrorSignature4 = 8,
    ErrorSignature5 = 9,
    ErrorSignature6 = 10,
    ErrorSignature7 = 11,
    ErrorSignature8 = 12,
    ErrorSignature9 = 13,
    ErrorSignature10 = 14,
    ErrorSignature11 = 15,
    ErrorSignature12 = 16,
    ErrorSignature13 = 17,
    ErrorSignature14 = 18,
    ErrorSignature15 = 19,
    ErrorSignature16 = 20,
    ErrorSignature17 = 21,
    ErrorSignature18 = 22,
    ErrorSignature19 = 23,
    ErrorSignature20 = 24,
    ErrorSignature21 = 25,
    ErrorSignature22 = 26,
    ErrorSignature23 = 27,
    ErrorSignature24 = 28,
    ErrorSignature25 = 29,
    ErrorSignature26 = 30,
    ErrorSignature27 = 31,
    DebugFifoLane0 = 32,
    DebugFifoLane1 = 33,
    DebugFifoLane2 = 34,
    DebugFifoLane3 = 35,
    DebugFifoLane4 = 36,
    DebugFifoLane5 = 37,
    DebugFifoLane6 = 38,
    DebugFifoLane7 = 39,
    DebugFifoLane8 = 40,
    DebugFifoLane9 = 41,
    DebugFifoLane10 = 42,
    DebugFifoLane11 = 43,
    DebugFifoLane12 = 44,
    DebugFifoLane13 = 45,
    DebugFifoLane14 = 46,
    DebugFifoLane15 = 47,
    DebugFifoLane16 = 48,
    DebugFifoLane17 = 49,
    DebugFifoLane18 = 50,
    DebugFifoLane19 = 51,
    DebugFifoLane20 = 52,
    DebugFifoLane21 = 53,
    DebugFifoLane22 = 54,
    DebugFifoLane23 = 55,
    DebugFifoLane24 = 56,
    DebugFifoLane25 = 57,
    DebugFifoLane26 = 58,
    DebugFifoLane27 = 59,
}

/// Lanes behind each of the two outer barrel lane monitors
pub const OB_LANES_PER_MONITOR: u8 = 14;
pub const DEBUG_FIFO_EMPTY: u16 = 1 << 15;
const BYTE_ERROR: u16 = 1 << 8;
const LANE_NOK: u16 = 1 << 9;

/// One word of a lane's debug FIFO
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LaneFifoEntry {
    /// The 8b10b-decoded byte
    pub data: u8,
    pub byte_error: bool,
    pub lane_nok: bool,
}

impl LaneFifoEntry {
    /// `None` for the empty marker
    #[must_use]
    pub fn decode(raw: u16) -> Option<Self> {
        if raw & DEBUG_FIFO_EMPTY != 0 {
            return None;
        }
        Some(Self {
            data: raw.to_le_bytes()[0],
            byte_error: raw & BYTE_ERROR != 0,
            lane_nok: raw & LANE_NOK != 0,
        })
    }
}

#[derive(Debug)]
pub struct DataLane<T> {
    handle: ModuleHandle<T>,
    lanes: u8,
}

impl<T> DataLane<T>
where
    T: Transport,
{
    /// The nine GTH lanes, `handle` pointing anywhere on the channel
    #[allow(clippy::cast_possible_truncation)]
    pub fn inner(handle: &ModuleHandle<T>) -> Self {
        Self {
            handle: handle.sibling(ModuleId::DataLaneIb),
            lanes: IB_LANES as u8,
        }
    }

    /// The 28 GPIO lanes
    #[allow(clippy::cast_possible_truncation)]
    pub fn outer(handle: &ModuleHandle<T>) -> Self {
        Self {
            handle: handle.sibling(ModuleId::DataLaneOb),
            lanes: OB_LANES as u8,
        }
    }

    #[must_use]
    pub fn lanes(&self) -> u8 {
        self.lanes
    }

    fn check_lane(&self, lane: u8) -> Result<()> {
        ensure_range!(lane < self.lanes, "lane {lane} of {}", self.lanes);
        Ok(())
    }

    /// Time a lane may stay silent after a trigger before it's declared timed out, in 6.25 ns units
    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_detector_timeout(&self, timeout: u32) -> Result<()> {
        let [lsb, msb] = [timeout & 0xFFFF, timeout >> 16].map(|half| half as u16);
        self.handle
            .queue_write(DataLaneRegister::DetectorTimeoutLsb, lsb)?;
        self.handle
            .write(DataLaneRegister::DetectorTimeoutMsb, msb)
    }

    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn detector_timeout(&self) -> Result<u32> {
        Ok(self.handle.read_wide(&[
            DataLaneRegister::DetectorTimeoutLsb,
            DataLaneRegister::DetectorTimeoutMsb,
        ])? as u32)
    }

    /// Lets the lanes strip the sensor data down to the chip headers and trailers
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_strip_data(&self, allow: bool) -> Result<()> {
        self.handle
            .write(DataLaneRegister::StripDataControl, u16::from(allow))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn strip_data(&self) -> Result<bool> {
        Ok(self.handle.read(DataLaneRegister::StripDataControl)? & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_suppress_empty(&self, allow: bool) -> Result<()> {
        warn!("Suppressing empty events is not implemented in firmware, the setting has no effect");
        self.handle
            .write(DataLaneRegister::SuppressEmptyControl, u16::from(allow))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn suppress_empty(&self) -> Result<bool> {
        Ok(self.handle.read(DataLaneRegister::SuppressEmptyControl)? & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown lane
    pub fn error_signature(&self, lane: u8) -> Result<u16> {
        self.check_lane(lane)?;
        self.handle
            .read_addr(DataLaneRegister::ErrorSignature0.addr() + lane)
    }

    /// Pops the debug FIFO of `lane` until it reports empty
    /// # Errors
    /// Returns an error on bad transport or an unknown lane
    pub fn debug_fifo(&self, lane: u8) -> Result<Vec<LaneFifoEntry>> {
        self.check_lane(lane)?;
        let addr = DataLaneRegister::DebugFifoLane0.addr() + lane;
        let mut entries = vec![];
        for _ in 0..FIFO_DEPTH {
            match LaneFifoEntry::decode(self.handle.read_addr(addr)?) {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        let title = match self.handle.id() {
            ModuleId::DataLaneIb => "DATA LANE IB",
            _ => "DATA LANE OB",
        };
        self.handle.dump_config::<DataLaneRegister>(title)
    }
}

/// Per-lane counters of a data lane monitor. The outer barrel splits its lanes over two monitors.
#[derive(Debug)]
pub struct LaneMonitor<T> {
    handle: ModuleHandle<T>,
    name: &'static str,
    /// Lanes counted by this monitor, numbered across the barrel
    lanes: Range<u8>,
}

impl<T> LaneMonitor<T>
where
    T: Transport,
{
    #[allow(clippy::cast_possible_truncation)]
    pub fn inner(handle: &ModuleHandle<T>) -> Self {
        Self {
            handle: handle.sibling(ModuleId::DatalaneMonitorIb),
            name: "DATALANE MONITOR IB",
            lanes: 0..IB_LANES as u8,
        }
    }

    /// The two monitors of the outer barrel lanes
    #[allow(clippy::cast_possible_truncation)]
    pub fn outer(handle: &ModuleHandle<T>) -> [Self; 2] {
        [
            Self {
                handle: handle.sibling(ModuleId::DatalaneMonitorOb1),
                name: "DATALANE MONITOR OB 1",
                lanes: 0..OB_LANES_PER_MONITOR,
            },
            Self {
                handle: handle.sibling(ModuleId::DatalaneMonitorOb2),
                name: "DATALANE MONITOR OB 2",
                lanes: OB_LANES_PER_MONITOR..OB_LANES as u8,
            },
        ]
    }

    #[must_use]
    pub fn lanes(&self) -> Range<u8> {
        self.lanes.clone()
    }

    /// The counter bank of `lane`
    /// # Errors
    /// Returns an error if this monitor doesn't count `lane`
    pub fn lane(&self, lane: u8) -> Result<CounterMonitor<T>> {
        ensure_range!(
            self.lanes.contains(&lane),
            "lane {lane} not on {} ({:?})",
            self.name,
            self.lanes
        );
        Ok(CounterMonitor::banked(
            self.handle.clone(),
            self.name,
            DATA_LANE_MONITOR,
            (lane - self.lanes.start) * LANE_COUNTER_REGISTERS,
        ))
    }

    /// Snapshots the counters of every lane
    /// # Errors
    /// Returns an error on bad transport
    pub fn latch(&self) -> Result<()> {
        self.lane(self.lanes.start)?.latch()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_all_counters(&self) -> Result<()> {
        self.lane(self.lanes.start)?.reset_all_counters()
    }

    /// # Errors
    /// Returns an error on bad transport or a lane this monitor doesn't count
    pub fn reset_lane_counters(&self, lane: u8) -> Result<()> {
        self.lane(lane)?.reset_table_counters()
    }

    /// Latches once, then reads `names` (all counters when `None`) of every lane
    /// # Errors
    /// Returns an error on bad transport or an unknown counter
    pub fn read_counters(
        &self,
        names: Option<&[&str]>,
    ) -> Result<BTreeMap<u8, BTreeMap<KString, u32>>> {
        self.latch()?;
        self.lanes
            .clone()
            .map(|lane| Ok((lane, self.lane(lane)?.read_counters(names, false, false)?)))
            .collect()
    }

    /// Latches and reads one counter of one lane
    /// # Errors
    /// Returns an error on bad transport, an unknown counter or a lane this monitor doesn't count
    pub fn read_counter(&self, lane: u8, name: &str) -> Result<u32> {
        self.lane(lane)?.read_counter(name)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn dump_config(&self) -> Result<String> {
        let mut out = format!("--- {} module ---\n", self.name);
        for (lane, values) in self.read_counters(None)? {
            let _ = writeln!(out, "--- LANE {lane} ---");
            for (name, value) in &values {
                let _ = writeln!(out, "    - {name} : {value:#010X}");
            }
        }
        Ok(out)
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

    type Master = Arc<Mutex<WishboneMaster<Mock>>>;

    fn board() -> (Master, ModuleHandle<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::Identity);
        (master, handle)
    }

    #[test]
    fn test_register_names() {
        assert_eq!(DataLaneRegister::ALL.len(), 60);
        assert_eq!(DataLaneRegister::ErrorSignature27.addr(), 31);
        assert_eq!(DataLaneRegister::DebugFifoLane0.name(), "DEBUG_FIFO_LANE0");
    }

    #[test]
    fn test_settings() {
        let (_master, handle) = board();
        let lanes = DataLane::outer(&handle);
        lanes.set_detector_timeout(0x0012_3456).unwrap();
        assert_eq!(lanes.detector_timeout().unwrap(), 0x0012_3456);
        lanes.set_strip_data(true).unwrap();
        assert!(lanes.strip_data().unwrap());
        lanes.set_suppress_empty(false).unwrap();
        assert!(!lanes.suppress_empty().unwrap());
        // The inner barrel keeps its own settings
        assert_eq!(DataLane::inner(&handle).detector_timeout().unwrap(), 0);
    }

    #[test]
    fn test_error_signature_and_fifo() {
        let (master, handle) = board();
        let lanes = DataLane::inner(&handle);
        {
            let mut m = master.lock().unwrap();
            let mock = m.transport_mut();
            mock.set_lane_error_signature(ModuleId::DataLaneIb, 4, 0xBEEF);
            mock.push_lane_debug_word(ModuleId::DataLaneIb, 4, 0x00BC);
            mock.push_lane_debug_word(ModuleId::DataLaneIb, 4, 0x0300 | 0x3C);
        }
        assert_eq!(lanes.error_signature(4).unwrap(), 0xBEEF);
        assert_eq!(lanes.error_signature(3).unwrap(), 0);
        assert!(lanes.error_signature(9).is_err());
        let entries = lanes.debug_fifo(4).unwrap();
        assert_eq!(
            entries,
            vec![
                LaneFifoEntry {
                    data: 0xBC,
                    byte_error: false,
                    lane_nok: false,
                },
                LaneFifoEntry {
                    data: 0x3C,
                    byte_error: true,
                    lane_nok: true,
                },
            ]
        );
        assert!(lanes.debug_fifo(4).unwrap().is_empty());
        assert!(lanes.debug_fifo(9).is_err());
    }

    #[test]
    fn test_lane_counters() {
        let (master, handle) = board();
        let [first, second] = LaneMonitor::outer(&handle);
        {
            let mut m = master.lock().unwrap();
            let mock = m.transport_mut();
            mock.count_lane_event(ModuleId::DatalaneMonitorOb1, 2, "PROTOCOL_ERROR", 3);
            mock.count_lane_event(ModuleId::DatalaneMonitorOb1, 2, "LANE_FIFO_START", 0x1_0002);
            // Lane 20 is the seventh of the second monitor
            mock.count_lane_event(ModuleId::DatalaneMonitorOb2, 6, "DATA_OVERRUN", 5);
            mock.count_lane_event(ModuleId::DatalaneMonitorOb2, 6, "BCID_MISMATCH", 7);
        }
        assert_eq!(first.read_counter(2, "PROTOCOL_ERROR").unwrap(), 3);
        assert_eq!(first.read_counter(2, "LANE_FIFO_START").unwrap(), 0x1_0002);
        assert_eq!(first.read_counter(3, "PROTOCOL_ERROR").unwrap(), 0);
        assert!(first.read_counter(20, "PROTOCOL_ERROR").is_err());

        let counts = second.read_counters(Some(&["DATA_OVERRUN", "BCID_MISMATCH"])).unwrap();
        assert_eq!(counts.len(), 14);
        assert_eq!(counts[&20]["DATA_OVERRUN"], 5);
        assert_eq!(counts[&20]["BCID_MISMATCH"], 7);
        assert_eq!(counts[&14]["DATA_OVERRUN"], 0);

        first.reset_lane_counters(2).unwrap();
        assert_eq!(first.read_counter(2, "LANE_FIFO_START").unwrap(), 0);
        assert_eq!(second.read_counter(20, "DATA_OVERRUN").unwrap(), 5);
        second.reset_all_counters().unwrap();
        assert_eq!(second.read_counter(20, "BCID_MISMATCH").unwrap(), 0);
    }

    #[test]
    fn test_inner_monitor_dump() {
        let (master, handle) = board();
        master
            .lock()
            .unwrap()
            .transport_mut()
            .count_lane_event(ModuleId::DatalaneMonitorIb, 8, "8B10B_OOT", 1);
        let monitor = LaneMonitor::inner(&handle);
        assert_eq!(monitor.lanes(), 0..9);
        let dump = monitor.dump_config().unwrap();
        assert!(dump.starts_with("--- DATALANE MONITOR IB module ---"));
        assert!(dump.contains("--- LANE 8 ---"));
        assert!(dump.contains("8B10B_OOT : 0x00000001"));
        assert!(!DataLane::inner(&handle).dump_config().unwrap().contains("FAILED"));
    }
}
