//! An in-memory Readout Unit for tests.
//!
//! The model answers single-word transactions the way the firmware does, runs the trigger
//! handler and sequencer on the frames and idles of the trigger link, and simulates the Power
//! Unit electrically closely enough for the power-on, compensation and interlock logic.
//!
//! Time is one wishbone cycle counter. It only moves on wait instructions, idle bunch crossings,
//! settle periods and trigger frames scheduled in the future, so every test is deterministic.

mod gbtx;
mod pu;
mod trigger;

use super::Transport;
use crate::{
    core::{
        ModuleId,
        RegisterMap,
        ORBIT_BC,
        WB_CLOCK_HZ,
    },
    error::Result,
    i2c::{
        gbtx_bridge::GbtxBridgeRegister,
        pu::{
            PuAuxRegister,
            PuConnector,
            PuMainRegister,
        },
    },
    modules::{
        alpide_control::AlpideControlRegister,
        calibration_lane::CalibrationLaneRegister,
        clock_health::ClockHealthRegister,
        data_lane::{
            DataLaneRegister,
            DEBUG_FIFO_EMPTY,
            OB_LANES_PER_MONITOR,
        },
        gbt_packer::GbtPackerRegister,
        gpio::GpioRegister,
        gth::GthRegister,
        identity::IdentityRegister,
        monitor::{
            find,
            CounterDef,
            ALPIDE_CONTROL_MONITOR,
            DATA_LANE_MONITOR,
            GBT_PACKER_MONITOR,
            I2C_GBTX_MONITOR,
            LANE_COUNTER_REGISTERS,
            LATCH_COUNTERS,
            LATCH_CMD,
            MASTER_MONITOR,
            PU_MONITOR,
            RESET_ALL_CMD,
            RESET_COUNTERS,
            RESET_ONE_CMD,
            TRIGGER_HANDLER_MONITOR,
        },
        readout_master::{
            ReadoutMasterRegister,
            IB_LANES,
        },
        wait::WaitRegister,
    },
    power::{
        controller::PuControllerRegister,
        conversions::RtdSensor,
    },
    trigger::handler::TriggerHandlerRegister,
};
use num_traits::FromPrimitive;
use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    time::Duration,
};
use swt::{
    Reply,
    Swt,
    TriggerFrame,
};
use tracing::{
    debug,
    trace,
};

/// Uptime of a freshly built mock, away from any orbit boundary
const START_CYCLES: u64 = 0x10_0000;
const GIT_HASH: u32 = 0x3F2A_91C4;
const DNA: u128 = 0x0123_4567_89AB_CDEF_0246_8ACE;
/// Front-end id of a layer 5 stave 0 board
const DEFAULT_FEE_ID: u8 = 0x80;
const SEED: u16 = 0x5EED;
const DEAD: u16 = 0xDEAD;
const GTH_LANES: u16 = 0x1FF;
const GTH_RESET_DONE: u16 = 1 << 15;
/// Jitter cleaner and XCKU losses of lock
const CLOCK_EVENT_FLAGS: u16 = 0b1010;

/// Why a slave refused a transaction
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlaveError {
    /// Nothing lives at the address
    Address,
    /// The register doesn't support the operation
    Access,
}

impl SlaveError {
    fn code(self) -> u16 {
        match self {
            SlaveError::Address => 1,
            SlaveError::Access => 2,
        }
    }
}

type SlaveResult<T> = std::result::Result<T, SlaveError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

/// Live and latched values of one counter monitor, per lane for the banked data lane monitors
#[derive(Debug, Clone)]
struct Monitor {
    table: &'static [CounterDef],
    lanes: u8,
    live: HashMap<(&'static str, u8), u32>,
    latched: HashMap<(&'static str, u8), u32>,
}

impl Monitor {
    fn new(table: &'static [CounterDef], lanes: u8) -> Self {
        Self {
            table,
            lanes,
            live: HashMap::new(),
            latched: HashMap::new(),
        }
    }

    fn add(&mut self, name: &str, lane: u8, n: u32) {
        if let Some(def) = find(self.table, name) {
            let counter = self.live.entry((def.name, lane)).or_default();
            *counter = counter.wrapping_add(n);
        }
    }

    fn latch(&mut self) {
        self.latched = self.live.clone();
    }

    /// Lane and first-lane address of register `addr`
    fn unbank(&self, addr: u8) -> Option<(u8, u8)> {
        if self.lanes <= 1 {
            return Some((0, addr));
        }
        let offset = addr.checked_sub(RESET_COUNTERS + 1)?;
        let lane = offset / LANE_COUNTER_REGISTERS;
        (lane < self.lanes).then_some((lane, addr - lane * LANE_COUNTER_REGISTERS))
    }

    fn reset(&mut self, cmd: u16) {
        if cmd == RESET_ALL_CMD {
            self.live.clear();
        } else if cmd & RESET_ONE_CMD == RESET_ONE_CMD {
            let Some((lane, addr)) = self.unbank((cmd & 0xFF) as u8) else {
                return;
            };
            for def in self.table.iter().filter(|d| d.addr == addr) {
                self.live.remove(&(def.name, lane));
            }
        }
    }

    fn holds(&self, addr: u8) -> bool {
        self.unbank(addr)
            .is_some_and(|(_, addr)| self.table.iter().any(|d| d.registers().contains(&addr)))
    }

    fn read(&self, addr: u8) -> u16 {
        let Some((lane, addr)) = self.unbank(addr) else {
            return 0;
        };
        self.table
            .iter()
            .filter_map(|d| {
                let value = self.latched.get(&(d.name, lane)).copied().unwrap_or_default();
                d.encode(addr, value)
            })
            .fold(0, |acc, v| acc | v)
    }
}

fn monitor_table(id: ModuleId) -> Option<&'static [CounterDef]> {
    match id {
        ModuleId::MasterMonitor => Some(MASTER_MONITOR),
        ModuleId::TriggerHandlerMonitor => Some(TRIGGER_HANDLER_MONITOR),
        ModuleId::AlpideControlMonitor => Some(ALPIDE_CONTROL_MONITOR),
        ModuleId::I2cMonitorGbtx => Some(I2C_GBTX_MONITOR),
        ModuleId::MonitorPu1Main
        | ModuleId::MonitorPu1Aux
        | ModuleId::MonitorPu2Main
        | ModuleId::MonitorPu2Aux => Some(PU_MONITOR),
        ModuleId::GbtPacker0Monitor | ModuleId::GbtPacker1Monitor | ModuleId::GbtPacker2Monitor => {
            Some(GBT_PACKER_MONITOR)
        }
        ModuleId::DatalaneMonitorIb
        | ModuleId::DatalaneMonitorOb1
        | ModuleId::DatalaneMonitorOb2 => Some(DATA_LANE_MONITOR),
        _ => None,
    }
}

/// Counter banks of a monitor
#[allow(clippy::cast_possible_truncation)]
fn monitor_lanes(id: ModuleId) -> u8 {
    match id {
        ModuleId::DatalaneMonitorIb => IB_LANES as u8,
        ModuleId::DatalaneMonitorOb1 | ModuleId::DatalaneMonitorOb2 => OB_LANES_PER_MONITOR,
        _ => 1,
    }
}

/// How the wishbone side of `addr` on `id` may be accessed, `None` if nothing lives there
fn access(id: ModuleId, addr: u8) -> Option<Access> {
    use Access::{
        ReadOnly,
        ReadWrite,
        WriteOnly,
    };
    if let Some(table) = monitor_table(id) {
        return if addr == LATCH_COUNTERS || addr == RESET_COUNTERS {
            Some(ReadWrite)
        } else if Monitor::new(table, monitor_lanes(id)).holds(addr) {
            Some(ReadOnly)
        } else {
            None
        };
    }
    match id {
        ModuleId::Identity => IdentityRegister::from_addr(addr).map(|_| ReadOnly),
        ModuleId::FwWait => WaitRegister::from_addr(addr).map(|r| match r {
            WaitRegister::WaitValue => WriteOnly,
            WaitRegister::RstCtrlCntrs => ReadWrite,
            WaitRegister::ReadWaitExecCntr => ReadOnly,
        }),
        ModuleId::GbtPacker => GbtPackerRegister::from_addr(addr).map(|r| match r {
            GbtPackerRegister::GbtxFifoEmpty | GbtPackerRegister::LaneFifoEmpty => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::ClockHealthStatus => ClockHealthRegister::from_addr(addr).map(|r| match r {
            ClockHealthRegister::ResetClockHealthFlags | ClockHealthRegister::ConfigReset => {
                ReadWrite
            }
            _ => ReadOnly,
        }),
        ModuleId::GthControl => GthRegister::from_addr(addr).map(|r| match r {
            GthRegister::AlignmentStatus
            | GthRegister::GthStatus
            | GthRegister::GthRxRstDoneCntr => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::GpioControl => GpioRegister::from_addr(addr).map(|r| match r {
            GpioRegister::AlignmentStatusL | GpioRegister::AlignmentStatusH => ReadOnly,
            r if r.addr() >= GpioRegister::PrbsCounterLane0.addr() => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::DataLaneIb | ModuleId::DataLaneOb => DataLaneRegister::from_addr(addr).map(|r| {
            if r.addr() >= DataLaneRegister::ErrorSignature0.addr() {
                ReadOnly
            } else {
                ReadWrite
            }
        }),
        ModuleId::CalibrationLane => CalibrationLaneRegister::from_addr(addr).map(|_| ReadWrite),
        ModuleId::ReadoutMaster => ReadoutMasterRegister::from_addr(addr).map(|r| match r {
            ReadoutMasterRegister::IbEnabledLanes
            | ReadoutMasterRegister::ObEnabledLanesLsb
            | ReadoutMasterRegister::ObEnabledLanesMsb
            | ReadoutMasterRegister::MaxNokLanes => ReadWrite,
            _ => ReadOnly,
        }),
        ModuleId::AlpideControl => AlpideControlRegister::from_addr(addr).map(|r| match r {
            AlpideControlRegister::ReadStatus
            | AlpideControlRegister::ReadData
            | AlpideControlRegister::ManchesterRxDetected
            | AlpideControlRegister::DbFifoData
            | AlpideControlRegister::DbFifoEmpty
            | AlpideControlRegister::DbFifoRdcount => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::TriggerHandler => TriggerHandlerRegister::from_addr(addr).map(|r| match r {
            TriggerHandlerRegister::OperatingMode
            | TriggerHandlerRegister::TimebaseSynced
            | TriggerHandlerRegister::FifoEmpty
            | TriggerHandlerRegister::DebugFifo => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::I2cGbt => GbtxBridgeRegister::from_addr(addr).map(|r| match r {
            GbtxBridgeRegister::SniffI2c
            | GbtxBridgeRegister::DbFifoData
            | GbtxBridgeRegister::DbFifoEmpty
            | GbtxBridgeRegister::DbFifoRdcnt => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::I2cPu1 | ModuleId::I2cPu2 => PuMainRegister::from_addr(addr).map(|r| match r {
            PuMainRegister::I2cDataEmpty | PuMainRegister::I2cData => ReadOnly,
            _ => ReadWrite,
        }),
        ModuleId::I2cPu1Aux | ModuleId::I2cPu2Aux => {
            PuAuxRegister::from_addr(addr).map(|r| match r {
                PuAuxRegister::I2cDataEmpty | PuAuxRegister::I2cData => ReadOnly,
                _ => ReadWrite,
            })
        }
        ModuleId::I2cPu1Controller | ModuleId::I2cPu2Controller => {
            PuControllerRegister::from_addr(addr).map(|r| match r {
                PuControllerRegister::TempPt0
                | PuControllerRegister::TempPt1
                | PuControllerRegister::TempPt2
                | PuControllerRegister::Tripped
                | PuControllerRegister::EnablePwr
                | PuControllerRegister::EnableBias
                | PuControllerRegister::TrippedPwr
                | PuControllerRegister::TrippedBias => ReadOnly,
                r if (PuControllerRegister::Adc00.addr()..=PuControllerRegister::Adc34.addr())
                    .contains(&r.addr()) =>
                {
                    ReadOnly
                }
                _ => ReadWrite,
            })
        }
        _ => None,
    }
}

/// Power-up value of a plain register
#[allow(clippy::cast_possible_truncation)]
fn default_value(id: ModuleId, addr: u8) -> u16 {
    match (id, addr) {
        (ModuleId::GbtPacker, a) if a == GbtPackerRegister::GbtxFifoEmpty.addr() => 0x7,
        (ModuleId::GbtPacker, a) if a == GbtPackerRegister::LaneFifoEmpty.addr() => 0x1,
        (ModuleId::ReadoutMaster, a) if a == ReadoutMasterRegister::Status.addr() => 0b111,
        (ModuleId::AlpideControl, a) if a == AlpideControlRegister::SetDctrlTxMask.addr() => 0x1F,
        (ModuleId::AlpideControl, a)
            if (AlpideControlRegister::SetDclkParallel0.addr()
                ..=AlpideControlRegister::SetDclkParallel4.addr())
                .contains(&a) =>
        {
            0xFF
        }
        (ModuleId::AlpideControl, a)
            if a == AlpideControlRegister::ManchesterRxDetected.addr()
                || a == AlpideControlRegister::DbFifoEmpty.addr() =>
        {
            1
        }
        (ModuleId::TriggerHandler, a) if a == TriggerHandlerRegister::TriggerPeriod.addr() => {
            ORBIT_BC as u16
        }
        (ModuleId::TriggerHandler, a) if a == TriggerHandlerRegister::FifoEmpty.addr() => 0x7,
        (ModuleId::TriggerHandler, a)
            if (TriggerHandlerRegister::InternalTrgGrantLsb.addr()
                ..=TriggerHandlerRegister::InternalTrgGrantMsb.addr())
                .contains(&a) =>
        {
            0xFFFF
        }
        (ModuleId::I2cPu1Controller | ModuleId::I2cPu2Controller, a)
            if a == PuControllerRegister::MaxAdc.addr() =>
        {
            0xFFF0
        }
        _ => 0,
    }
}

/// A simulated Readout Unit behind both links
#[derive(Debug)]
pub struct Mock {
    /// Wishbone clock cycles since power up
    cycles: u64,
    fee_id: u8,
    uplink: VecDeque<[u8; 4]>,
    regs: HashMap<(ModuleId, u8), u16>,
    monitors: HashMap<ModuleId, Monitor>,
    wait_count: u16,
    gth_locked: u16,
    gbtx: gbtx::GbtxBus,
    pus: [pu::PowerUnitModel; 2],
    pu_silent: bool,
    trigger: trigger::TriggerModel,
    /// Debug FIFO words of each data lane
    lane_fifos: HashMap<(ModuleId, u8), VecDeque<u16>>,
}

impl Default for Mock {
    fn default() -> Self {
        Self::new()
    }
}

impl Mock {
    #[must_use]
    pub fn new() -> Self {
        Self::with_fee_id(DEFAULT_FEE_ID)
    }

    /// A board whose dipswitches encode `fee_id`
    #[must_use]
    pub fn with_fee_id(fee_id: u8) -> Self {
        let monitors = (0..=ModuleId::ReadoutMaster as u8)
            .filter_map(ModuleId::from_u8)
            .filter_map(|id| monitor_table(id).map(|t| (id, Monitor::new(t, monitor_lanes(id)))))
            .collect();
        Self {
            cycles: START_CYCLES,
            fee_id,
            uplink: VecDeque::new(),
            regs: HashMap::new(),
            monitors,
            wait_count: 0,
            gth_locked: GTH_LANES,
            gbtx: gbtx::GbtxBus::new(),
            pus: [pu::PowerUnitModel::new(), pu::PowerUnitModel::new()],
            pu_silent: false,
            trigger: trigger::TriggerModel::default(),
            lane_fifos: HashMap::new(),
        }
    }

    // Time

    /// Bunch crossings since power up
    #[must_use]
    pub fn now_bc(&self) -> u64 {
        self.cycles / 4
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn orbit(&self) -> u32 {
        (self.now_bc() / u64::from(ORBIT_BC)) as u32
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bc_in_orbit(&self) -> u16 {
        (self.now_bc() % u64::from(ORBIT_BC)) as u16
    }

    /// Bunch crossing (in the current orbit) of the next internal continuous trigger
    #[must_use]
    pub fn next_internal_slot_bc(&self) -> u16 {
        let period = self.reg(ModuleId::TriggerHandler, TriggerHandlerRegister::TriggerPeriod.addr()).max(1);
        self.bc_in_orbit().div_ceil(period) * period
    }

    /// Runs every scheduled trigger event up to (excluding) `target` cycles
    fn advance_to(&mut self, target: u64) {
        while let Some(bc) = self.next_trigger_event(target) {
            self.cycles = self.cycles.max(bc * 4);
            self.run_trigger_event(bc);
        }
        self.cycles = self.cycles.max(target);
    }

    fn advance(&mut self, cycles: u64) {
        self.advance_to(self.cycles + cycles);
    }

    // Identity

    #[must_use]
    pub fn git_hash(&self) -> u32 {
        GIT_HASH
    }

    /// The 96-bit FPGA DNA
    #[must_use]
    pub fn dna(&self) -> u128 {
        DNA
    }

    #[must_use]
    pub fn fee_id(&self) -> u8 {
        self.fee_id
    }

    #[must_use]
    pub fn gbtx_serial(&self, gbtx: usize) -> u16 {
        self.gbtx.serial(gbtx)
    }

    // Fault injection

    /// Queues a reply nobody asked for ahead of the next real ones
    pub fn inject_stale_reply(&mut self, reply: Reply) {
        self.uplink.push_back(reply.to_bytes());
    }

    /// Flags a loss of lock of the jitter cleaner and the XCKU, stamped with the current time
    pub fn raise_clock_event(&mut self) {
        use ClockHealthRegister::*;
        self.clock_health_event(
            CLOCK_EVENT_FLAGS,
            [
                ClkEventTimestampUptimeLsb,
                ClkEventTimestampUptimeCsb,
                ClkEventTimestampUptimeMsb,
                ClkEventTimestampOrbitLsb,
                ClkEventTimestampOrbitCsb,
                ClkEventTimestampOrbitMsb,
            ],
        );
    }

    /// Raises `flags` and stamps uptime and orbit into `stamps` (LSB, CSB, MSB of each)
    pub(super) fn clock_health_event(&mut self, flags: u16, stamps: [ClockHealthRegister; 6]) {
        let id = ModuleId::ClockHealthStatus;
        let raised = self.reg(id, ClockHealthRegister::ClockHealthFlags.addr()) | flags;
        self.set_reg(id, ClockHealthRegister::ClockHealthFlags.addr(), raised);
        let uptime = self.cycles;
        let orbit = u64::from(self.orbit());
        let values = [uptime, uptime >> 16, uptime >> 32, orbit, orbit >> 16, orbit >> 32];
        for (reg, value) in stamps.into_iter().zip(values) {
            self.set_reg(id, reg.addr(), (value & 0xFFFF) as u16);
        }
    }

    /// Makes the CDR of GTH `lane` lose (or regain) lock
    pub fn set_lane_locked(&mut self, lane: u8, locked: bool) {
        if locked {
            self.gth_locked |= 1 << lane;
        } else {
            self.gth_locked &= !(1 << lane);
        }
    }

    /// The next `n` GBTx data transactions are not acknowledged
    pub fn fail_gbtx_transactions(&mut self, n: u32) {
        self.gbtx.fail(n);
    }

    /// Holds SDA of the GBTx bus low until `resets` bus resets were issued
    pub fn set_i2c_stuck(&mut self, resets: u32) {
        self.gbtx.stick(resets);
    }

    /// Pushes a result tagged `tid` into the result FIFO of a Power Unit bus
    pub fn inject_pu_result(&mut self, bus: ModuleId, tid: u16, value: u16) {
        if let Some((connector, bus)) = pu::bus_of(bus) {
            self.pus[pu::index(connector)].fifo(bus).push_back((tid, value));
        }
    }

    /// Drops every Power Unit read from now on, as a disconnected Power Unit would
    pub fn set_pu_silent(&mut self, silent: bool) {
        self.pu_silent = silent;
    }

    pub fn set_rtd_temperature(&mut self, connector: PuConnector, sensor: RtdSensor, celsius: f64) {
        self.pus[pu::index(connector)].rtd[usize::from(sensor.index())] = celsius;
        self.evaluate_power();
    }

    /// Extra resistance the cable adds to the external PT100 loops of `connector`
    pub fn set_rtd_cable_resistance(&mut self, connector: PuConnector, ohms: f64) {
        self.pus[pu::index(connector)].cable = ohms;
        self.evaluate_power();
    }

    /// Load drawn from power `channel` of `connector` while it is on
    pub fn set_pu_current(&mut self, connector: PuConnector, channel: u8, amps: f64) {
        self.pus[pu::index(connector)].draw[usize::from(channel & 0xF)] = amps;
        self.evaluate_power();
    }

    /// Queues a word in the debug FIFO of `lane` of the data lane slave `id`
    pub fn push_lane_debug_word(&mut self, id: ModuleId, lane: u8, word: u16) {
        self.lane_fifos.entry((id, lane)).or_default().push_back(word);
    }

    /// Sets the error signature `lane` of the data lane slave `id` reports
    pub fn set_lane_error_signature(&mut self, id: ModuleId, lane: u8, signature: u16) {
        self.set_reg(id, DataLaneRegister::ErrorSignature0.addr() + lane, signature);
    }

    /// Adds `n` to `counter` of lane `lane` (counted from the monitor's first lane)
    pub fn count_lane_event(&mut self, monitor: ModuleId, lane: u8, counter: &str, n: u32) {
        if let Some(monitor) = self.monitors.get_mut(&monitor) {
            monitor.add(counter, lane, n);
        }
    }

    /// Load added to power `channel` of `connector` while its half-stave is clocked
    pub fn set_pu_clocked_current(&mut self, connector: PuConnector, channel: u8, amps: f64) {
        self.pus[pu::index(connector)].clocked_draw[usize::from(channel & 0xF)] = amps;
        self.evaluate_power();
    }

    /// Output DAC code last written to power `channel` of `connector`
    pub fn pu_dac(&self, connector: PuConnector, channel: u8) -> u8 {
        self.pus[pu::index(connector)].dacs[usize::from(channel & 0xF)]
    }

    /// Offset between the programmed and the real output DAC code of every channel of `connector`
    pub fn set_pu_dac_offset(&mut self, connector: PuConnector, offset: u8) {
        self.pus[pu::index(connector)].dac_offset = offset;
        self.evaluate_power();
    }

    // Register file

    fn reg(&self, id: ModuleId, addr: u8) -> u16 {
        self.regs
            .get(&(id, addr))
            .copied()
            .unwrap_or_else(|| default_value(id, addr))
    }

    fn set_reg(&mut self, id: ModuleId, addr: u8, value: u16) {
        self.regs.insert((id, addr), value);
    }

    fn count(&mut self, id: ModuleId, name: &str, n: u32) {
        if let Some(monitor) = self.monitors.get_mut(&id) {
            monitor.add(name, 0, n);
        }
    }

    /// Monitors latched and reset together with `id`
    fn monitor_group(id: ModuleId) -> Vec<ModuleId> {
        if id == ModuleId::GbtPacker0Monitor {
            vec![
                ModuleId::GbtPacker0Monitor,
                ModuleId::GbtPacker1Monitor,
                ModuleId::GbtPacker2Monitor,
            ]
        } else {
            vec![id]
        }
    }

    fn monitor_write(&mut self, id: ModuleId, addr: u8, data: u16) {
        for member in Self::monitor_group(id) {
            if let Some(monitor) = self.monitors.get_mut(&member) {
                match addr {
                    LATCH_COUNTERS if data & LATCH_CMD != 0 => monitor.latch(),
                    RESET_COUNTERS => monitor.reset(data),
                    _ => {}
                }
            }
        }
    }

    fn identity_read(&self, reg: IdentityRegister) -> u16 {
        let chunk = |value: u128, n: u32| ((value >> (16 * n)) & 0xFFFF) as u16;
        let uptime = u128::from(self.cycles);
        match reg {
            IdentityRegister::GithashLsb => (GIT_HASH & 0xFFFF) as u16,
            IdentityRegister::GithashMsb => (GIT_HASH >> 16) as u16,
            IdentityRegister::Seed => SEED,
            IdentityRegister::Dead1 | IdentityRegister::Dead2 | IdentityRegister::Dead3 => DEAD,
            IdentityRegister::OsLsb => 0,
            IdentityRegister::DipswitchVal => u16::from(self.fee_id) << 2,
            IdentityRegister::DnaChunk0 => chunk(DNA, 0),
            IdentityRegister::DnaChunk1 => chunk(DNA, 1),
            IdentityRegister::DnaChunk2 => chunk(DNA, 2),
            IdentityRegister::DnaChunk3 => chunk(DNA, 3),
            IdentityRegister::DnaChunk4 => chunk(DNA, 4),
            IdentityRegister::DnaChunk5 => chunk(DNA, 5),
            IdentityRegister::UptimeLsb | IdentityRegister::TimeSinceResetLsb => chunk(uptime, 0),
            IdentityRegister::UptimeCsb | IdentityRegister::TimeSinceResetCsb => chunk(uptime, 1),
            IdentityRegister::UptimeMsb | IdentityRegister::TimeSinceResetMsb => chunk(uptime, 2),
        }
    }

    fn gth_status(&self) -> u16 {
        GTH_RESET_DONE | self.gth_locked
    }

    fn read(&mut self, id: ModuleId, addr: u8) -> SlaveResult<u16> {
        match access(id, addr) {
            None => return Err(SlaveError::Address),
            Some(Access::WriteOnly) => return Err(SlaveError::Access),
            Some(_) => {}
        }
        if let Some(monitor) = self.monitors.get(&id) {
            return Ok(match addr {
                LATCH_COUNTERS | RESET_COUNTERS => 0,
                _ => monitor.read(addr),
            });
        }
        let value = match id {
            ModuleId::Identity => IdentityRegister::from_addr(addr)
                .map(|r| self.identity_read(r))
                .ok_or(SlaveError::Address)?,
            ModuleId::FwWait if addr == WaitRegister::ReadWaitExecCntr.addr() => self.wait_count,
            ModuleId::GthControl if addr == GthRegister::GthStatus.addr() => self.gth_status(),
            ModuleId::GthControl if addr == GthRegister::AlignmentStatus.addr() => {
                self.reg(id, GthRegister::EnableAlignment.addr()) & self.gth_locked
            }
            ModuleId::GpioControl if addr == GpioRegister::AlignmentStatusL.addr() => {
                self.reg(id, GpioRegister::EnableAlignmentL.addr())
            }
            ModuleId::GpioControl if addr == GpioRegister::AlignmentStatusH.addr() => {
                self.reg(id, GpioRegister::EnableAlignmentH.addr())
            }
            ModuleId::TriggerHandler => self.trigger_read(addr),
            ModuleId::DataLaneIb | ModuleId::DataLaneOb
                if addr >= DataLaneRegister::DebugFifoLane0.addr() =>
            {
                let lane = addr - DataLaneRegister::DebugFifoLane0.addr();
                self.lane_fifos
                    .get_mut(&(id, lane))
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(DEBUG_FIFO_EMPTY)
            }
            ModuleId::I2cGbt => self.gbtx_read(addr),
            ModuleId::I2cPu1 | ModuleId::I2cPu2 | ModuleId::I2cPu1Aux | ModuleId::I2cPu2Aux => {
                self.pu_bus_read(id, addr)
            }
            ModuleId::I2cPu1Controller | ModuleId::I2cPu2Controller => {
                self.controller_read(id, addr)
            }
            _ => self.reg(id, addr),
        };
        Ok(value)
    }

    fn write(&mut self, id: ModuleId, addr: u8, data: u16) -> SlaveResult<()> {
        match access(id, addr) {
            None => return Err(SlaveError::Address),
            Some(Access::ReadOnly) => return Err(SlaveError::Access),
            Some(_) => {}
        }
        if self.monitors.contains_key(&id) {
            self.monitor_write(id, addr, data);
            return Ok(());
        }
        self.set_reg(id, addr, data);
        match id {
            ModuleId::FwWait if addr == WaitRegister::WaitValue.addr() => {
                self.wait_count = self.wait_count.wrapping_add(1);
                self.advance(u64::from(data));
            }
            ModuleId::FwWait if addr == WaitRegister::RstCtrlCntrs.addr() && data != 0 => {
                self.wait_count = 0;
            }
            ModuleId::ClockHealthStatus
                if addr == ClockHealthRegister::ResetClockHealthFlags.addr() =>
            {
                self.set_reg(id, ClockHealthRegister::ClockHealthFlags.addr(), 0);
            }
            ModuleId::GthControl if addr == GthRegister::GthReset.addr() && data != 0 => {
                let done = self.reg(id, GthRegister::GthRxRstDoneCntr.addr());
                self.set_reg(id, GthRegister::GthRxRstDoneCntr.addr(), done.wrapping_add(1));
            }
            ModuleId::AlpideControl if addr == AlpideControlRegister::WriteCtrl.addr() => {
                #[allow(clippy::cast_possible_truncation)]
                self.alpide_opcode((data >> 8) as u8);
            }
            ModuleId::TriggerHandler => self.trigger_write(addr, data),
            ModuleId::I2cGbt => self.gbtx_write(addr, data),
            ModuleId::I2cPu1 | ModuleId::I2cPu2 | ModuleId::I2cPu1Aux | ModuleId::I2cPu2Aux => {
                self.pu_bus_write(id, addr, data);
            }
            ModuleId::I2cPu1Controller | ModuleId::I2cPu2Controller => {
                self.controller_write(id, addr, data);
            }
            _ => {}
        }
        Ok(())
    }

    /// Counts one opcode sent to the sensors with the current transmit mask
    fn alpide_opcode(&mut self, opcode: u8) {
        let id = ModuleId::AlpideControlMonitor;
        self.count(id, "OPCODE", 1);
        let mask = self.reg(ModuleId::AlpideControl, AlpideControlRegister::SetDctrlTxMask.addr());
        if mask & 0x1F == 0x1F {
            self.count(id, "BROADCAST", 1);
        }
        match opcode {
            0x78 => self.count(id, "PULSE_SENT", 1),
            0x55 => self.count(id, "TRIGGER_SENT", 1),
            0x9C => self.count(id, "WRITE_OPCODE", 1),
            0x4E => self.count(id, "READ_OPCODE", 1),
            _ => {}
        }
    }

    fn transaction(&mut self, swt: Swt) {
        let Some(id) = ModuleId::from_u8(swt.module) else {
            self.count(ModuleId::MasterMonitor, if swt.write { "WR_ERRORS" } else { "RD_ERRORS" }, 1);
            if !swt.write {
                let reply = Reply::error(swt.module, swt.addr, SlaveError::Address.code());
                self.uplink.push_back(reply.to_bytes());
            }
            return;
        };
        if swt.write {
            trace!(%id, addr = swt.addr, data = swt.data, "SWT write");
            self.count(ModuleId::MasterMonitor, "WR_OPERATIONS", 1);
            if self.write(id, swt.addr, swt.data).is_err() {
                debug!(%id, addr = swt.addr, "Write refused");
                self.count(ModuleId::MasterMonitor, "WR_ERRORS", 1);
            }
            self.check_overcurrent();
        } else {
            trace!(%id, addr = swt.addr, "SWT read");
            self.count(ModuleId::MasterMonitor, "RD_OPERATIONS", 1);
            let reply = match self.read(id, swt.addr) {
                Ok(data) => Reply::new(swt.module, swt.addr, data),
                Err(e) => {
                    debug!(%id, addr = swt.addr, ?e, "Read refused");
                    self.count(ModuleId::MasterMonitor, "RD_ERRORS", 1);
                    Reply::error(swt.module, swt.addr, e.code())
                }
            };
            self.uplink.push_back(reply.to_bytes());
        }
    }
}

impl Transport for Mock {
    fn send_swt(&mut self, words: &[[u8; 4]]) -> Result<()> {
        self.evaluate_power();
        for word in words {
            self.transaction(Swt::from_bytes(*word));
        }
        self.evaluate_power();
        Ok(())
    }

    fn receive_swt(&mut self, n: usize) -> Result<Vec<[u8; 4]>> {
        let n = n.min(self.uplink.len());
        Ok(self.uplink.drain(..n).collect())
    }

    fn send_trigger(&mut self, frame: &TriggerFrame) -> Result<()> {
        let at = (u64::from(frame.orbit) * u64::from(ORBIT_BC) + u64::from(frame.bc)) * 4;
        self.advance_to(at.max(self.cycles));
        self.link_frame(frame);
        Ok(())
    }

    fn send_idle(&mut self, bc: u32) -> Result<()> {
        self.advance(u64::from(bc) * 4);
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn settle(&mut self, duration: Duration) {
        self.advance((duration.as_secs_f64() * WB_CLOCK_HZ) as u64);
        self.evaluate_power();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(mock: &mut Mock, id: ModuleId, addr: u8) -> Reply {
        mock.send_swt(&[Swt::read(id as u8, addr).unwrap().to_bytes()])
            .unwrap();
        Reply::from_bytes(mock.receive_swt(1).unwrap()[0])
    }

    fn write(mock: &mut Mock, id: ModuleId, addr: u8, data: u16) {
        mock.send_swt(&[Swt::write(id as u8, addr, data).unwrap().to_bytes()])
            .unwrap();
    }

    #[test]
    fn test_start_time() {
        let mock = Mock::new();
        assert_eq!(mock.now_bc(), 262_144);
        assert_eq!(mock.orbit(), 73);
        assert_eq!(mock.bc_in_orbit(), 1972);
        assert_eq!(mock.next_internal_slot_bc(), 3564);
    }

    #[test]
    fn test_unknown_module() {
        let mut mock = Mock::new();
        let reply = read(&mut mock, ModuleId::Radmon, 0);
        assert!(reply.error);
        assert_eq!(reply.data, 1);
    }

    #[test]
    fn test_wait_moves_time() {
        let mut mock = Mock::new();
        let before = mock.now_bc();
        write(&mut mock, ModuleId::FwWait, WaitRegister::WaitValue.addr(), 400);
        assert_eq!(mock.now_bc(), before + 100);
        assert_eq!(
            read(&mut mock, ModuleId::FwWait, WaitRegister::ReadWaitExecCntr.addr()).data,
            1
        );
    }

    #[test]
    fn test_monitor_latch() {
        let mut mock = Mock::new();
        write(&mut mock, ModuleId::Identity, 0, 0);
        // Nothing latched yet
        assert_eq!(read(&mut mock, ModuleId::MasterMonitor, 2).data, 0);
        write(&mut mock, ModuleId::MasterMonitor, LATCH_COUNTERS, LATCH_CMD);
        assert_eq!(read(&mut mock, ModuleId::MasterMonitor, 2).data, 1);
        write(&mut mock, ModuleId::MasterMonitor, RESET_COUNTERS, RESET_ONE_CMD | 2);
        write(&mut mock, ModuleId::MasterMonitor, LATCH_COUNTERS, LATCH_CMD);
        assert_eq!(read(&mut mock, ModuleId::MasterMonitor, 2).data, 0);
        assert!(read(&mut mock, ModuleId::MasterMonitor, 8).data > 0);
    }

    #[test]
    fn test_gth_lanes() {
        let mut mock = Mock::new();
        mock.set_lane_locked(0, false);
        let status = read(&mut mock, ModuleId::GthControl, GthRegister::GthStatus.addr());
        assert_eq!(status.data, GTH_RESET_DONE | 0x1FE);
    }
}
