//! The trigger handler: turns timing opcodes from the trigger link (or the internal sequencer) into
//! sensor opcodes, subject to the operating mode, opcode gating and the minimum trigger distance.

use crate::{
    core::{
        address,
        Address,
        ModuleHandle,
        ModuleId,
        RegisterMap,
        ORBIT_BC,
    },
    error::{
        ensure_range,
        Error,
        Result,
    },
    modules::monitor::{
        CounterMonitor,
        TRIGGER_HANDLER_MONITOR,
    },
    transport::Transport,
};
use kstring::KString;
use packed_struct::prelude::*;
use std::{
    collections::BTreeMap,
    time::Duration,
};
use swt::FIFO_DEPTH;
use tracing::{
    info,
    warn,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum TriggerHandlerRegister {
    Enable = 0x00,
    TriggerPeriod = 0x01,
    PulseNTrigger = 0x02,
    TriggerMinDistance = 0x03,
    OperatingMode = 0x04,
    OpcodeGating = 0x05,
    TriggerDelay = 0x06,
    EnablePacker0 = 0x07,
    EnablePacker1 = 0x08,
    EnablePacker2 = 0x09,
    TrigSource = 0x0A,
    SoxOrbitLsb = 0x0B,
    SoxOrbitMsb = 0x0C,
    SeqNumHbPerTf = 0x0D,
    EnableTimebaseSync = 0x0E,
    TimebaseSynced = 0x0F,
    SeqEnable = 0x10,
    SeqContinuousNTrg = 0x11,
    SeqNumTf = 0x12,
    SeqNumHbaPerTf = 0x13,
    SeqPtMode = 0x14,
    SeqPtPeriod = 0x15,
    RmRoReset = 0x16,
    FlushFifo = 0x17,
    IgnoreTrgInContMode = 0x18,
    InternalTrgGrantLsb = 0x19,
    InternalTrgGrantCsb = 0x1A,
    InternalTrgGrantMsb = 0x1B,
    FifoEmpty = 0x1C,
    EoxOrbitLsb = 0x1D,
    EoxOrbitMsb = 0x1E,
    DebugFifo = 0x1F,
    EoxOrbitCsb = 0x20,
    SoxOrbitCsb = 0x21,
}

/// Trigger periods (in BC) that divide an orbit evenly, usable in continuous mode
pub const ALLOWED_CONTINUOUS_MODE_PERIOD_BC: [u16; 9] = [3564, 1782, 1188, 891, 594, 396, 324, 297, 198];
pub const MAX_TRIGGER_PERIOD: u16 = 0xFFF;
pub const MAX_TRIGGER_DELAY: u16 = 0x1FF;
/// Smallest distance (in 6.25 ns units) that doesn't lose triggers in the alpide control
pub const MIN_TRIGGER_DISTANCE: u16 = 100;
/// Width of the internal trigger grant mask
pub const GRANT_BITS: u32 = 48;
pub const PACKERS: u8 = 3;

const BC_NS: f64 = 25.0;
/// Words popped from the debug FIFO for one entry
pub(crate) const DEBUG_FIFO_WORDS: usize = 12;
pub(crate) const DEBUG_FIFO_DATA_BITS: usize = 11;
pub(crate) const ORBIT_BC_BITS: usize = 44;
pub(crate) const BC_BITS: usize = 12;

#[derive(PrimitiveEnum_u8, Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum OperatingState {
    #[default]
    Idle = 0,
    Armed = 1,
    Triggered = 2,
    Continuous = 3,
    ContinuousReject = 4,
    TriggeredReject = 5,
    Illegal6 = 6,
    Illegal7 = 7,
}

#[derive(Debug, PackedStruct, Default, Copy, Clone, PartialEq, Eq)]
#[address(0x04)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "2")]
pub struct OperatingMode {
    #[packed_field(bits = "0..=2", ty = "enum")]
    pub state: OperatingState,
    /// No triggers are forwarded to the sensors
    #[packed_field(bits = "3")]
    pub ro_no_det: bool,
}

impl OperatingMode {
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        matches!(
            self.state,
            OperatingState::Triggered | OperatingState::TriggeredReject
        )
    }

    #[must_use]
    pub fn is_continuous(&self) -> bool {
        matches!(
            self.state,
            OperatingState::Continuous | OperatingState::ContinuousReject
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TriggerSource {
    Gbtx2 = 0,
    Sequencer = 1,
}

/// A timing position on the trigger link
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct OrbitBc {
    pub orbit: u32,
    pub bc: u16,
}

impl OrbitBc {
    #[allow(clippy::cast_possible_truncation)]
    fn from_raw(raw: u64) -> Self {
        Self {
            orbit: (raw >> BC_BITS) as u32,
            bc: (raw & ((1 << BC_BITS) - 1)) as u16,
        }
    }
}

/// One entry of the timebase debug FIFO: the frame that broke the timebase and its neighbours
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DebugFifoEntry {
    pub prev: OrbitBc,
    pub error: OrbitBc,
    pub next: OrbitBc,
}

/// Extracts `len` bits starting at `start` from words carrying 11 data bits each
fn debug_field(words: &[u16], start: usize, len: usize) -> u64 {
    (0..len).fold(0, |acc, i| {
        let bit = start + i;
        let word = words.get(bit / DEBUG_FIFO_DATA_BITS).copied().unwrap_or_default();
        acc | (u64::from(word >> (bit % DEBUG_FIFO_DATA_BITS) & 1) << i)
    })
}

impl DebugFifoEntry {
    /// Decodes the words of one entry, `None` if the FIFO was empty
    #[must_use]
    pub fn decode(words: &[u16]) -> Option<Self> {
        if words.first().map_or(true, |w| w >> 15 & 1 == 1) {
            return None;
        }
        let field = |n| OrbitBc::from_raw(debug_field(words, n * ORBIT_BC_BITS, ORBIT_BC_BITS));
        Some(Self {
            prev: field(0),
            error: field(1),
            next: field(2),
        })
    }
}

/// Differences of the monitor counters over a sampling interval
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TriggerCounts {
    pub tf: u32,
    pub hb: u32,
    pub hbr: u32,
    pub hba: u32,
    pub physics: u32,
    pub sent: u32,
    pub processed: u32,
}

impl TriggerCounts {
    #[must_use]
    pub fn between(pre: &BTreeMap<KString, u32>, post: &BTreeMap<KString, u32>) -> Self {
        let diff = |name: &str| {
            post.get(name)
                .copied()
                .unwrap_or_default()
                .wrapping_sub(pre.get(name).copied().unwrap_or_default())
        };
        let hb = diff("HB");
        let hbr = diff("HBR");
        Self {
            tf: diff("TF"),
            hb,
            hbr,
            hba: hb.saturating_sub(hbr),
            physics: diff("PHYSICS"),
            sent: diff("TRIGGER_SENT"),
            processed: diff("PROCESSED_TRIGGERS"),
        }
    }
}

/// Trigger rates per timeframe (TF) and per accepted heartbeat (HBA)
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct TriggerRates {
    pub hb_per_tf: f64,
    pub hba_per_tf: f64,
    pub hbr_per_tf: f64,
    pub pt_per_hba: f64,
    pub sent_per_hba: f64,
    pub processed_per_tf: f64,
}

impl TriggerRates {
    /// # Errors
    /// Returns an error if no timeframe or accepted heartbeat was counted
    pub fn from_counts(counts: &TriggerCounts) -> Result<Self> {
        if counts.tf == 0 {
            return Err(Error::Precondition("Found no timeframes".into()));
        }
        if counts.hba == 0 {
            return Err(Error::Precondition("Found no HBA".into()));
        }
        let tf = f64::from(counts.tf);
        let hba = f64::from(counts.hba);
        Ok(Self {
            hb_per_tf: f64::from(counts.hb) / tf,
            hba_per_tf: hba / tf,
            hbr_per_tf: f64::from(counts.hbr) / tf,
            pt_per_hba: f64::from(counts.physics) / hba,
            sent_per_hba: f64::from(counts.sent) / hba,
            processed_per_tf: f64::from(counts.processed) / tf,
        })
    }
}

impl std::fmt::Display for TriggerRates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HB/TF: {:.1} - HBA/TF: {:.1} - HBR/TF: {:.1} - PT/HBA: {:.1} - SENT/HBA: {:.1} - PROC/TF: {:.1}",
            self.hb_per_tf,
            self.hba_per_tf,
            self.hbr_per_tf,
            self.pt_per_hba,
            self.sent_per_hba,
            self.processed_per_tf
        )
    }
}

#[derive(Debug)]
pub struct TriggerHandler<T> {
    handle: ModuleHandle<T>,
    monitor: CounterMonitor<T>,
}

impl<T> TriggerHandler<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        let monitor = CounterMonitor::new(
            handle.sibling(ModuleId::TriggerHandlerMonitor),
            "TRIGGER HANDLER MONITOR",
            TRIGGER_HANDLER_MONITOR,
        );
        Self { handle, monitor }
    }

    #[must_use]
    pub fn monitor(&self) -> &CounterMonitor<T> {
        &self.monitor
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable(&self) -> Result<()> {
        self.handle.write(TriggerHandlerRegister::Enable, 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable(&self) -> Result<()> {
        self.handle.write(TriggerHandlerRegister::Enable, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_enabled(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::Enable)? == 1)
    }

    fn packer_register(packer: u8) -> Result<u8> {
        ensure_range!(packer < PACKERS, "packer {packer}");
        Ok(TriggerHandlerRegister::EnablePacker0.addr() + packer)
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown packer
    pub fn enable_packer(&self, packer: u8, enable: bool) -> Result<()> {
        self.handle
            .write_addr(Self::packer_register(packer)?, u16::from(enable))
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown packer
    pub fn is_packer_enabled(&self, packer: u8) -> Result<bool> {
        Ok(self.handle.read_addr(Self::packer_register(packer)?)? == 1)
    }

    /// Period of the internal triggers in continuous mode, in BC
    /// # Errors
    /// Returns an error on bad transport or a period outside `1..=0xFFF`
    pub fn set_trigger_period(&self, period_bc: u16) -> Result<()> {
        ensure_range!(
            (1..=MAX_TRIGGER_PERIOD).contains(&period_bc),
            "trigger period {period_bc}"
        );
        self.handle
            .write(TriggerHandlerRegister::TriggerPeriod, period_bc)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_period(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::TriggerPeriod)
    }

    /// Sets the internal trigger period from a frequency in kHz
    /// # Errors
    /// Returns an error on bad transport or a non-positive frequency
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn set_trigger_frequency(&self, frequency_khz: f64) -> Result<()> {
        ensure_range!(frequency_khz > 0.0, "trigger frequency {frequency_khz} kHz");
        let cycles = (1e6 / (frequency_khz * BC_NS)).round();
        let max = f64::from(ORBIT_BC);
        let cycles = if cycles >= max {
            warn!(
                "Minimum trigger frequency selected {:.3} kHz",
                1e6 / (max * BC_NS)
            );
            ORBIT_BC as u16
        } else if cycles < 10.0 {
            warn!(
                "Maximum (theoretical) trigger frequency selected {} kHz",
                1e6 / (10.0 * BC_NS)
            );
            10
        } else {
            cycles as u16
        };
        self.set_trigger_period(cycles)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_frequency(&self) -> Result<f64> {
        Ok(1e6 / (f64::from(self.trigger_period()?) * BC_NS))
    }

    /// Forward PULSE opcodes to the sensors instead of TRIGGER
    /// # Errors
    /// Returns an error on bad transport
    pub fn configure_to_send_pulses(&self) -> Result<()> {
        self.handle.write(TriggerHandlerRegister::PulseNTrigger, 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn configure_to_send_triggers(&self) -> Result<()> {
        self.handle.write(TriggerHandlerRegister::PulseNTrigger, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn sends_pulses(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::PulseNTrigger)? == 1)
    }

    /// Minimum distance between two forwarded triggers, in 6.25 ns units
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_trigger_minimum_distance(&self, distance: u16) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::TriggerMinDistance, distance)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_minimum_distance(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::TriggerMinDistance)
    }

    /// Delay of the forwarded triggers, in BC
    /// # Errors
    /// Returns an error on bad transport or a delay past [`MAX_TRIGGER_DELAY`]
    pub fn set_trigger_delay(&self, delay: u16) -> Result<()> {
        ensure_range!(delay <= MAX_TRIGGER_DELAY, "trigger delay {delay}");
        self.handle.write(TriggerHandlerRegister::TriggerDelay, delay)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_delay(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::TriggerDelay)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn operating_mode(&self) -> Result<OperatingMode> {
        self.handle.read_packed()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_triggered_mode(&self) -> Result<bool> {
        Ok(self.operating_mode()?.is_triggered())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_continuous_mode(&self) -> Result<bool> {
        Ok(self.operating_mode()?.is_continuous())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_ro_no_det(&self) -> Result<bool> {
        Ok(self.operating_mode()?.ro_no_det)
    }

    /// Bunch crossings in a heartbeat frame, fixed by the firmware
    #[must_use]
    pub fn bc_per_hb(&self) -> u32 {
        ORBIT_BC
    }

    /// Gates the sensor opcodes, an HB releases a cleared gate
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_opcode_gating(&self, gate: bool) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::OpcodeGating, u16::from(gate))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn opcode_gating(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::OpcodeGating)? == 1)
    }

    /// Gates the opcodes and disables every packer in one batch
    /// # Errors
    /// Returns an error on bad transport
    pub fn mask_all_triggers(&self) -> Result<()> {
        let id = self.handle.id() as u8;
        self.handle.with(|m| {
            m.queue_write(id, TriggerHandlerRegister::OpcodeGating.addr(), 1)?;
            for packer in 0..PACKERS {
                m.queue_write(id, TriggerHandlerRegister::EnablePacker0.addr() + packer, 0)?;
            }
            m.flush()
        })
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_trigger_source(&self, source: TriggerSource) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::TrigSource, source as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_source(&self) -> Result<TriggerSource> {
        Ok(match self.handle.read(TriggerHandlerRegister::TrigSource)? {
            0 => TriggerSource::Gbtx2,
            _ => TriggerSource::Sequencer,
        })
    }

    /// Toggles the reset of the readout master
    /// # Errors
    /// Returns an error on bad transport, or if triggers are still forwarded to the sensors
    pub fn reset_readout_master(&self) -> Result<()> {
        if !self.is_ro_no_det()? {
            return Err(Error::Precondition(
                "readout master reset requires the RO_NO_DET mode".into(),
            ));
        }
        self.handle.write(TriggerHandlerRegister::RmRoReset, 1)?;
        self.handle.write(TriggerHandlerRegister::RmRoReset, 0)
    }

    /// Toggles the flush of the input FIFO
    /// # Errors
    /// Returns an error on bad transport, or unless both the handler and the timebase sync are disabled
    pub fn flush_fifo(&self) -> Result<()> {
        if self.is_enabled()? {
            return Err(Error::Precondition(
                "FIFO flush requires a disabled trigger handler".into(),
            ));
        }
        if self.timebase_sync_enable()? != 0 {
            return Err(Error::Precondition(
                "FIFO flush requires a disabled timebase sync".into(),
            ));
        }
        self.handle.write(TriggerHandlerRegister::FlushFifo, 1)?;
        self.handle.write(TriggerHandlerRegister::FlushFifo, 0)
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown FIFO
    pub fn is_fifo_empty(&self, fifo: u8) -> Result<bool> {
        ensure_range!(fifo < PACKERS, "trigger FIFO {fifo}");
        Ok(self.handle.read(TriggerHandlerRegister::FifoEmpty)? >> fifo & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn are_fifos_empty(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::FifoEmpty)? & 0x7 == 0x7)
    }

    /// Internal triggers every `period_bc` BC, each sensor trigger one BC shorter than the period
    /// (but no shorter than [`MIN_TRIGGER_DISTANCE`])
    /// # Errors
    /// Returns an error on bad transport or a period that doesn't divide the orbit
    pub fn setup_for_continuous_mode(&self, period_bc: u16, send_pulses: bool) -> Result<()> {
        ensure_range!(
            ALLOWED_CONTINUOUS_MODE_PERIOD_BC.contains(&period_bc),
            "continuous mode period {period_bc}"
        );
        self.set_trigger_period(period_bc)?;
        let mut distance = (period_bc << 2) - 4;
        if distance < MIN_TRIGGER_DISTANCE {
            warn!("Trigger distance too low, setting it to {MIN_TRIGGER_DISTANCE}");
            distance = MIN_TRIGGER_DISTANCE;
        }
        self.set_trigger_minimum_distance(distance)?;
        self.set_pulses(send_pulses)
    }

    /// Pushes the internal period to a full orbit and sets the minimum distance
    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn setup_for_triggered_mode(&self, min_distance: u16, send_pulses: bool) -> Result<()> {
        self.set_trigger_period(ORBIT_BC as u16)?;
        let distance = if min_distance < MIN_TRIGGER_DISTANCE {
            warn!("Trigger distance too low, setting it to {MIN_TRIGGER_DISTANCE}");
            MIN_TRIGGER_DISTANCE
        } else {
            min_distance
        };
        self.set_trigger_minimum_distance(distance)?;
        self.set_pulses(send_pulses)
    }

    fn set_pulses(&self, send_pulses: bool) -> Result<()> {
        if send_pulses {
            self.configure_to_send_pulses()
        } else {
            self.configure_to_send_triggers()
        }
    }

    /// Count decorative triggers in continuous mode as ignored rather than echoed
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_ignore_trg_in_cont_mode(&self, ignore: bool) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::IgnoreTrgInContMode, u16::from(ignore))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn ignore_trg_in_cont_mode(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::IgnoreTrgInContMode)? == 1)
    }

    /// Orbit of the last start of run
    /// # Errors
    /// Returns an error on bad transport
    pub fn sox_orbit(&self) -> Result<u64> {
        use TriggerHandlerRegister::*;
        self.handle
            .read_wide(&[SoxOrbitLsb, SoxOrbitCsb, SoxOrbitMsb])
    }

    /// Orbit of the last end of run
    /// # Errors
    /// Returns an error on bad transport
    pub fn eox_orbit(&self) -> Result<u64> {
        use TriggerHandlerRegister::*;
        self.handle
            .read_wide(&[EoxOrbitLsb, EoxOrbitCsb, EoxOrbitMsb])
    }

    /// Syncs the timebase to the incoming trigger frames, optionally correcting its drift
    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_timebase_sync(&self, correction: bool) -> Result<()> {
        let value = if correction { 0x3 } else { 0x1 };
        self.handle
            .write(TriggerHandlerRegister::EnableTimebaseSync, value)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_timebase_sync(&self) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::EnableTimebaseSync, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn timebase_sync_enable(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::EnableTimebaseSync)
    }

    /// Whether the timebase agrees with the timing of the trigger frames
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_timebase_synced(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::TimebaseSynced)? == 1)
    }

    /// One bit per internal trigger slot of a heartbeat frame
    /// # Errors
    /// Returns an error on bad transport or a mask wider than 48 bits
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_internal_trigger_grant(&self, grant: u64) -> Result<()> {
        ensure_range!(grant >> GRANT_BITS == 0, "trigger grant {grant:#x}");
        use TriggerHandlerRegister::*;
        self.handle
            .queue_write(InternalTrgGrantLsb, (grant & 0xFFFF) as u16)?;
        self.handle
            .queue_write(InternalTrgGrantCsb, (grant >> 16 & 0xFFFF) as u16)?;
        self.handle.write(InternalTrgGrantMsb, (grant >> 32) as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn internal_trigger_grant(&self) -> Result<u64> {
        use TriggerHandlerRegister::*;
        self.handle.read_wide(&[
            InternalTrgGrantLsb,
            InternalTrgGrantCsb,
            InternalTrgGrantMsb,
        ])
    }

    /// Pops the debug FIFO until it reports empty
    /// # Errors
    /// Returns an error on bad transport
    pub fn debug_fifo(&self) -> Result<Vec<DebugFifoEntry>> {
        let regs = [TriggerHandlerRegister::DebugFifo; DEBUG_FIFO_WORDS];
        let mut entries = vec![];
        for _ in 0..FIFO_DEPTH {
            match DebugFifoEntry::decode(&self.handle.read_many(&regs)?) {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_counters(&self) -> Result<()> {
        self.monitor.reset_all_counters()
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown counter
    pub fn read_counters(
        &self,
        names: Option<&[&str]>,
        reset_after: bool,
    ) -> Result<BTreeMap<KString, u32>> {
        self.monitor.read_counters(names, true, reset_after)
    }

    /// Samples the counters `interval` apart and computes the trigger rates
    /// # Errors
    /// Returns an error on bad transport, or if no timeframe was seen during the interval
    pub fn rates(&self, interval: Duration) -> Result<TriggerRates> {
        let pre = self.read_counters(None, false)?;
        self.handle.settle(interval)?;
        let post = self.read_counters(None, false)?;
        TriggerRates::from_counts(&TriggerCounts::between(&pre, &post))
    }

    /// # Errors
    /// Returns an error on bad transport, or if no timeframe was seen during the interval
    pub fn log_rates(&self, interval: Duration) -> Result<TriggerRates> {
        let rates = self.rates(interval)?;
        info!("{rates}");
        Ok(rates)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<TriggerHandlerRegister>("TRIGGER HANDLER")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        master::WishboneMaster,
        modules::{
            alpide_control::AlpideControl,
            clock_health::{
                ClockHealth,
                ConfigReset,
            },
        },
        transport::mock::Mock,
    };
    use paste::paste;
    use std::sync::{
        Arc,
        Mutex,
    };
    use swt::{
        TriggerFrame,
        TriggerType,
    };

    type Master = Arc<Mutex<WishboneMaster<Mock>>>;

    fn handler() -> (Master, TriggerHandler<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::TriggerHandler);
        (master, TriggerHandler::new(handle))
    }

    fn alpide(master: &Master) -> AlpideControl<Mock> {
        AlpideControl::new(ModuleHandle::new(
            Arc::downgrade(master),
            ModuleId::AlpideControl,
        ))
    }

    fn send(master: &Master, kind: TriggerType, bc: u16) {
        let mut m = master.lock().unwrap();
        let orbit = m.transport().orbit();
        let frame = TriggerFrame::new(kind, bc, orbit).unwrap();
        m.transport_mut().send_trigger(&frame).unwrap();
    }

    fn idle(master: &Master, bc: u32) {
        master.lock().unwrap().transport_mut().send_idle(bc).unwrap();
    }

    fn clock_health(master: &Master) -> ClockHealth<Mock> {
        ClockHealth::new(ModuleHandle::new(
            Arc::downgrade(master),
            ModuleId::ClockHealthStatus,
        ))
    }

    /// Sends two orbit ticks one orbit apart, then one more after skipping an orbit
    fn lose_timebase(master: &Master) {
        send(master, TriggerType::ORBIT, 0);
        idle(master, ORBIT_BC);
        send(master, TriggerType::ORBIT, 0);
        idle(master, 2 * ORBIT_BC);
        send(master, TriggerType::ORBIT, 0);
    }

    fn next_orbit(master: &Master) {
        idle(master, ORBIT_BC);
        send(master, TriggerType::ORBIT, 0);
    }

    const OUTCOMES: [&str; 4] = [
        "TRIGGER_SENT",
        "TRIGGER_IGNORED",
        "TRIGGER_GATED",
        "TRIGGER_ECHOED",
    ];

    fn counters(th: &TriggerHandler<Mock>, names: &[&str]) -> Vec<u32> {
        let values = th.read_counters(Some(names), false).unwrap();
        names.iter().map(|n| values[*n]).collect()
    }

    macro_rules! test_rw {
        ($reg:ident, $val:literal) => {
            paste! {
                #[test]
                fn [<test_rw_ $reg:snake>]() {
                    let (_master, th) = handler();
                    th.handle.write(TriggerHandlerRegister::$reg, $val).unwrap();
                    assert_eq!(th.handle.read(TriggerHandlerRegister::$reg).unwrap(), $val);
                }
            }
        };
    }

    test_rw!(TriggerPeriod, 0x123);
    test_rw!(TriggerMinDistance, 0xBEEF);
    test_rw!(TriggerDelay, 0x1FF);
    test_rw!(SeqPtPeriod, 0x0FA);
    test_rw!(SeqNumHbaPerTf, 0x42);

    #[test]
    fn test_frequency() {
        let (_master, th) = handler();
        th.set_trigger_frequency(100.0).unwrap();
        assert_eq!(th.trigger_period().unwrap(), 400);
        assert!((th.trigger_frequency().unwrap() - 100.0).abs() < 1e-9);
        th.set_trigger_frequency(1.0).unwrap();
        assert_eq!(th.trigger_period().unwrap(), 3564);
        th.set_trigger_frequency(1e5).unwrap();
        assert_eq!(th.trigger_period().unwrap(), 10);
        assert!(th.set_trigger_frequency(0.0).is_err());
        assert!(th.set_trigger_period(0).is_err());
        assert!(th.set_trigger_period(0x1000).is_err());
    }

    #[test]
    fn test_setup_modes() {
        let (_master, th) = handler();
        assert!(th.setup_for_continuous_mode(200, false).is_err());
        th.setup_for_continuous_mode(198, true).unwrap();
        assert_eq!(th.trigger_minimum_distance().unwrap(), 198 * 4 - 4);
        assert!(th.sends_pulses().unwrap());
        th.setup_for_triggered_mode(20, false).unwrap();
        assert_eq!(th.trigger_period().unwrap(), 3564);
        assert_eq!(th.trigger_minimum_distance().unwrap(), MIN_TRIGGER_DISTANCE);
        assert!(!th.sends_pulses().unwrap());
    }

    #[test]
    fn test_grant_and_packers() {
        let (_master, th) = handler();
        th.set_internal_trigger_grant(0xABCD_1234_5678).unwrap();
        assert_eq!(th.internal_trigger_grant().unwrap(), 0xABCD_1234_5678);
        assert!(th.set_internal_trigger_grant(1 << 48).is_err());
        th.enable_packer(1, true).unwrap();
        assert!(th.is_packer_enabled(1).unwrap());
        th.mask_all_triggers().unwrap();
        assert!(!th.is_packer_enabled(1).unwrap());
        assert!(th.opcode_gating().unwrap());
        assert!(th.enable_packer(3, true).is_err());
    }

    #[test]
    fn test_state_machine() {
        let (master, th) = handler();
        th.enable().unwrap();
        assert_eq!(th.operating_mode().unwrap().state, OperatingState::Idle);
        // Ends of run outside a run are no-ops
        send(&master, TriggerType::EOC, 10);
        assert_eq!(th.operating_mode().unwrap().state, OperatingState::Idle);
        send(&master, TriggerType::SOT, 20);
        assert!(th.is_triggered_mode().unwrap());
        // A start of continuous during a triggered run is ignored
        send(&master, TriggerType::SOC, 30);
        assert!(th.is_triggered_mode().unwrap());
        send(&master, TriggerType::EOT, 40);
        assert_eq!(th.operating_mode().unwrap().state, OperatingState::Idle);
        send(&master, TriggerType::SOC, 50);
        assert!(th.is_continuous_mode().unwrap());
        send(&master, TriggerType::HBR, 60);
        assert_eq!(
            th.operating_mode().unwrap().state,
            OperatingState::ContinuousReject
        );
        send(&master, TriggerType::HB, 70);
        assert_eq!(th.operating_mode().unwrap().state, OperatingState::Continuous);
        send(&master, TriggerType::EOC, 80);
        assert!(!th.is_continuous_mode().unwrap());
    }

    #[test]
    fn test_physics_trigger_forwarded() {
        let (master, th) = handler();
        let ac = alpide(&master);
        th.set_trigger_source(TriggerSource::Sequencer).unwrap();
        th.enable().unwrap();
        th.reset_counters().unwrap();
        ac.reset_counters().unwrap();
        send(&master, TriggerType::SOT, 0);
        send(&master, TriggerType::PHYSICS, 100);
        idle(&master, 20);
        assert_eq!(
            counters(&th, &["TRIGGER_SENT", "TRIGGER_ECHOED"]),
            vec![1, 0]
        );
        assert_eq!(ac.monitor().read_counter("OPCODE").unwrap(), 1);
    }

    #[test]
    fn test_close_triggers_rejected() {
        let (master, th) = handler();
        let ac = alpide(&master);
        th.set_trigger_source(TriggerSource::Sequencer).unwrap();
        th.set_trigger_minimum_distance(20).unwrap();
        th.enable().unwrap();
        th.reset_counters().unwrap();
        ac.reset_counters().unwrap();
        send(&master, TriggerType::SOT, 0);
        send(&master, TriggerType::PHYSICS, 100);
        send(&master, TriggerType::PHYSICS, 101);
        idle(&master, 20);
        assert_eq!(
            counters(&th, &["TRIGGER_SENT", "TRIGGER_ECHOED"]),
            vec![1, 1]
        );
        assert_eq!(ac.monitor().read_counter("TRIGGER_SENT").unwrap(), 1);
    }

    #[test]
    fn test_gated_trigger_in_continuous() {
        let (master, th) = handler();
        th.setup_for_continuous_mode(198, false).unwrap();
        th.set_opcode_gating(true).unwrap();
        th.enable().unwrap();
        th.reset_counters().unwrap();
        send(&master, TriggerType::SOC, 0);
        send(&master, TriggerType::PHYSICS, 50);
        idle(&master, 1000);
        let gated = counters(&th, &["TRIGGER_GATED", "TRIGGER_SENT"]);
        assert!(gated[0] >= 2);
        assert_eq!(gated[1], 0);
        // Clearing the gate only takes effect at the next heartbeat
        th.set_opcode_gating(false).unwrap();
        idle(&master, 400);
        assert_eq!(counters(&th, &["TRIGGER_SENT"]), vec![0]);
        send(&master, TriggerType::HB | TriggerType::ORBIT, 0);
        idle(&master, 400);
        assert!(counters(&th, &["TRIGGER_SENT"])[0] > 0);
    }

    #[test]
    fn test_coincident_trigger_counted_once() {
        let (master, th) = handler();
        th.setup_for_continuous_mode(198, false).unwrap();
        th.enable().unwrap();
        send(&master, TriggerType::SOC, 0);
        // Line up on an internal slot
        let slot = master.lock().unwrap().transport().next_internal_slot_bc();
        let now = master.lock().unwrap().transport().bc_in_orbit();
        idle(&master, u32::from(slot - now));
        th.reset_counters().unwrap();
        send(&master, TriggerType::PHYSICS, slot);
        let values = counters(
            &th,
            &["TRIGGER_SENT", "TRIGGER_IGNORED", "TRIGGER_ECHOED"],
        );
        assert_eq!(values, vec![1, 0, 0]);
    }

    #[test]
    fn test_ignore_in_continuous() {
        let (master, th) = handler();
        th.setup_for_continuous_mode(3564, false).unwrap();
        th.enable().unwrap();
        send(&master, TriggerType::SOC, 0);
        th.reset_counters().unwrap();
        send(&master, TriggerType::CAL, 10);
        th.set_ignore_trg_in_cont_mode(true).unwrap();
        send(&master, TriggerType::CAL, 20);
        assert_eq!(
            counters(&th, &["TRIGGER_ECHOED", "TRIGGER_IGNORED"]),
            vec![1, 1]
        );
    }

    #[test]
    fn test_decorative_frames_echoed_in_run() {
        let (master, th) = handler();
        th.enable().unwrap();
        send(&master, TriggerType::SOT, 0);
        th.reset_counters().unwrap();
        send(&master, TriggerType::TF, 10);
        send(&master, TriggerType::HC, 20);
        send(&master, TriggerType::PP, 30);
        send(&master, TriggerType::HB | TriggerType::ORBIT, 40);
        assert_eq!(counters(&th, &OUTCOMES), vec![0, 0, 0, 4]);
        // Rejected heartbeats are echoed, what follows them is ignored
        send(&master, TriggerType::HBR | TriggerType::ORBIT, 50);
        send(&master, TriggerType::HC, 60);
        assert_eq!(counters(&th, &OUTCOMES), vec![0, 1, 0, 5]);
        send(&master, TriggerType::EOT, 70);
        send(&master, TriggerType::CAL, 80);
        assert_eq!(counters(&th, &OUTCOMES), vec![0, 2, 0, 5]);
    }

    #[test]
    fn test_physics_ignored_outside_run() {
        let (master, th) = handler();
        th.enable().unwrap();
        th.reset_counters().unwrap();
        send(&master, TriggerType::PHYSICS, 10);
        assert_eq!(
            counters(&th, &["TRIGGER_IGNORED", "TRIGGER_ECHOED"]),
            vec![1, 0]
        );
        th.set_trigger_period(3564).unwrap();
        send(&master, TriggerType::SOC, 20);
        send(&master, TriggerType::HBR | TriggerType::ORBIT, 30);
        th.reset_counters().unwrap();
        send(&master, TriggerType::PHYSICS, 40);
        assert_eq!(
            counters(&th, &["TRIGGER_IGNORED", "TRIGGER_ECHOED"]),
            vec![1, 0]
        );
    }

    #[test]
    fn test_every_received_trigger_accounted() {
        let (master, th) = handler();
        th.set_trigger_minimum_distance(20).unwrap();
        th.enable().unwrap();
        th.reset_counters().unwrap();
        send(&master, TriggerType::SOT, 0);
        let received = [
            TriggerType::PHYSICS,
            TriggerType::PHYSICS,
            TriggerType::HC,
            TriggerType::TF,
            TriggerType::HBR | TriggerType::ORBIT,
            TriggerType::PHYSICS,
            TriggerType::HB | TriggerType::ORBIT,
            TriggerType::PHYSICS,
        ];
        for (bc, kind) in [100, 101, 150, 200, 250, 300, 350, 400].into_iter().zip(received) {
            send(&master, kind, bc);
        }
        send(&master, TriggerType::EOT, 450);
        let outcomes = counters(&th, &OUTCOMES);
        assert_eq!(outcomes, vec![2, 2, 0, 4]);
        assert!(outcomes.iter().sum::<u32>() >= received.len() as u32);
    }

    #[test]
    fn test_preconditions() {
        let (_master, th) = handler();
        th.enable().unwrap();
        assert!(matches!(th.flush_fifo(), Err(Error::Precondition(_))));
        th.disable().unwrap();
        th.enable_timebase_sync(false).unwrap();
        assert!(matches!(th.flush_fifo(), Err(Error::Precondition(_))));
        th.disable_timebase_sync().unwrap();
        th.flush_fifo().unwrap();
        assert!(th.are_fifos_empty().unwrap());
        assert!(th.reset_readout_master().is_err());
        th.mask_all_triggers().unwrap();
        // Gated opcodes put the readout in RO_NO_DET
        th.reset_readout_master().unwrap();
    }

    #[test]
    fn test_timebase_sync() {
        let (master, th) = handler();
        th.enable_timebase_sync(false).unwrap();
        th.enable().unwrap();
        send(&master, TriggerType::ORBIT, 0);
        idle(&master, ORBIT_BC);
        send(&master, TriggerType::ORBIT, 0);
        assert!(th.is_timebase_synced().unwrap());
        th.reset_counters().unwrap();
        // Skip an orbit
        idle(&master, 2 * ORBIT_BC);
        send(&master, TriggerType::ORBIT, 0);
        assert!(!th.is_timebase_synced().unwrap());
        assert_eq!(counters(&th, &["LOL_TIMEBASE"]), vec![1]);
        let entries = th.debug_fifo().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error.orbit, entries[0].prev.orbit + 1);
        assert_eq!(entries[0].next.orbit, entries[0].prev.orbit + 2);
        idle(&master, ORBIT_BC);
        send(&master, TriggerType::ORBIT, 0);
        assert!(th.is_timebase_synced().unwrap());
    }

    #[test]
    fn test_timebase_loss_held_until_enable() {
        let (master, th) = handler();
        let ch = clock_health(&master);
        ch.set_config_reset(&ConfigReset {
            enable_th: true,
            sox: false,
        })
        .unwrap();
        th.enable_timebase_sync(false).unwrap();
        th.enable().unwrap();
        lose_timebase(&master);
        assert!(ch.flags().unwrap().lol_timebase);
        next_orbit(&master);
        assert!(!th.is_timebase_synced().unwrap());
        // A start of run is not the configured reset
        send(&master, TriggerType::SOT, 0);
        next_orbit(&master);
        assert!(!th.is_timebase_synced().unwrap());
        th.disable().unwrap();
        th.enable().unwrap();
        next_orbit(&master);
        assert!(th.is_timebase_synced().unwrap());
        ch.reset_clock_health_flags().unwrap();
        assert!(!ch.flags().unwrap().lol_timebase);
    }

    #[test]
    fn test_timebase_loss_held_until_start_of_run() {
        let (master, th) = handler();
        let ch = clock_health(&master);
        ch.set_config_reset(&ConfigReset {
            enable_th: false,
            sox: true,
        })
        .unwrap();
        th.enable_timebase_sync(false).unwrap();
        th.enable().unwrap();
        lose_timebase(&master);
        assert_ne!(ch.timebase_event_timestamp().unwrap().uptime, 0);
        th.disable().unwrap();
        th.enable().unwrap();
        next_orbit(&master);
        assert!(!th.is_timebase_synced().unwrap());
        send(&master, TriggerType::SOC, 0);
        next_orbit(&master);
        assert!(th.is_timebase_synced().unwrap());
    }

    #[test]
    fn test_debug_fifo_decode() {
        let prev = (5u64 << BC_BITS) | 17;
        let error = (6u64 << BC_BITS) | 3563;
        let next = (7u64 << BC_BITS) | 1;
        let mut words = vec![0u16; DEBUG_FIFO_WORDS];
        for (n, value) in [prev, error, next].iter().enumerate() {
            for i in 0..ORBIT_BC_BITS {
                let bit = n * ORBIT_BC_BITS + i;
                words[bit / DEBUG_FIFO_DATA_BITS] |=
                    ((value >> i & 1) as u16) << (bit % DEBUG_FIFO_DATA_BITS);
            }
        }
        let entry = DebugFifoEntry::decode(&words).unwrap();
        assert_eq!(entry.prev, OrbitBc { orbit: 5, bc: 17 });
        assert_eq!(entry.error, OrbitBc { orbit: 6, bc: 3563 });
        assert_eq!(entry.next, OrbitBc { orbit: 7, bc: 1 });
        words[0] |= 1 << 15;
        assert_eq!(DebugFifoEntry::decode(&words), None);
    }

    #[test]
    fn test_rates() {
        let pre = BTreeMap::from([
            (KString::from_static("TF"), 10),
            (KString::from_static("HB"), 100),
        ]);
        let post = BTreeMap::from([
            (KString::from_static("TF"), 12),
            (KString::from_static("HB"), 356),
            (KString::from_static("HBR"), 56),
            (KString::from_static("PHYSICS"), 400),
            (KString::from_static("TRIGGER_SENT"), 400),
        ]);
        let counts = TriggerCounts::between(&pre, &post);
        assert_eq!(counts.hba, 200);
        let rates = TriggerRates::from_counts(&counts).unwrap();
        assert!((rates.hb_per_tf - 128.0).abs() < 1e-9);
        assert!((rates.pt_per_hba - 2.0).abs() < 1e-9);
        assert!(TriggerRates::from_counts(&TriggerCounts::default()).is_err());
    }

    #[test]
    fn test_dump() {
        let (_master, th) = handler();
        let dump = th.dump_config().unwrap();
        assert!(dump.starts_with("--- TRIGGER HANDLER module ---"));
        assert!(!dump.contains("FAILED"));
    }
}
