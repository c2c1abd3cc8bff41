//! Trigger handler state machine and internal sequencer of the mock

use super::Mock;
use crate::{
    core::{
        ModuleId,
        RegisterMap,
        ORBIT_BC,
    },
    modules::clock_health::ClockHealthRegister,
    trigger::{
        handler::{
            OperatingState,
            TriggerHandlerRegister,
            BC_BITS,
            DEBUG_FIFO_DATA_BITS,
            DEBUG_FIFO_WORDS,
            ORBIT_BC_BITS,
        },
        sequencer::{
            INFINITE_TIMEFRAMES,
            MAX_TIMEFRAMES,
        },
    },
};
use std::collections::VecDeque;
use swt::{
    TriggerBit,
    TriggerFrame,
    TriggerType,
};
use tracing::trace;

const FIFO_EMPTY: u16 = 0x8000;
const ORBIT: u64 = ORBIT_BC as u64;
const OPCODE_PULSE: u8 = 0x78;
const OPCODE_TRIGGER: u8 = 0x55;
const SOURCE_SEQUENCER: u16 = 1;
const SEQ_CONTINUOUS: u16 = 1;
const GRANT_SLOTS: u64 = 48;
const LOL_TIMEBASE_FLAG: u16 = 0b100;
const CONFIG_RESET_ENABLE_TH: u16 = 0b01;
const CONFIG_RESET_SOX: u16 = 0b10;
/// Bits that only decorate a frame, as opposed to starting or ending a run or resetting the sensors
const DECORATIVE: TriggerType = TriggerType(
    TriggerType::ORBIT.0
        | TriggerType::HB.0
        | TriggerType::HBR.0
        | TriggerType::HC.0
        | TriggerType::PP.0
        | TriggerType::TF.0
        | TriggerType::CAL.0,
);
const CONTROL: TriggerType = TriggerType(
    TriggerType::SOT.0
        | TriggerType::EOT.0
        | TriggerType::SOC.0
        | TriggerType::EOC.0
        | TriggerType::FE_RST.0,
);

fn counter_name(bit: TriggerBit) -> Option<&'static str> {
    Some(match bit {
        TriggerBit::Orbit => "ORBIT",
        TriggerBit::Hb => "HB",
        TriggerBit::Hbr => "HBR",
        TriggerBit::Hc => "HBC",
        TriggerBit::Physics => "PHYSICS",
        TriggerBit::Pp => "PP",
        TriggerBit::Cal => "CAL",
        TriggerBit::Sot => "SOT",
        TriggerBit::Eot => "EOT",
        TriggerBit::Soc => "SOC",
        TriggerBit::Eoc => "EOC",
        TriggerBit::Tf => "TF",
        TriggerBit::FeRst => "FERST",
        TriggerBit::Rt | TriggerBit::Rs => return None,
    })
}

/// Packs three `(orbit, bc)` stamps the way the debug FIFO streams them
#[allow(clippy::cast_possible_truncation)]
fn debug_words(stamps: [(u32, u16); 3]) -> Vec<u16> {
    let mut words = vec![0u16; DEBUG_FIFO_WORDS];
    for (n, (orbit, bc)) in stamps.iter().enumerate() {
        let value = u64::from(*orbit) << BC_BITS | u64::from(*bc);
        for i in 0..ORBIT_BC_BITS {
            let bit = n * ORBIT_BC_BITS + i;
            words[bit / DEBUG_FIFO_DATA_BITS] |= ((value >> i & 1) as u16) << (bit % DEBUG_FIFO_DATA_BITS);
        }
    }
    words
}

#[derive(Debug, Clone, Copy)]
struct SequencerRun {
    next_boundary: u64,
    first: bool,
    hb_index: u16,
}

#[derive(Debug, Clone, Default)]
pub(super) struct TriggerModel {
    state: OperatingState,
    /// Opcodes are not forwarded to the sensors
    gate: bool,
    last_forward: Option<u64>,
    next_slot: Option<u64>,
    last_orbit: Option<u32>,
    /// Timebase lost until the configured reset event
    timebase_lost: bool,
    debug_fifo: VecDeque<u16>,
    sequencer: Option<SequencerRun>,
    /// Physics triggers of the sequencer, in time order
    pending: VecDeque<(u64, TriggerType)>,
}

impl Mock {
    fn th(&self, reg: TriggerHandlerRegister) -> u16 {
        self.reg(ModuleId::TriggerHandler, reg.addr())
    }

    fn set_th(&mut self, reg: TriggerHandlerRegister, value: u16) {
        self.set_reg(ModuleId::TriggerHandler, reg.addr(), value);
    }

    fn th_count(&mut self, name: &str) {
        self.count(ModuleId::TriggerHandlerMonitor, name, 1);
    }

    /// Earliest scheduled event strictly before `target` cycles
    pub(super) fn next_trigger_event(&self, target: u64) -> Option<u64> {
        let model = &self.trigger;
        [
            model.sequencer.map(|s| s.next_boundary),
            model.pending.front().map(|(bc, _)| *bc),
            model.next_slot,
        ]
        .into_iter()
        .flatten()
        .filter(|bc| bc * 4 < target)
        .min()
    }

    /// Runs the event scheduled at `bc`, sequencer boundaries first
    pub(super) fn run_trigger_event(&mut self, bc: u64) {
        if self.trigger.sequencer.is_some_and(|s| s.next_boundary == bc) {
            self.sequencer_boundary(bc);
        } else if self.trigger.pending.front().is_some_and(|(at, _)| *at == bc) {
            if let Some((at, kind)) = self.trigger.pending.pop_front() {
                self.sequencer_frame(at, kind);
            }
        } else if self.trigger.next_slot == Some(bc) {
            self.internal_slot(bc);
        }
    }

    pub(super) fn link_frame(&mut self, frame: &TriggerFrame) {
        let at = u64::from(frame.orbit) * ORBIT + u64::from(frame.bc);
        self.handle_frame(at, frame.kind, frame.orbit);
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sequencer_frame(&mut self, at: u64, kind: TriggerType) {
        if self.th(TriggerHandlerRegister::TrigSource) == SOURCE_SEQUENCER {
            self.handle_frame(at, kind, (at / ORBIT) as u32);
        }
    }

    fn start_sequencer(&mut self) {
        self.trigger.pending.clear();
        self.trigger.sequencer = Some(SequencerRun {
            next_boundary: (self.now_bc() / ORBIT + 1) * ORBIT,
            first: true,
            hb_index: 0,
        });
    }

    fn stop_sequencer(&mut self) {
        self.trigger.sequencer = None;
        self.trigger.pending.clear();
    }

    fn sequencer_boundary(&mut self, at: u64) {
        let Some(mut run) = self.trigger.sequencer else {
            return;
        };
        let num_tf = self.th(TriggerHandlerRegister::SeqNumTf);
        let finite = num_tf & INFINITE_TIMEFRAMES == 0;
        let remaining = num_tf & MAX_TIMEFRAMES;
        let continuous = self.th(TriggerHandlerRegister::SeqContinuousNTrg) == SEQ_CONTINUOUS;
        let mut kind = TriggerType::EMPTY;

        if run.hb_index == 0 && finite && remaining == 0 {
            if !run.first {
                let end = if continuous { TriggerType::EOC } else { TriggerType::EOT };
                self.sequencer_frame(at, end | TriggerType::ORBIT);
            }
            trace!(at, "Sequencer done");
            self.stop_sequencer();
            self.set_th(TriggerHandlerRegister::SeqEnable, 0);
            return;
        }
        if run.hb_index == 0 {
            kind |= TriggerType::TF;
            if finite {
                self.set_th(TriggerHandlerRegister::SeqNumTf, remaining - 1);
            }
        }
        if run.first {
            kind |= if continuous { TriggerType::SOC } else { TriggerType::SOT };
        }
        kind |= TriggerType::HB | TriggerType::ORBIT;
        if run.hb_index >= self.th(TriggerHandlerRegister::SeqNumHbaPerTf) {
            kind |= TriggerType::HBR;
        }
        run.hb_index = (run.hb_index + 1) % self.th(TriggerHandlerRegister::SeqNumHbPerTf).max(1);
        run.first = false;
        run.next_boundary += ORBIT;
        self.trigger.sequencer = Some(run);

        self.sequencer_frame(at, kind);

        let period = u64::from(self.th(TriggerHandlerRegister::SeqPtPeriod));
        if self.trigger.state == OperatingState::Triggered && period > 0 {
            for offset in (0..).map(|k| k * period).take_while(|o| *o < ORBIT) {
                if self.is_granted(offset / period) {
                    self.trigger.pending.push_back((at + offset, TriggerType::PHYSICS));
                }
            }
        }
    }

    /// First continuous slot at or after `from`
    fn slot_after(&self, from: u64) -> u64 {
        let period = u64::from(self.th(TriggerHandlerRegister::TriggerPeriod).max(1));
        let orbit_start = from / ORBIT * ORBIT;
        let slot = orbit_start + (from - orbit_start).div_ceil(period) * period;
        if slot - orbit_start >= ORBIT {
            orbit_start + ORBIT
        } else {
            slot
        }
    }

    fn grant(&self) -> u64 {
        u64::from(self.th(TriggerHandlerRegister::InternalTrgGrantLsb))
            | u64::from(self.th(TriggerHandlerRegister::InternalTrgGrantCsb)) << 16
            | u64::from(self.th(TriggerHandlerRegister::InternalTrgGrantMsb)) << 32
    }

    /// Slots past the width of the grant are always granted
    fn is_granted(&self, slot: u64) -> bool {
        slot >= GRANT_SLOTS || self.grant() >> slot & 1 == 1
    }

    /// Whether `at` is the continuous slot due now and the grant lets it through
    fn is_granted_slot(&self, at: u64) -> bool {
        let period = u64::from(self.th(TriggerHandlerRegister::TriggerPeriod).max(1));
        self.trigger.next_slot == Some(at) && self.is_granted(at % ORBIT / period)
    }

    fn internal_slot(&mut self, at: u64) {
        if self.trigger.state == OperatingState::Continuous && self.is_granted_slot(at) {
            if self.trigger.gate {
                self.th_count("TRIGGER_GATED");
            } else {
                self.forward_trigger(at);
            }
        }
        self.trigger.next_slot = Some(self.slot_after(at + 1));
    }

    fn forward_trigger(&mut self, at: u64) {
        self.trigger.last_forward = Some(at);
        self.th_count("TRIGGER_SENT");
        self.th_count("PROCESSED_TRIGGERS");
        let opcode = if self.th(TriggerHandlerRegister::PulseNTrigger) == 0 {
            OPCODE_TRIGGER
        } else {
            OPCODE_PULSE
        };
        self.alpide_opcode(opcode);
    }

    fn set_orbit_stamp(&mut self, regs: [TriggerHandlerRegister; 3], orbit: u32) {
        let [lsb, csb, msb] = regs;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.set_th(lsb, (orbit & 0xFFFF) as u16);
            self.set_th(csb, (orbit >> 16) as u16);
        }
        self.set_th(msb, 0);
    }

    fn config_reset(&self) -> u16 {
        self.reg(ModuleId::ClockHealthStatus, ClockHealthRegister::ConfigReset.addr())
    }

    /// Ends a sticky loss of timebase if `event` is one of the configured reset events
    fn clear_timebase_loss(&mut self, event: u16) {
        if self.trigger.timebase_lost && self.config_reset() & event != 0 {
            trace!(event, "Timebase loss cleared");
            self.trigger.timebase_lost = false;
        }
    }

    fn timebase_sync(&mut self, at: u64, orbit: u32) {
        match self.trigger.last_orbit {
            Some(last) if orbit == last.wrapping_add(1) => {
                let synced = u16::from(!self.trigger.timebase_lost);
                self.set_th(TriggerHandlerRegister::TimebaseSynced, synced);
            }
            Some(last) => {
                self.set_th(TriggerHandlerRegister::TimebaseSynced, 0);
                self.th_count("LOL_TIMEBASE");
                if self.config_reset() & (CONFIG_RESET_ENABLE_TH | CONFIG_RESET_SOX) != 0 {
                    self.trigger.timebase_lost = true;
                }
                {
                    use ClockHealthRegister::*;
                    self.clock_health_event(
                        LOL_TIMEBASE_FLAG,
                        [
                            TimebaseEventTimestampUptimeLsb,
                            TimebaseEventTimestampUptimeCsb,
                            TimebaseEventTimestampUptimeMsb,
                            TimebaseEventTimestampOrbitLsb,
                            TimebaseEventTimestampOrbitCsb,
                            TimebaseEventTimestampOrbitMsb,
                        ],
                    );
                }
                #[allow(clippy::cast_possible_truncation)]
                let bc = (at % ORBIT) as u16;
                let words = debug_words([(last, 0), (last.wrapping_add(1), 0), (orbit, bc)]);
                self.trigger.debug_fifo.extend(words);
            }
            None => {}
        }
        self.trigger.last_orbit = Some(orbit);
    }

    fn handle_frame(&mut self, at: u64, kind: TriggerType, orbit: u32) {
        trace!(at, %kind, "Trigger frame");
        for bit in kind.bits() {
            if let Some(name) = counter_name(bit) {
                self.th_count(name);
            }
        }
        if kind.contains(TriggerType::ORBIT)
            && self.th(TriggerHandlerRegister::EnableTimebaseSync) != 0
        {
            self.timebase_sync(at, orbit);
        }
        if self.th(TriggerHandlerRegister::Enable) != 1 {
            return;
        }
        let received_in = self.trigger.state;

        if kind.contains(TriggerType::SOT) && self.trigger.state == OperatingState::Idle {
            self.trigger.state = OperatingState::Triggered;
            self.set_orbit_stamp(SOX_ORBIT, orbit);
            self.clear_timebase_loss(CONFIG_RESET_SOX);
        }
        if kind.contains(TriggerType::SOC) {
            match self.trigger.state {
                OperatingState::Idle => {
                    self.trigger.state = OperatingState::Continuous;
                    self.trigger.next_slot = Some(self.slot_after(at));
                    self.set_orbit_stamp(SOX_ORBIT, orbit);
                    self.clear_timebase_loss(CONFIG_RESET_SOX);
                }
                OperatingState::Triggered | OperatingState::TriggeredReject => {
                    self.th_count("TRIGGER_ILLEGAL_MODE_SWITCH");
                }
                _ => {}
            }
        }

        if kind.contains(TriggerType::HBR) {
            self.trigger.state = match self.trigger.state {
                OperatingState::Triggered => OperatingState::TriggeredReject,
                OperatingState::Continuous => OperatingState::ContinuousReject,
                other => other,
            };
        } else if kind.contains(TriggerType::HB) {
            self.trigger.state = match self.trigger.state {
                OperatingState::TriggeredReject => OperatingState::Triggered,
                OperatingState::ContinuousReject => OperatingState::Continuous,
                other => other,
            };
            self.trigger.gate = self.th(TriggerHandlerRegister::OpcodeGating) != 0;
        }

        if kind.contains(TriggerType::PHYSICS) {
            self.physics_trigger(at);
        } else if kind.intersects(DECORATIVE) && !kind.intersects(CONTROL) {
            self.decorative_frame(kind, received_in);
        }

        if kind.intersects(TriggerType::EOT | TriggerType::EOC)
            && self.trigger.state != OperatingState::Idle
        {
            self.trigger.state = OperatingState::Idle;
            self.trigger.next_slot = None;
            self.set_orbit_stamp(EOX_ORBIT, orbit);
        }
    }

    /// Echoes a frame carrying no physics trigger, by the state it arrived in
    fn decorative_frame(&mut self, kind: TriggerType, state: OperatingState) {
        let continuous = matches!(
            state,
            OperatingState::Continuous | OperatingState::ContinuousReject
        );
        // Heartbeats drive the internal triggers of a continuous run
        if continuous && kind.contains(TriggerType::HB) && !kind.contains(TriggerType::HBR) {
            return;
        }
        match state {
            OperatingState::Triggered => self.th_count("TRIGGER_ECHOED"),
            OperatingState::Continuous
                if self.th(TriggerHandlerRegister::IgnoreTrgInContMode) == 0 =>
            {
                self.th_count("TRIGGER_ECHOED");
            }
            _ => self.th_count("TRIGGER_IGNORED"),
        }
    }

    fn physics_trigger(&mut self, at: u64) {
        match self.trigger.state {
            OperatingState::Triggered if self.trigger.gate => self.th_count("TRIGGER_GATED"),
            OperatingState::Triggered => {
                let distance = u64::from(self.th(TriggerHandlerRegister::TriggerMinDistance));
                let far_enough = self
                    .trigger
                    .last_forward
                    .map_or(true, |last| at.saturating_sub(last) * 4 >= distance);
                if far_enough {
                    self.forward_trigger(at);
                } else {
                    self.th_count("TRIGGER_ECHOED");
                }
            }
            OperatingState::Continuous if self.is_granted_slot(at) => {
                if self.trigger.gate {
                    self.th_count("TRIGGER_GATED");
                } else {
                    self.forward_trigger(at);
                }
                self.trigger.next_slot = Some(self.slot_after(at + 1));
            }
            OperatingState::Continuous
                if self.th(TriggerHandlerRegister::IgnoreTrgInContMode) == 0 =>
            {
                self.th_count("TRIGGER_ECHOED");
            }
            _ => self.th_count("TRIGGER_IGNORED"),
        }
    }

    pub(super) fn trigger_read(&mut self, addr: u8) -> u16 {
        if addr == TriggerHandlerRegister::OperatingMode.addr() {
            self.trigger.state as u16 | u16::from(self.trigger.gate) << 3
        } else if addr == TriggerHandlerRegister::DebugFifo.addr() {
            self.trigger.debug_fifo.pop_front().unwrap_or(FIFO_EMPTY)
        } else {
            self.reg(ModuleId::TriggerHandler, addr)
        }
    }

    pub(super) fn trigger_write(&mut self, addr: u8, data: u16) {
        if addr == TriggerHandlerRegister::OpcodeGating.addr() && data == 1 {
            self.trigger.gate = true;
        } else if addr == TriggerHandlerRegister::Enable.addr() && data == 1 {
            self.clear_timebase_loss(CONFIG_RESET_ENABLE_TH);
        } else if addr == TriggerHandlerRegister::SeqEnable.addr() {
            if data == 1 {
                self.start_sequencer();
            } else {
                self.stop_sequencer();
            }
        } else if addr == TriggerHandlerRegister::FlushFifo.addr() && data != 0 {
            self.trigger.debug_fifo.clear();
        }
    }
}

const SOX_ORBIT: [TriggerHandlerRegister; 3] = [
    TriggerHandlerRegister::SoxOrbitLsb,
    TriggerHandlerRegister::SoxOrbitCsb,
    TriggerHandlerRegister::SoxOrbitMsb,
];
const EOX_ORBIT: [TriggerHandlerRegister; 3] = [
    TriggerHandlerRegister::EoxOrbitLsb,
    TriggerHandlerRegister::EoxOrbitCsb,
    TriggerHandlerRegister::EoxOrbitMsb,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    #[test]
    fn test_slot_after() {
        let mut mock = Mock::new();
        mock.set_th(TriggerHandlerRegister::TriggerPeriod, 198);
        assert_eq!(mock.slot_after(ORBIT), ORBIT);
        assert_eq!(mock.slot_after(ORBIT + 1), ORBIT + 198);
        assert_eq!(mock.slot_after(2 * ORBIT - 1), 2 * ORBIT);
    }

    #[test]
    fn test_disabled_handler_only_counts() {
        let mut mock = Mock::new();
        let frame = TriggerFrame::new(TriggerType::SOT, 0, mock.orbit()).unwrap();
        mock.send_trigger(&frame).unwrap();
        assert_eq!(mock.trigger.state, OperatingState::Idle);
        let mut monitor = mock.monitors[&ModuleId::TriggerHandlerMonitor].clone();
        monitor.latch();
        assert_eq!(monitor.read(0x21), 1);
    }

    fn trigger_sent(mock: &Mock) -> u32 {
        let monitor = &mock.monitors[&ModuleId::TriggerHandlerMonitor];
        monitor.live.get(&("TRIGGER_SENT", 0)).copied().unwrap_or_default()
    }

    /// Internal triggers sent over two heartbeat frames of a continuous run
    fn continuous_run(grant: u64) -> u32 {
        let mut mock = Mock::new();
        mock.set_th(TriggerHandlerRegister::Enable, 1);
        mock.set_th(TriggerHandlerRegister::TriggerPeriod, 198);
        #[allow(clippy::cast_possible_truncation)]
        for (n, reg) in [
            TriggerHandlerRegister::InternalTrgGrantLsb,
            TriggerHandlerRegister::InternalTrgGrantCsb,
            TriggerHandlerRegister::InternalTrgGrantMsb,
        ]
        .into_iter()
        .enumerate()
        {
            mock.set_th(reg, (grant >> (16 * n) & 0xFFFF) as u16);
        }
        let soc = TriggerFrame::new(TriggerType::SOC, 0, mock.orbit() + 1).unwrap();
        mock.send_trigger(&soc).unwrap();
        mock.send_idle(2 * ORBIT_BC).unwrap();
        trigger_sent(&mock)
    }

    #[test]
    fn test_grant_masks_internal_slots() {
        // 18 slots per orbit at a 198 BC period
        assert_eq!(continuous_run(0xFFFF_FFFF_FFFF), 36);
        assert_eq!(continuous_run(0xFFFF_FFFF_FFFA), 32);
        assert_eq!(continuous_run(0), 0);
    }

    #[test]
    fn test_sequencer_waits_for_orbit() {
        let mut mock = Mock::new();
        mock.set_th(TriggerHandlerRegister::SeqNumHbPerTf, 2);
        mock.set_th(TriggerHandlerRegister::SeqNumTf, INFINITE_TIMEFRAMES);
        mock.trigger_write(TriggerHandlerRegister::SeqEnable.addr(), 1);
        let boundary = mock.trigger.sequencer.map(|s| s.next_boundary);
        assert_eq!(boundary, Some(u64::from(mock.orbit() + 1) * ORBIT));
        mock.send_idle(ORBIT_BC).unwrap();
        assert_eq!(mock.trigger.sequencer.map(|s| s.hb_index), Some(1));
    }
}
