//! The sensor control funnel: every opcode and register write sent to the sensors of the stave goes
//! through this module's DCTRL lines, and the sensor clock (DCLK) of each connector is gated here.

use crate::{
    core::{
        ModuleHandle,
        ModuleId,
        RegisterMap,
    },
    error::{
        Error,
        Result,
    },
    modules::monitor::{
        CounterMonitor,
        ALPIDE_CONTROL_MONITOR,
    },
    transport::Transport,
};
use kstring::KString;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum AlpideControlRegister {
    WriteCtrl = 0,
    WriteAddress = 1,
    WriteData = 2,
    PhaseForce = 3,
    ReadStatus = 4,
    ReadData = 5,
    SetDctrlInput = 17,
    SetDctrlTxMask = 18,
    ManchesterTxEn = 22,
    AutoPhaseOffset = 33,
    SetDclkParallel0 = 34,
    SetDclkParallel1 = 35,
    SetDclkParallel2 = 36,
    SetDclkParallel3 = 37,
    SetDclkParallel4 = 38,
    WaitCycles = 39,
    ManchesterRxDetected = 40,
    DbFifoData = 48,
    DbFifoEmpty = 49,
    DbFifoRdcount = 50,
}

/// Sensor opcodes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Trigger = 0x55,
    Grst = 0xD2,
    Prst = 0xE4,
    Pulse = 0x78,
    Bcrst = 0x36,
    Debug = 0xAA,
    Rorst = 0x63,
    Wrop = 0x9C,
    Rdop = 0x4E,
    CmuClearErr = 0xFF,
    Fifotest = 0xF1,
    Loadobdefcfg = 0x66,
    Xoff = 0x99,
    Xon = 0x39,
    Adcmeasure = 0x87,
}

/// Broadcast to every chip on every connector
pub const BROADCAST: u16 = 0xF;
/// Broadcast to the lower half stave only
pub const BROADCAST_HS_LOWER: u16 = 0x8000;
/// Broadcast to the upper half stave only
pub const BROADCAST_HS_UPPER: u16 = 0x8001;

pub const CONNECTORS: u8 = 5;

pub const DCTRL_MASK_IB: u16 = 0x10;
pub const DCTRL_MASK_LOWER_OB: u16 = 0x03;
pub const DCTRL_MASK_UPPER_OB: u16 = 0x0C;
pub const DCTRL_MASK_ALL: u16 = 0x1F;
pub const DCTRL_MASK_NONE: u16 = 0x00;

pub const PHASE_DCLK_OFF: u16 = 0xFF;
pub const PHASE_DCLK_DEFAULT: u16 = 180;

/// Serializer pattern of each DCLK phase, in degrees
const PHASES: [(u16, u16); 8] = [
    (0, 0b1111_0000),
    (45, 0b1110_0001),
    (90, 0b1100_0011),
    (135, 0b1000_0111),
    (180, 0b0000_1111),
    (225, 0b0001_1110),
    (270, 0b0011_1100),
    (315, 0b0111_1000),
];

fn phase_pattern(phase: u16) -> Result<u16> {
    PHASES
        .iter()
        .find(|(deg, _)| *deg == phase)
        .map(|(_, pattern)| *pattern)
        .ok_or_else(|| Error::OutOfRange(format!("DCLK phase {phase} not a multiple of 45")))
}

fn dclk_register(index: u8) -> Result<AlpideControlRegister> {
    crate::error::ensure_range!(index < CONNECTORS, "DCLK connector {index}");
    AlpideControlRegister::from_addr(AlpideControlRegister::SetDclkParallel0.addr() + index)
        .ok_or_else(|| Error::OutOfRange(format!("DCLK connector {index}")))
}

/// The DCTRL (input, mask) that reaches `extended_chipid`
#[must_use]
pub fn dctrl_route(extended_chipid: u16) -> (Option<u16>, u16) {
    match extended_chipid {
        BROADCAST => (None, DCTRL_MASK_ALL),
        BROADCAST_HS_LOWER => (None, DCTRL_MASK_LOWER_OB),
        BROADCAST_HS_UPPER => (None, DCTRL_MASK_UPPER_OB),
        id if id < 0xF => (Some(2), 0x04),
        id if id & 0x80 == 0 && id & 0x8 != 0 => (Some(0), 0x01),
        id if id & 0x80 == 0 => (Some(1), 0x02),
        id if id & 0x8 != 0 => (Some(2), 0x04),
        _ => (Some(3), 0x08),
    }
}

#[derive(Debug)]
pub struct AlpideControl<T> {
    handle: ModuleHandle<T>,
    monitor: CounterMonitor<T>,
}

impl<T> AlpideControl<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        let monitor = CounterMonitor::new(
            handle.sibling(ModuleId::AlpideControlMonitor),
            "ALPIDE CONTROL MONITOR",
            ALPIDE_CONTROL_MONITOR,
        );
        Self { handle, monitor }
    }

    #[must_use]
    pub fn monitor(&self) -> &CounterMonitor<T> {
        &self.monitor
    }

    fn set_up_dctrl(&self, extended_chipid: u16) -> Result<()> {
        let (input, mask) = dctrl_route(extended_chipid);
        if let Some(input) = input {
            self.handle
                .queue_write(AlpideControlRegister::SetDctrlInput, input)?;
        }
        self.handle
            .queue_write(AlpideControlRegister::SetDctrlTxMask, mask)
    }

    /// Sends `opcode` to the chips addressed by `extended_chipid` ([`BROADCAST`] for all)
    /// # Errors
    /// Returns an error on bad transport
    pub fn write_chip_opcode(&self, opcode: Opcode, extended_chipid: u16) -> Result<()> {
        debug!(?opcode, extended_chipid, "Write chip opcode");
        self.set_up_dctrl(extended_chipid)?;
        self.handle
            .write(AlpideControlRegister::WriteCtrl, (opcode as u16) << 8)
    }

    /// Writes a sensor register, restoring the all-connector mask afterwards
    /// # Errors
    /// Returns an error on bad transport or an out of range chip id
    pub fn write_chip_reg(&self, address: u16, data: u16, extended_chipid: u16) -> Result<()> {
        let chipid = extended_chipid & 0x7F;
        debug!(chipid, address, data, "Write chip register");
        self.set_up_dctrl(extended_chipid)?;
        self.handle
            .queue_write(AlpideControlRegister::WriteAddress, address)?;
        self.handle.queue_write(AlpideControlRegister::WriteData, data)?;
        self.handle.queue_write(
            AlpideControlRegister::WriteCtrl,
            (Opcode::Wrop as u16) << 8 | chipid,
        )?;
        self.handle
            .write(AlpideControlRegister::SetDctrlTxMask, DCTRL_MASK_ALL)
    }

    /// # Errors
    /// Returns an error on bad transport or a mask wider than the connectors
    pub fn set_dctrl_mask(&self, mask: u16) -> Result<()> {
        crate::error::ensure_range!(mask | 0x1F == 0x1F, "DCTRL mask {mask:#x}");
        self.handle.write(AlpideControlRegister::SetDctrlTxMask, mask)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn dctrl_mask(&self) -> Result<u16> {
        self.handle.read(AlpideControlRegister::SetDctrlTxMask)
    }

    /// # Errors
    /// Returns an error on bad transport or an input past the connectors
    pub fn set_input(&self, input: u16) -> Result<()> {
        crate::error::ensure_range!(input < u16::from(CONNECTORS), "DCTRL input {input}");
        self.handle.write(AlpideControlRegister::SetDctrlInput, input)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn input(&self) -> Result<u16> {
        self.handle.read(AlpideControlRegister::SetDctrlInput)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_manchester_tx(&self, enable: bool) -> Result<()> {
        self.handle
            .write(AlpideControlRegister::ManchesterTxEn, u16::from(enable))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn manchester_tx(&self) -> Result<bool> {
        Ok(self.handle.read(AlpideControlRegister::ManchesterTxEn)? & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn manchester_rx_detected(&self) -> Result<bool> {
        Ok(self.handle.read(AlpideControlRegister::ManchesterRxDetected)? & 1 == 1)
    }

    /// Starts the sensor clock on each connector of `indexes` with `phase` degrees
    /// # Errors
    /// Returns an error on bad transport or an invalid phase or connector
    pub fn enable_dclk(&self, indexes: &[u8], phase: u16) -> Result<()> {
        let pattern = phase_pattern(phase)?;
        for index in indexes {
            self.handle.queue_write(dclk_register(*index)?, pattern)?;
        }
        self.handle.flush()
    }

    /// # Errors
    /// Returns an error on bad transport or an invalid connector
    pub fn disable_dclk(&self, indexes: &[u8]) -> Result<()> {
        for index in indexes {
            self.handle.queue_write(dclk_register(*index)?, PHASE_DCLK_OFF)?;
        }
        self.handle.flush()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_all_dclk(&self) -> Result<()> {
        self.enable_dclk(&[0, 1, 2, 3, 4], PHASE_DCLK_DEFAULT)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_all_dclk(&self) -> Result<()> {
        self.disable_dclk(&[0, 1, 2, 3, 4])
    }

    /// The phase of connector `index`, `None` when its clock is off
    /// # Errors
    /// Returns an error on bad transport or an unknown pattern
    pub fn dclk_phase(&self, index: u8) -> Result<Option<u16>> {
        let raw = self.handle.read(dclk_register(index)?)?;
        if raw == PHASE_DCLK_OFF {
            return Ok(None);
        }
        PHASES
            .iter()
            .find(|(_, pattern)| *pattern == raw)
            .map(|(deg, _)| Some(*deg))
            .ok_or_else(|| Error::HardwareInconsistency(format!("DCLK pattern {raw:#010b}")))
    }

    /// Whether any connector is clocking its sensors
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_any_dclk_enabled(&self) -> Result<bool> {
        for index in 0..CONNECTORS {
            if self.dclk_phase(index)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// # Errors
    /// Returns an error on bad transport or a phase wider than 3 bits
    pub fn force_phase(&self, phase: u16) -> Result<()> {
        crate::error::ensure_range!(phase | 0x7 == 0x7, "forced phase {phase}");
        self.handle
            .write(AlpideControlRegister::PhaseForce, 1 << 3 | phase)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn release_phase_force(&self) -> Result<()> {
        let phase = self.handle.read(AlpideControlRegister::PhaseForce)? & 0x7;
        self.handle.write(AlpideControlRegister::PhaseForce, phase)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_phase_forced(&self) -> Result<bool> {
        Ok(self.handle.read(AlpideControlRegister::PhaseForce)? >> 3 & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport or an offset wider than 3 bits
    pub fn set_auto_phase_offset(&self, offset: u16) -> Result<()> {
        crate::error::ensure_range!(offset | 0x7 == 0x7, "auto phase offset {offset}");
        self.handle
            .write(AlpideControlRegister::AutoPhaseOffset, offset)
    }

    /// # Errors
    /// Returns an error on bad transport or a value wider than 5 bits
    pub fn set_wait_cycles(&self, cycles: u16) -> Result<()> {
        crate::error::ensure_range!(cycles | 0x1F == 0x1F, "wait cycles {cycles}");
        self.handle.write(AlpideControlRegister::WaitCycles, cycles)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn wait_cycles(&self) -> Result<u16> {
        self.handle.read(AlpideControlRegister::WaitCycles)
    }

    /// Drains the DCTRL debug FIFO, low byte of each word first
    /// # Errors
    /// Returns an error on bad transport
    pub fn dump_db_fifo(&self) -> Result<Vec<u8>> {
        let count = self.handle.read(AlpideControlRegister::DbFifoRdcount)? & 0x7F;
        let words = self
            .handle
            .read_many(&vec![AlpideControlRegister::DbFifoData; usize::from(count)])?;
        Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_counters(&self) -> Result<()> {
        self.monitor.reset_all_counters()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_counters(&self, reset_after: bool) -> Result<BTreeMap<KString, u32>> {
        self.monitor.read_counters(None, true, reset_after)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<AlpideControlRegister>("ALPIDE CONTROL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        master::WishboneMaster,
        transport::mock::Mock,
    };
    use paste::paste;
    use std::sync::{
        Arc,
        Mutex,
    };

    fn alpide_control() -> (Arc<Mutex<WishboneMaster<Mock>>>, AlpideControl<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::AlpideControl);
        (master, AlpideControl::new(handle))
    }

    macro_rules! test_phase {
        ($deg:literal) => {
            paste! {
                #[test]
                fn [<test_dclk_phase_ $deg>]() {
                    let (_master, ac) = alpide_control();
                    ac.enable_dclk(&[2], $deg).unwrap();
                    assert_eq!(ac.dclk_phase(2).unwrap(), Some($deg));
                    ac.disable_dclk(&[2]).unwrap();
                    assert_eq!(ac.dclk_phase(2).unwrap(), None);
                }
            }
        };
    }

    test_phase!(0);
    test_phase!(135);
    test_phase!(180);
    test_phase!(315);

    #[test]
    fn test_bad_phase_and_connector() {
        let (_master, ac) = alpide_control();
        assert!(ac.enable_dclk(&[0], 10).is_err());
        assert!(ac.disable_dclk(&[5]).is_err());
        assert!(ac.set_dctrl_mask(0x20).is_err());
        assert!(ac.set_wait_cycles(0x20).is_err());
    }

    #[test]
    fn test_routes() {
        assert_eq!(dctrl_route(BROADCAST), (None, DCTRL_MASK_ALL));
        assert_eq!(dctrl_route(3), (Some(2), 0x04));
        // Inner barrel chip ids stop at 0xE
        assert_eq!(dctrl_route(0x08), (Some(2), 0x04));
        assert_eq!(dctrl_route(0x18), (Some(0), 0x01));
        assert_eq!(dctrl_route(0x10), (Some(1), 0x02));
        assert_eq!(dctrl_route(0x88), (Some(2), 0x04));
        assert_eq!(dctrl_route(0x80 | 0x10), (Some(3), 0x08));
    }

    #[test]
    fn test_opcode_counted() {
        let (_master, ac) = alpide_control();
        ac.reset_counters().unwrap();
        ac.write_chip_opcode(Opcode::Grst, BROADCAST).unwrap();
        ac.write_chip_opcode(Opcode::Pulse, BROADCAST).unwrap();
        let counters = ac.read_counters(false).unwrap();
        assert_eq!(counters["OPCODE"], 2);
        assert_eq!(counters["BROADCAST"], 2);
        assert_eq!(counters["PULSE_SENT"], 1);
        assert_eq!(ac.dctrl_mask().unwrap(), DCTRL_MASK_ALL);
    }

    #[test]
    fn test_phase_force() {
        let (_master, ac) = alpide_control();
        ac.force_phase(5).unwrap();
        assert!(ac.is_phase_forced().unwrap());
        ac.release_phase_force().unwrap();
        assert!(!ac.is_phase_forced().unwrap());
        assert_eq!(ac.handle.read(AlpideControlRegister::PhaseForce).unwrap(), 5);
    }

    #[test]
    fn test_manchester() {
        let (_master, ac) = alpide_control();
        ac.set_manchester_tx(true).unwrap();
        assert!(ac.manchester_tx().unwrap());
    }
}
