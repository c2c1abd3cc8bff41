//! The GBTx optical link chips, configured through [`GbtxBridge`]
use crate::{
    core::{
        ModuleHandle,
        ModuleId,
    },
    error::{
        ensure_range,
        Result,
    },
    i2c::gbtx_bridge::{
        GbtxBridge,
        GBTX_CHIPS,
    },
    transport::Transport,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use ru_utils::gbtx::GBTX_CONFIG_REGISTERS;
use std::time::Duration;
use tracing::{
    error,
    info,
    warn,
};

/// Register addresses of the GBTx used by the control software
pub mod registers {
    pub const TTC_CTR0: u16 = 4;
    pub const TTC_CTR4: u16 = 8;
    pub const TX_CTR1: u16 = 29;
    pub const TX_CTR2: u16 = 30;
    pub const TX_CTR3: u16 = 31;
    pub const TX_CTR5: u16 = 33;
    pub const RX_CTR0: u16 = 35;
    pub const RX_CTR6: u16 = 41;
    pub const WDOG_CTR0: u16 = 50;
    pub const WDOG_CTR3: u16 = 53;
    pub const WDOG_CTR4: u16 = 54;
    pub const CK_CTR44: u16 = 313;
    pub const CK_CTR45: u16 = 314;
    pub const CK_CTR46: u16 = 315;
    pub const CONFIG_DONE: u16 = 365;
    pub const TEST_FUSE_DATA1: u16 = 367;
    pub const TEST_FUSE_DATA2: u16 = 368;
    pub const TX_RX_EPLL_LOCKED: u16 = 427;
    pub const INST_LOCK_PU_FSM: u16 = 431;
    pub const RX_REF_PLL_LOSS_OF_LOCK_COUNT: u16 = 432;
    pub const EPLL_RX_LOSS_OF_LOCK_COUNT: u16 = 434;
    pub const FEC_CORRECTION_COUNT: u16 = 435;
}

/// Registers needed to bring the chip up with its internal clock
pub const MINIMAL_CONFIG_INTERNAL_CLOCK: &[usize] = &[
    27, 29, 30, 31, 32, 34, 35, 37, 38, 39, 41, 46, 47, 48, 50, 52, 242, 243, 244, 281, 283, 313,
    314, 315, 316, 317, 318,
];

/// Registers needed to bring the chip up with the recovered clock
pub const MINIMAL_CONFIG_EXTERNAL_CLOCK: &[usize] = &[
    27, 29, 30, 31, 32, 34, 35, 37, 38, 39, 41, 46, 47, 48, 50, 52, 242, 243, 244, 283,
];

/// States of the power-up state machine
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum PuFsmStatus {
    Reset = 0,
    Fclrn = 1,
    Contention = 2,
    Fsetp = 3,
    Update = 4,
    PauseForConfig = 5,
    InitXpll = 6,
    WaitXpllLock = 7,
    ResetDes1 = 8,
    ResetDes2 = 9,
    WaitDesLock = 10,
    ResetRxEpll1 = 11,
    ResetRxEpll2 = 12,
    WaitRxEpllLock = 13,
    ResetSer1 = 14,
    ResetSer2 = 15,
    WaitSerLock = 16,
    ResetTxEpll1 = 17,
    ResetTxEpll2 = 18,
    WaitTxEpllLock = 19,
    DllReset = 20,
    WaitDllLocked = 21,
    PaReset = 22,
    InitScram = 23,
    Idle = 24,
    WaitVcoStable = 25,
    ResetPsPll1 = 26,
    ResetPsPll2 = 27,
    WaitPsPllLocked = 28,
    ResetPsDll = 29,
    WaitPsDllLocked = 30,
}

/// Register subset written by a minimal configuration
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MinimalConfig {
    InternalClock,
    ExternalClock,
}

impl MinimalConfig {
    fn indices(self) -> &'static [usize] {
        match self {
            MinimalConfig::InternalClock => MINIMAL_CONFIG_INTERNAL_CLOCK,
            MinimalConfig::ExternalClock => MINIMAL_CONFIG_EXTERNAL_CLOCK,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct ConfigureOptions {
    /// Check the bus status after every register write
    pub check: bool,
    /// Refuse to configure a chip that isn't paused for configuration
    pub pre_check_fsm: bool,
    pub minimal: Option<MinimalConfig>,
    /// Keep the final register, which restarts the power-up sequence
    pub restart_powerup_seq: bool,
    pub show_progress: bool,
}

impl Default for ConfigureOptions {
    fn default() -> Self {
        Self {
            check: false,
            pre_check_fsm: true,
            minimal: None,
            restart_powerup_seq: true,
            show_progress: false,
        }
    }
}

/// Outcome of [`Gbtx::configure`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConfigureOutcome {
    pub configured: bool,
    /// The chip had completed its configuration before anything was written
    pub already_configured: bool,
}

/// Selects the `(register, value)` pairs a configuration writes
#[must_use]
pub fn config_registers(
    regs: &[u8],
    minimal: Option<MinimalConfig>,
    restart_powerup_seq: bool,
) -> Vec<(u16, u8)> {
    let mut config: Vec<(u16, u8)> = regs
        .iter()
        .take(GBTX_CONFIG_REGISTERS)
        .enumerate()
        .filter_map(|(i, v)| u16::try_from(i).ok().map(|i| (i, *v)))
        .collect();
    if !restart_powerup_seq {
        config.pop();
    }
    match minimal {
        Some(m) => m
            .indices()
            .iter()
            .filter_map(|i| config.get(*i).copied())
            .collect(),
        None => config,
    }
}

#[derive(Debug)]
pub struct Gbtx<T> {
    handle: ModuleHandle<T>,
    bridge: GbtxBridge<T>,
    index: u8,
}

impl<T> Gbtx<T>
where
    T: Transport,
{
    /// # Errors
    /// Returns an error if there's no chip `index` on the board
    pub fn new(handle: &ModuleHandle<T>, index: u8) -> Result<Self> {
        ensure_range!(index < GBTX_CHIPS, "GBTx index {index}");
        Ok(Self {
            handle: handle.sibling(ModuleId::I2cGbt),
            bridge: GbtxBridge::new(handle),
            index,
        })
    }

    #[must_use]
    pub fn index(&self) -> u8 {
        self.index
    }

    #[must_use]
    pub fn bridge(&self) -> &GbtxBridge<T> {
        &self.bridge
    }

    /// # Errors
    /// Returns an error on bad transport or bus status
    pub fn write(&self, register: u16, value: u8, check: bool) -> Result<()> {
        self.bridge
            .write_gbtx_register(self.index, register, value, check)
    }

    /// # Errors
    /// Returns an error on bad transport or bus status
    pub fn read(&self, register: u16, check: bool) -> Result<u8> {
        self.bridge.read_gbtx_register(self.index, register, check)
    }

    /// Writes a configuration dump to the chip
    /// # Errors
    /// Returns an error on bad transport, or on a bad bus status when `options.check` is set
    pub fn configure(&self, regs: &[u8], options: ConfigureOptions) -> Result<ConfigureOutcome> {
        let failed = ConfigureOutcome {
            configured: false,
            already_configured: false,
        };
        if self.read(0, true).is_err() {
            error!("Could not read GBTx {} - stopping config!", self.index);
            return Ok(failed);
        }
        let status = self.read_fsm()?;
        if options.pre_check_fsm && !Self::is_ready_for_config(status) {
            if Self::is_config_completed(status) {
                warn!(
                    "GBTx {} already configured, pass pre_check_fsm = false to configure anyway",
                    self.index
                );
                return Ok(ConfigureOutcome {
                    configured: true,
                    already_configured: true,
                });
            }
            error!(
                "GBTx {} not paused for config - stopping config! Current state: {}",
                self.index,
                fsm_name(status)
            );
            return Ok(failed);
        }
        self.bridge.reset_counters()?;
        let config = config_registers(regs, options.minimal, options.restart_powerup_seq);
        self.bridge
            .gbtx_config(self.index, &config, options.check, options.show_progress)?;
        if !options.check {
            self.handle.settle(Duration::from_secs(1))?;
        }
        Ok(ConfigureOutcome {
            configured: Self::is_config_completed(self.read_fsm()?),
            already_configured: false,
        })
    }

    /// Reads back the registers a configuration writes
    /// # Errors
    /// Returns an error on bad transport
    pub fn check_config(&self, regs: &[u8], minimal: Option<MinimalConfig>) -> Result<bool> {
        self.bridge.reset_counters()?;
        let config = config_registers(regs, minimal, true);
        self.bridge.check_gbtx_config(self.index, &config)
    }

    /// Current state of the power-up state machine
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_fsm(&self) -> Result<u8> {
        Ok(self.read(registers::INST_LOCK_PU_FSM, true)? >> 2)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn pu_fsm_status(&self) -> Result<Option<PuFsmStatus>> {
        Ok(PuFsmStatus::from_u8(self.read_fsm()?))
    }

    fn is_ready_for_config(status: u8) -> bool {
        status == PuFsmStatus::PauseForConfig as u8
    }

    fn is_config_completed(status: u8) -> bool {
        status == PuFsmStatus::Idle as u8
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_ready_for_configuration(&self) -> Result<bool> {
        Ok(Self::is_ready_for_config(self.read_fsm()?))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_configured(&self) -> Result<bool> {
        Ok(Self::is_config_completed(self.read_fsm()?))
    }

    /// The fused chip serial number
    /// # Errors
    /// Returns an error on bad transport
    pub fn serial_number(&self) -> Result<u16> {
        let lsb = self.read(registers::TEST_FUSE_DATA1, true)?;
        let msb = self.read(registers::TEST_FUSE_DATA2, true)?;
        Ok(u16::from(msb) << 8 | u16::from(lsb))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_tx_rx_pll_locked(&self) -> Result<bool> {
        Ok(self.read(registers::TX_RX_EPLL_LOCKED, true)? & 0x5 == 0x5)
    }

    /// # Errors
    /// Returns an error on bad transport or a value wider than four bits
    pub fn set_phase_detector_charge_pump(&self, value: u8) -> Result<()> {
        ensure_range!(value <= 0xF, "charge pump value {value}");
        let current = self.read(registers::RX_CTR0, false)?;
        self.write(registers::RX_CTR0, (current & 0x0F) | value << 4, false)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn phase_detector_charge_pump(&self) -> Result<u8> {
        Ok(self.read(registers::RX_CTR0, false)? >> 4)
    }

    /// Number of corrections done by the forward error correction
    /// # Errors
    /// Returns an error on bad transport
    pub fn fec_corrections(&self) -> Result<u8> {
        self.read(registers::FEC_CORRECTION_COUNT, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn rx_ref_pll_loss_of_lock_count(&self) -> Result<u8> {
        self.read(registers::RX_REF_PLL_LOSS_OF_LOCK_COUNT, true)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn rx_epll_loss_of_lock_count(&self) -> Result<u8> {
        self.read(registers::EPLL_RX_LOSS_OF_LOCK_COUNT, true)
    }

    /// Coarse delay of clock `channel`
    /// # Errors
    /// Returns an error on bad transport or an out of range argument
    pub fn set_coarse_delay(&self, channel: u8, delay: u8) -> Result<()> {
        ensure_range!(channel < 8, "clock channel {channel}");
        ensure_range!(delay <= 0x1F, "coarse delay {delay}");
        self.write(registers::TTC_CTR4 + u16::from(channel), delay, true)
    }

    /// # Errors
    /// Returns an error on bad transport or an out of range argument
    pub fn coarse_delay(&self, channel: u8) -> Result<u8> {
        ensure_range!(channel < 8, "clock channel {channel}");
        self.read(registers::TTC_CTR4 + u16::from(channel), true)
    }

    /// Fine delay of clock `channel`, two channels share a register
    /// # Errors
    /// Returns an error on bad transport or an out of range argument
    pub fn set_fine_delay(&self, channel: u8, delay: u8) -> Result<()> {
        ensure_range!(channel < 8, "clock channel {channel}");
        ensure_range!(delay <= 0xF, "fine delay {delay}");
        let register = registers::TTC_CTR0 + u16::from(channel / 2);
        let old = self.read(register, true)?;
        let value = if channel % 2 == 0 {
            old & 0xF0 | delay
        } else {
            delay << 4 | old & 0x0F
        };
        self.write(register, value, true)
    }

    /// # Errors
    /// Returns an error on bad transport or an out of range argument
    pub fn fine_delay(&self, channel: u8) -> Result<u8> {
        ensure_range!(channel < 8, "clock channel {channel}");
        let value = self.read(registers::TTC_CTR0 + u16::from(channel / 2), true)?;
        Ok(if channel % 2 == 0 {
            value & 0xF
        } else {
            value >> 4 & 0xF
        })
    }

    /// Runs the XPLL from the crystal oscillator
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_xpll_mode_xosc(&self) -> Result<()> {
        for reg in [registers::CK_CTR44, registers::CK_CTR45, registers::CK_CTR46] {
            self.write(reg, 0x4E, true)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_xpll_mode_pll(&self) -> Result<()> {
        for reg in [registers::CK_CTR44, registers::CK_CTR45, registers::CK_CTR46] {
            self.write(reg, 0xCE, true)?;
        }
        Ok(())
    }

    /// Sets `bits` of `register`, lets the chip settle and restores the old value
    fn pulse_bits(&self, register: u16, bits: u8) -> Result<()> {
        let value = self.read(register, true)?;
        self.write(register, value | bits, true)?;
        self.handle.settle(Duration::from_millis(100))?;
        self.write(register, value, true)
    }

    /// Resets the TX logic, TX and RX control, the receiver and the RX PLL, in that order
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset(&self) -> Result<()> {
        self.pulse_bits(registers::WDOG_CTR4, 0x7)?;
        self.pulse_bits(registers::TX_CTR5, 0x7)?;
        self.pulse_bits(registers::RX_CTR6, 0x7)?;
        self.pulse_bits(registers::WDOG_CTR0, 0x7 << 3)?;
        self.pulse_bits(registers::WDOG_CTR3, 0x3F)?;
        info!(gbtx = self.index, "GBTx reset");
        Ok(())
    }

    /// Every configuration register, in order
    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn dump_config(&self) -> Result<Vec<u8>> {
        self.bridge
            .read_gbtx_registers(self.index, 0, GBTX_CONFIG_REGISTERS as u16)
    }
}

fn fsm_name(status: u8) -> String {
    PuFsmStatus::from_u8(status).map_or_else(|| "UNKNOWN STATE".to_owned(), |s| format!("{s:?}"))
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

    fn gbtx(index: u8) -> (Arc<Mutex<WishboneMaster<Mock>>>, Gbtx<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::I2cGbt);
        let gbtx = Gbtx::new(&handle, index).unwrap();
        (master, gbtx)
    }

    fn full_config() -> Vec<u8> {
        let mut regs: Vec<u8> = (0..GBTX_CONFIG_REGISTERS).map(|i| (i % 251) as u8).collect();
        regs[usize::from(registers::CONFIG_DONE)] = 0xAA;
        regs
    }

    #[test]
    fn test_configure() {
        let (_master, gbtx) = gbtx(1);
        assert_eq!(gbtx.pu_fsm_status().unwrap(), Some(PuFsmStatus::PauseForConfig));
        let regs = full_config();
        let outcome = gbtx.configure(&regs, ConfigureOptions::default()).unwrap();
        assert!(outcome.configured && !outcome.already_configured);
        assert!(gbtx.check_config(&regs, None).unwrap());
        assert_eq!(gbtx.dump_config().unwrap(), regs);
        // A second attempt notices the chip is done
        let again = gbtx.configure(&regs, ConfigureOptions::default()).unwrap();
        assert!(again.already_configured);
    }

    #[test]
    fn test_minimal_config_subset() {
        let regs = full_config();
        let minimal = config_registers(&regs, Some(MinimalConfig::ExternalClock), true);
        assert_eq!(minimal.len(), MINIMAL_CONFIG_EXTERNAL_CLOCK.len());
        assert_eq!(minimal[0], (27, 27));
        let without_restart = config_registers(&regs, None, false);
        assert_eq!(without_restart.len(), GBTX_CONFIG_REGISTERS - 1);
    }

    #[test]
    fn test_minimal_config_does_not_complete() {
        let (_master, gbtx) = gbtx(2);
        let options = ConfigureOptions {
            minimal: Some(MinimalConfig::InternalClock),
            ..ConfigureOptions::default()
        };
        let outcome = gbtx.configure(&full_config(), options).unwrap();
        assert!(!outcome.configured);
        assert!(gbtx
            .check_config(&full_config(), Some(MinimalConfig::InternalClock))
            .unwrap());
    }

    #[test]
    fn test_charge_pump() {
        let (_master, gbtx) = gbtx(0);
        gbtx.write(registers::RX_CTR0, 0x0A, false).unwrap();
        gbtx.set_phase_detector_charge_pump(15).unwrap();
        assert_eq!(gbtx.phase_detector_charge_pump().unwrap(), 15);
        assert_eq!(gbtx.read(registers::RX_CTR0, false).unwrap(), 0xFA);
        assert!(gbtx.set_phase_detector_charge_pump(16).is_err());
    }

    #[test]
    fn test_serial_and_pll() {
        let (master, gbtx) = gbtx(0);
        let expected = master.lock().unwrap().transport().gbtx_serial(0);
        assert_eq!(gbtx.serial_number().unwrap(), expected);
        assert!(gbtx.is_tx_rx_pll_locked().unwrap());
    }

    #[test]
    fn test_delays() {
        let (_master, gbtx) = gbtx(1);
        gbtx.set_fine_delay(2, 0x3).unwrap();
        gbtx.set_fine_delay(3, 0xC).unwrap();
        assert_eq!(gbtx.fine_delay(2).unwrap(), 0x3);
        assert_eq!(gbtx.fine_delay(3).unwrap(), 0xC);
        gbtx.set_coarse_delay(7, 0x1F).unwrap();
        assert_eq!(gbtx.coarse_delay(7).unwrap(), 0x1F);
        assert!(gbtx.set_coarse_delay(8, 0).is_err());
    }

    #[test]
    fn test_reset_restores_registers() {
        let (_master, gbtx) = gbtx(2);
        gbtx.write(registers::WDOG_CTR3, 0x40, true).unwrap();
        gbtx.reset().unwrap();
        assert_eq!(gbtx.read(registers::WDOG_CTR3, true).unwrap(), 0x40);
    }
}
