//! The internal trigger sequencer. It shares the register window of the trigger handler and
//! generates timeframes, heartbeats and physics triggers without a timing system.

use crate::{
    core::ModuleHandle,
    error::{
        ensure_range,
        Result,
    },
    transport::Transport,
    trigger::handler::{
        TriggerHandlerRegister,
        MAX_TRIGGER_PERIOD,
    },
};
use tracing::debug;

pub const MAX_TIMEFRAMES: u16 = 0x1FF;
/// Written to the timeframe count to run until stopped
pub const INFINITE_TIMEFRAMES: u16 = 1 << 9;
pub const MAX_HB_PER_TF: u16 = 0x1FF;

/// Run type the sequencer opens and closes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SequencerMode {
    Triggered = 0,
    Continuous = 1,
}

/// How physics triggers are spread over an accepted heartbeat frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PhysicsTriggerMode {
    Periodic = 0,
    /// The period is the mean distance
    Random = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SequencerConfig {
    pub mode: SequencerMode,
    /// `None` runs until stopped
    pub timeframes: Option<u16>,
    pub hb_per_tf: u16,
    /// Accepted heartbeats at the start of every timeframe, the rest are rejected
    pub hba_per_tf: u16,
    pub pt_mode: PhysicsTriggerMode,
    /// Physics trigger period in BC
    pub pt_period: u16,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            mode: SequencerMode::Triggered,
            timeframes: None,
            hb_per_tf: 256,
            hba_per_tf: 256,
            pt_mode: PhysicsTriggerMode::Periodic,
            pt_period: 0xFFF,
        }
    }
}

#[derive(Debug)]
pub struct Sequencer<T> {
    handle: ModuleHandle<T>,
}

impl<T> Sequencer<T>
where
    T: Transport,
{
    /// `handle` must point at the trigger handler
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self { handle }
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn start(&self) -> Result<()> {
        self.handle.write(TriggerHandlerRegister::SeqEnable, 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn stop(&self) -> Result<()> {
        self.handle.write(TriggerHandlerRegister::SeqEnable, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_started(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::SeqEnable)? == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_mode(&self, mode: SequencerMode) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::SeqContinuousNTrg, mode as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn mode(&self) -> Result<SequencerMode> {
        Ok(
            match self.handle.read(TriggerHandlerRegister::SeqContinuousNTrg)? {
                0 => SequencerMode::Triggered,
                _ => SequencerMode::Continuous,
            },
        )
    }

    /// # Errors
    /// Returns an error on bad transport or a count past [`MAX_TIMEFRAMES`]
    pub fn set_number_of_timeframes(&self, timeframes: u16) -> Result<()> {
        ensure_range!(timeframes <= MAX_TIMEFRAMES, "timeframes {timeframes}");
        self.handle
            .write(TriggerHandlerRegister::SeqNumTf, timeframes)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_number_of_timeframes_infinite(&self) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::SeqNumTf, INFINITE_TIMEFRAMES)
    }

    /// Timeframes left to generate, counted down while running
    /// # Errors
    /// Returns an error on bad transport
    pub fn number_of_timeframes(&self) -> Result<u16> {
        Ok(self.handle.read(TriggerHandlerRegister::SeqNumTf)? & MAX_TIMEFRAMES)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_infinite(&self) -> Result<bool> {
        Ok(self.handle.read(TriggerHandlerRegister::SeqNumTf)? & INFINITE_TIMEFRAMES != 0)
    }

    /// Whether a finite run generated all its timeframes
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_done(&self) -> Result<bool> {
        let raw = self.handle.read(TriggerHandlerRegister::SeqNumTf)?;
        Ok(raw & INFINITE_TIMEFRAMES == 0 && raw & MAX_TIMEFRAMES == 0)
    }

    /// # Errors
    /// Returns an error on bad transport or a count past [`MAX_HB_PER_TF`]
    pub fn set_number_of_hba_per_timeframe(&self, hba: u16) -> Result<()> {
        ensure_range!(hba <= MAX_HB_PER_TF, "HBa per timeframe {hba}");
        self.handle
            .write(TriggerHandlerRegister::SeqNumHbaPerTf, hba)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn number_of_hba_per_timeframe(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::SeqNumHbaPerTf)
    }

    /// # Errors
    /// Returns an error on bad transport or a count outside `1..=0x1FF`
    pub fn set_number_of_hb_per_timeframe(&self, hb: u16) -> Result<()> {
        ensure_range!((1..=MAX_HB_PER_TF).contains(&hb), "HB per timeframe {hb}");
        self.handle.write(TriggerHandlerRegister::SeqNumHbPerTf, hb)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn number_of_hb_per_timeframe(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::SeqNumHbPerTf)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_trigger_mode(&self, mode: PhysicsTriggerMode) -> Result<()> {
        self.handle
            .write(TriggerHandlerRegister::SeqPtMode, mode as u16)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_mode(&self) -> Result<PhysicsTriggerMode> {
        Ok(match self.handle.read(TriggerHandlerRegister::SeqPtMode)? {
            0 => PhysicsTriggerMode::Periodic,
            _ => PhysicsTriggerMode::Random,
        })
    }

    /// # Errors
    /// Returns an error on bad transport or a period outside `1..=0xFFF`
    pub fn set_trigger_period(&self, period_bc: u16) -> Result<()> {
        ensure_range!(
            (1..=MAX_TRIGGER_PERIOD).contains(&period_bc),
            "physics trigger period {period_bc}"
        );
        self.handle
            .write(TriggerHandlerRegister::SeqPtPeriod, period_bc)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn trigger_period(&self) -> Result<u16> {
        self.handle.read(TriggerHandlerRegister::SeqPtPeriod)
    }

    /// Stops the sequencer and programs `config`, leaving it ready for [`Sequencer::start`]
    /// # Errors
    /// Returns an error on bad transport or an out of range setting
    pub fn configure(&self, config: &SequencerConfig) -> Result<()> {
        debug!(?config, "Configuring sequencer");
        self.stop()?;
        self.set_mode(config.mode)?;
        match config.timeframes {
            Some(tf) => self.set_number_of_timeframes(tf)?,
            None => self.set_number_of_timeframes_infinite()?,
        }
        self.set_number_of_hb_per_timeframe(config.hb_per_tf)?;
        self.set_number_of_hba_per_timeframe(config.hba_per_tf)?;
        self.set_trigger_mode(config.pt_mode)?;
        self.set_trigger_period(config.pt_period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            ModuleId,
            ORBIT_BC,
        },
        master::WishboneMaster,
        transport::{
            mock::Mock,
            Transport,
        },
        trigger::handler::{
            TriggerHandler,
            TriggerSource,
        },
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    type Master = Arc<Mutex<WishboneMaster<Mock>>>;

    fn sequencer() -> (Master, TriggerHandler<Mock>, Sequencer<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::TriggerHandler);
        let th = TriggerHandler::new(handle.clone());
        (master, th, Sequencer::new(handle))
    }

    fn idle(master: &Master, bc: u32) {
        master.lock().unwrap().transport_mut().send_idle(bc).unwrap();
    }

    #[test]
    fn test_configure() {
        let (_master, _th, seq) = sequencer();
        let config = SequencerConfig {
            mode: SequencerMode::Continuous,
            timeframes: Some(12),
            hb_per_tf: 8,
            hba_per_tf: 6,
            pt_mode: PhysicsTriggerMode::Random,
            pt_period: 400,
        };
        seq.configure(&config).unwrap();
        assert!(!seq.is_started().unwrap());
        assert_eq!(seq.mode().unwrap(), SequencerMode::Continuous);
        assert_eq!(seq.number_of_timeframes().unwrap(), 12);
        assert!(!seq.is_infinite().unwrap());
        assert_eq!(seq.number_of_hb_per_timeframe().unwrap(), 8);
        assert_eq!(seq.number_of_hba_per_timeframe().unwrap(), 6);
        assert_eq!(seq.trigger_mode().unwrap(), PhysicsTriggerMode::Random);
        assert_eq!(seq.trigger_period().unwrap(), 400);
        seq.set_number_of_timeframes_infinite().unwrap();
        assert!(seq.is_infinite().unwrap());
        assert!(!seq.is_done().unwrap());
    }

    #[test]
    fn test_ranges() {
        let (_master, _th, seq) = sequencer();
        assert!(seq.set_number_of_timeframes(0x200).is_err());
        assert!(seq.set_number_of_hb_per_timeframe(0).is_err());
        assert!(seq.set_number_of_hba_per_timeframe(0x200).is_err());
        assert!(seq.set_trigger_period(0).is_err());
        assert!(seq.set_trigger_period(0x1000).is_err());
    }

    #[test]
    fn test_finite_triggered_run() {
        let (master, th, seq) = sequencer();
        th.set_trigger_source(TriggerSource::Sequencer).unwrap();
        th.setup_for_triggered_mode(100, false).unwrap();
        th.enable().unwrap();
        seq.configure(&SequencerConfig {
            mode: SequencerMode::Triggered,
            timeframes: Some(2),
            hb_per_tf: 4,
            hba_per_tf: 3,
            pt_mode: PhysicsTriggerMode::Periodic,
            pt_period: 891,
        })
        .unwrap();
        th.reset_counters().unwrap();
        seq.start().unwrap();
        idle(&master, 10 * ORBIT_BC);
        assert!(seq.is_done().unwrap());
        let counts = th
            .read_counters(Some(&["TF", "HB", "HBR", "PHYSICS", "SOT", "EOT"]), false)
            .unwrap();
        assert_eq!(counts["TF"], 2);
        assert_eq!(counts["HB"], 8);
        assert_eq!(counts["HBR"], 2);
        // Four physics triggers per accepted orbit
        assert_eq!(counts["PHYSICS"], 24);
        assert_eq!(counts["SOT"], 1);
        assert_eq!(counts["EOT"], 1);
        assert!(!th.is_triggered_mode().unwrap());
    }

    #[test]
    fn test_rates_from_sequencer() {
        let (master, th, seq) = sequencer();
        th.set_trigger_source(TriggerSource::Sequencer).unwrap();
        th.enable().unwrap();
        seq.configure(&SequencerConfig {
            hb_per_tf: 4,
            hba_per_tf: 2,
            pt_period: 1782,
            ..SequencerConfig::default()
        })
        .unwrap();
        seq.start().unwrap();
        let pre = th.read_counters(None, false).unwrap();
        idle(&master, 8 * ORBIT_BC);
        let post = th.read_counters(None, false).unwrap();
        let rates = crate::trigger::handler::TriggerRates::from_counts(
            &crate::trigger::handler::TriggerCounts::between(&pre, &post),
        )
        .unwrap();
        assert!((rates.hb_per_tf - 4.0).abs() < 1e-9);
        assert!((rates.hba_per_tf - 2.0).abs() < 1e-9);
        assert!((rates.pt_per_hba - 2.0).abs() < 1e-9);
        seq.stop().unwrap();
    }
}
