//! Stave bring-up.
//!
//! A [`ReadoutUnit`] owns the channel to one board and every register module on it. Its
//! operations sequence the board from power-up to data taking: identity, GBTx clocking, stave
//! power, transceiver alignment and finally the trigger handler. [`ReadoutUnit::bringup`] runs the
//! whole sequence and powers the stave back off if any step fails.

pub mod config;

pub use config::{
    BringupConfig,
    GbtxConfig,
    GbtxFiles,
    TemperatureLimits,
    TriggerMode,
    TriggerSetup,
};

use crate::{
    core::{
        ModuleHandle,
        ModuleId,
    },
    error::Result,
    i2c::{
        gbtx::{
            ConfigureOptions,
            MinimalConfig,
        },
        Gbtx,
        GbtxBridge,
    },
    master::WishboneMaster,
    modules::{
        alpide_control::AlpideControl,
        calibration_lane::CalibrationLane,
        clock_health::ClockHealth,
        data_lane::DataLane,
        gbt_packer::GbtPacker,
        gpio::Gpio,
        gth::Gth,
        identity::{
            FeeId,
            Identity,
            Layer,
        },
        monitor::{
            CounterMonitor,
            MASTER_MONITOR,
        },
        readout_master::ReadoutMaster,
        wait::WishboneWait,
    },
    power::{
        CableModel,
        PowerUnit,
    },
    transport::Transport,
    trigger::{
        handler::TriggerSource,
        Sequencer,
        TriggerHandler,
    },
};
use anyhow::{
    bail,
    ensure,
    Context,
};
use indicatif::ProgressBar;
use rand::Rng;
use std::{
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};
use tracing::{
    error,
    info,
    warn,
};

/// Time given to the trigger handler to see two orbits after enabling the timebase sync
const TIMEBASE_SYNC_SETTLE: Duration = Duration::from_millis(1);
/// Temperature reads exercising the Power Unit bus before anything is switched on
const PU_COMM_CHECKS: usize = 3;

/// What [`ReadoutUnit::identify`] found out about the board
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct IdentityReport {
    pub git_hash: u32,
    pub dna: u128,
    /// Seconds since the FPGA was configured
    pub uptime: f64,
    pub fee_id: FeeId,
}

/// One Readout Unit and the stave behind it
#[derive(Debug)]
pub struct ReadoutUnit<T> {
    master: Arc<Mutex<WishboneMaster<T>>>,
    handle: ModuleHandle<T>,
    pub identity: Identity<T>,
    pub clock_health: ClockHealth<T>,
    pub wait: WishboneWait<T>,
    pub master_monitor: CounterMonitor<T>,
    pub gth: Gth<T>,
    pub gpio: Gpio<T>,
    pub readout_master: ReadoutMaster<T>,
    pub datalane_ib: DataLane<T>,
    pub datalane_ob: DataLane<T>,
    pub calibration_lane: CalibrationLane<T>,
    pub gbt_packer: GbtPacker<T>,
    pub alpide_control: AlpideControl<T>,
    pub trigger_handler: TriggerHandler<T>,
    pub sequencer: Sequencer<T>,
    pub gbtx_bridge: GbtxBridge<T>,
    power_unit: Option<PowerUnit<T>>,
}

impl<T> ReadoutUnit<T>
where
    T: Transport,
{
    pub fn new(transport: T) -> Self {
        let master = Arc::new(Mutex::new(WishboneMaster::new(transport)));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::MasterMonitor);
        let module = |id| handle.sibling(id);
        Self {
            identity: Identity::new(module(ModuleId::Identity)),
            clock_health: ClockHealth::new(module(ModuleId::ClockHealthStatus)),
            wait: WishboneWait::new(module(ModuleId::FwWait)),
            master_monitor: CounterMonitor::new(
                module(ModuleId::MasterMonitor),
                "MASTER MONITOR",
                MASTER_MONITOR,
            ),
            gth: Gth::new(module(ModuleId::GthControl)),
            gpio: Gpio::new(module(ModuleId::GpioControl)),
            readout_master: ReadoutMaster::new(module(ModuleId::ReadoutMaster)),
            datalane_ib: DataLane::inner(&handle),
            datalane_ob: DataLane::outer(&handle),
            calibration_lane: CalibrationLane::new(module(ModuleId::CalibrationLane)),
            gbt_packer: GbtPacker::new(module(ModuleId::GbtPacker)),
            alpide_control: AlpideControl::new(module(ModuleId::AlpideControl)),
            trigger_handler: TriggerHandler::new(module(ModuleId::TriggerHandler)),
            sequencer: Sequencer::new(module(ModuleId::TriggerHandler)),
            gbtx_bridge: GbtxBridge::new(&handle),
            power_unit: None,
            handle,
            master,
        }
    }

    /// The channel every module of this board shares
    #[must_use]
    pub fn master(&self) -> &Arc<Mutex<WishboneMaster<T>>> {
        &self.master
    }

    /// # Errors
    /// Returns an error if there's no GBTx `index` on the board
    pub fn gbtx(&self, index: u8) -> Result<Gbtx<T>> {
        Gbtx::new(&self.handle, index)
    }

    /// The Power Unit connected by [`Self::power_on_stave`], if any
    #[must_use]
    pub fn power_unit(&self) -> Option<&PowerUnit<T>> {
        self.power_unit.as_ref()
    }

    pub fn power_unit_mut(&mut self) -> Option<&mut PowerUnit<T>> {
        self.power_unit.as_mut()
    }

    // Identity

    /// Reads and logs what the board is and how long it has been up
    /// # Errors
    /// Returns an error on bad transport or an undecodable front-end id
    pub fn identify(&self) -> Result<IdentityReport> {
        let report = IdentityReport {
            git_hash: self.identity.git_hash()?,
            dna: self.identity.dna(true)?,
            uptime: self.identity.uptime_seconds()?,
            fee_id: self.identity.decoded_fee_id()?,
        };
        info!(
            "Readout Unit {}: githash {:08x}, DNA {:#x}, up for {:.1} s",
            report.fee_id.stave_name(),
            report.git_hash,
            report.dna,
            report.uptime
        );
        Ok(report)
    }

    /// Layer and stave name the bring-up works with, the layer possibly overridden by `config`
    /// # Errors
    /// Returns an error on bad transport, an undecodable front-end id or a bad override
    pub fn stave(&self, config: &BringupConfig) -> Result<(Layer, String)> {
        let fee = self.identity.decoded_fee_id()?;
        let layer = config.layer_override()?.unwrap_or(fee.layer);
        Ok((layer, format!("L{}_{:02}", layer.number(), fee.stave)))
    }

    // Clocking

    /// Programs the phase-detector charge pump of GBTx0 and reads it back
    /// # Errors
    /// Returns an error if the value doesn't stick, or on bad transport
    pub fn initialize_gbtx0_charge_pump(&self, value: u8) -> anyhow::Result<()> {
        info!("Setting GBTx0 phase detector charge pump to {value}");
        let gbtx0 = self.gbtx(0)?;
        gbtx0.set_phase_detector_charge_pump(value)?;
        let read = gbtx0.phase_detector_charge_pump()?;
        if read != value {
            error!("GBTx0 charge pump reads {read}, expected {value}");
            bail!("GBTx0 charge pump not set");
        }
        Ok(())
    }

    /// Brings GBTx2 then GBTx1 up on their minimal clock configurations, then writes both full
    /// configurations and verifies them by readback. A failed chip is tried once more.
    /// # Errors
    /// Returns an error if a chip fails twice, or on bad transport
    pub fn initialize_gbtx12(&self, config: &GbtxConfig) -> anyhow::Result<()> {
        let gbtx1 = self.gbtx(1)?;
        let gbtx2 = self.gbtx(2)?;
        for (gbtx, regs, minimal) in [
            (&gbtx2, &config.gbtx2, MinimalConfig::InternalClock),
            (&gbtx1, &config.gbtx1, MinimalConfig::ExternalClock),
        ] {
            let outcome = gbtx.configure(
                regs,
                ConfigureOptions {
                    minimal: Some(minimal),
                    ..ConfigureOptions::default()
                },
            )?;
            info!(?outcome, "GBTx{} minimal configuration", gbtx.index());
        }
        for (gbtx, regs) in [(&gbtx2, &config.gbtx2), (&gbtx1, &config.gbtx1)] {
            if let Err(e) = Self::configure_gbtx(gbtx, regs, true) {
                warn!("{e:#}, retrying");
                Self::configure_gbtx(gbtx, regs, false)?;
            }
            info!("GBTx{} configured", gbtx.index());
        }
        Ok(())
    }

    fn configure_gbtx(gbtx: &Gbtx<T>, regs: &[u8], pre_check_fsm: bool) -> anyhow::Result<()> {
        let index = gbtx.index();
        let outcome = gbtx
            .configure(
                regs,
                ConfigureOptions {
                    pre_check_fsm,
                    ..ConfigureOptions::default()
                },
            )
            .with_context(|| format!("GBTx{index} configuration"))?;
        ensure!(outcome.configured, "GBTx{index} did not complete its configuration");
        if !outcome.already_configured {
            ensure!(
                gbtx.check_config(regs, None)?,
                "GBTx{index} configuration readback failed"
            );
        }
        Ok(())
    }

    /// Charge pump first, then GBTx1 and GBTx2 when their configuration is given
    /// # Errors
    /// See [`Self::initialize_gbtx0_charge_pump`] and [`Self::initialize_gbtx12`]
    pub fn initialize(&self, charge_pump: u8, gbtx: Option<&GbtxConfig>) -> anyhow::Result<()> {
        self.initialize_gbtx0_charge_pump(charge_pump)?;
        match gbtx {
            Some(config) => self.initialize_gbtx12(config),
            None => {
                warn!("No GBTx1/GBTx2 configuration, leaving them as they are");
                Ok(())
            }
        }
    }

    /// Whether GBTx0 runs with at least `charge_pump`
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_initialized(&self, charge_pump: u8) -> Result<bool> {
        Ok(charge_pump <= self.gbtx(0)?.phase_detector_charge_pump()?)
    }

    // Power

    fn stave_modules(config: &BringupConfig, pu: &PowerUnit<T>) -> Vec<u8> {
        if config.modules.is_empty() {
            pu.topology().stave_modules().collect()
        } else {
            config.modules.clone()
        }
    }

    /// Connects the Power Unit of `config` and powers the stave: sensor clocks off, set-points,
    /// temperature interlock, bias, AVDD and DVDD, sensor clocks back on and finally the power
    /// and bias interlock re-armed.
    /// # Errors
    /// Returns an error if any step fails. A failure while switching on leaves everything off.
    pub fn power_on_stave(&mut self, config: &BringupConfig) -> anyhow::Result<()> {
        let (layer, stave) = self.stave(config)?;
        let mut pu = PowerUnit::new(
            &self.handle,
            config.connector()?,
            layer,
            config.power_unit_version,
        );
        pu.set_offsets(config.offsets(&stave));
        pu.set_interlock_vector(&config.temperature.sensors());
        let pu = self.power_unit.insert(pu);
        let modules = Self::stave_modules(config, pu);
        info!("Powering on {stave}, modules {modules:?}");

        pu.initialize()?;
        pu.check_i2c_comm(PU_COMM_CHECKS)?;
        pu.log_temperatures()?;
        self.alpide_control.disable_all_dclk()?;
        pu.setup_power_modules(&config.power, &modules, false)?;
        pu.controller()
            .enable_temperature_interlock(&config.temperature.limits(), false)?;
        pu.power_on_modules(&modules, config.backbias, true)?;
        self.alpide_control.enable_all_dclk()?;

        // The sensors start drawing once clocked
        pu.settle(Duration::from_millis(100))?;
        if pu.controller().did_interlock_fire()? {
            pu.log_values_modules(&modules, false)?;
            self.alpide_control.disable_all_dclk()?;
            pu.power_off_all(false)?;
            bail!("Interlock fired after enabling the sensor clock on {stave}");
        }
        let (power, bias) = pu.controller().expected_power_bias_enable_mask()?;
        pu.controller().enable_power_bias_interlock(power, bias)?;
        pu.log_values_modules(&modules, false)?;
        info!("{stave} powered");
        Ok(())
    }

    /// Moves the set-points to make up for the voltage drops along the cables
    /// # Errors
    /// Returns an error if no Power Unit is connected, an inner layer stave has no cable
    /// resistances, or the compensation fails
    pub fn compensate_voltage_drops(&self, config: &BringupConfig) -> anyhow::Result<()> {
        let (layer, stave) = self.stave(config)?;
        let cable = if layer.is_ib() {
            Some(CableModel::Measured(config.cable(&stave)?))
        } else {
            None
        };
        let Some(pu) = &self.power_unit else {
            bail!("No Power Unit connected");
        };
        let modules = Self::stave_modules(config, pu);
        if let Some(cable) = cable {
            pu.compensate_voltage_drops(
                &cable,
                Some(config.power.dvdd),
                Some(config.power.avdd),
                &modules,
                true,
            )
        } else {
            pu.compensate_voltage_drops_ob(
                config.cable_length,
                config.power.dvdd,
                config.power.avdd,
                Some(&modules),
            )
        }
    }

    /// Stops the sensor clocks and switches every output of the Power Unit off
    /// # Errors
    /// Returns an error if no Power Unit is connected, or on bad transport
    pub fn power_off_stave(&self) -> anyhow::Result<()> {
        let Some(pu) = &self.power_unit else {
            bail!("No Power Unit connected");
        };
        self.alpide_control.disable_all_dclk()?;
        pu.power_off_all(true)?;
        info!("Stave powered off");
        Ok(())
    }

    // Data path

    /// Resets and aligns the transceivers of the stave's lanes (GTH for the inner barrel, GPIO
    /// otherwise) and enables their data in the readout master
    /// # Errors
    /// Returns an error if a reset doesn't complete, a CDR doesn't lock or a lane doesn't align
    pub fn align_lanes(&self, layer: Layer, max_retries: usize) -> anyhow::Result<()> {
        if layer.is_ib() {
            ensure!(self.gth.initialize(max_retries)?, "GTH reset not done");
            ensure!(
                self.gth.is_cdr_locked()?,
                "GTH CDR not locked, status {:#05x}",
                self.gth.cdr_locked()?
            );
            ensure!(
                self.gth.align_transceivers(max_retries)?,
                "GTH lanes not aligned"
            );
            self.gth.enable_data(true)?;
            let lanes = self.gth.lanes().iter().fold(0u16, |m, l| m | 1 << l);
            self.readout_master.set_ib_enabled_lanes(lanes)?;
            info!("GTH lanes {lanes:#05x} aligned");
        } else {
            self.gpio.initialize()?;
            ensure!(
                self.gpio.align_transceivers(max_retries)?,
                "GPIO lanes not aligned, status {:#09x}",
                self.gpio.alignment_status()?
            );
            self.gpio.enable_data(true)?;
            let lanes = self.gpio.lanes().iter().fold(0u32, |m, l| m | 1 << l);
            self.readout_master.set_ob_enabled_lanes(lanes)?;
            info!("GPIO lanes {lanes:#09x} aligned");
        }
        Ok(())
    }

    /// Sets up and enables the trigger handler. External triggers need the timebase synchronised
    /// to the trigger link, internal ones start the sequencer.
    /// # Errors
    /// Returns an error if the timebase doesn't sync, a setting is out of range, or on bad
    /// transport
    pub fn configure_trigger(&self, setup: &TriggerSetup) -> anyhow::Result<()> {
        let th = &self.trigger_handler;
        th.disable()?;
        self.sequencer.stop()?;
        match setup.mode {
            TriggerMode::Continuous => {
                th.setup_for_continuous_mode(setup.period_bc, setup.send_pulses)?;
            }
            TriggerMode::Triggered => {
                th.setup_for_triggered_mode(setup.min_distance, setup.send_pulses)?;
            }
        }
        if setup.external {
            th.set_trigger_source(TriggerSource::Gbtx2)?;
            if th.timebase_sync_enable()? == 0 {
                th.enable_timebase_sync(false)?;
                self.handle.settle(TIMEBASE_SYNC_SETTLE)?;
            }
            ensure!(
                th.is_timebase_synced()?,
                "Timebase not synchronised to the trigger link"
            );
            th.enable()?;
        } else {
            th.set_trigger_source(TriggerSource::Sequencer)?;
            self.sequencer.configure(&setup.sequencer_config())?;
            th.enable()?;
            self.sequencer.start()?;
        }
        info!(
            "Trigger handler enabled in {:?} mode, {} triggers",
            setup.mode,
            if setup.external { "external" } else { "sequencer" }
        );
        Ok(())
    }

    /// Drops whatever is in flight in the readout path and re-enables the trigger handler
    /// # Errors
    /// Returns an error on bad transport
    pub fn clean_datapath(&self) -> Result<()> {
        let th = &self.trigger_handler;
        th.disable()?;
        self.sequencer.stop()?;
        self.gbt_packer.reset()?;
        self.gth.enable_data(false)?;
        self.gpio.enable_data(false)?;
        self.readout_master.reset_ib_lanes()?;
        self.readout_master.reset_ob_lanes()?;
        let gated = th.opcode_gating()?;
        th.set_opcode_gating(true)?;
        th.reset_readout_master()?;
        th.set_opcode_gating(gated)?;
        th.enable()
    }

    /// Logs the clock health of the board, returns whether a clock event happened
    /// # Errors
    /// Returns an error on bad transport
    pub fn log_clock_event(&self) -> Result<bool> {
        let dna = self.identity.dna(false)?;
        let uptime = self.identity.uptime_seconds()?;
        info!("DNA {dna:#x}, uptime {uptime:.1} s");
        let event = self.clock_health.log_clock_event()?;
        if self.clock_health.flags()?.lol_timebase {
            let lost = self.trigger_handler.monitor().read_counter("LOL_TIMEBASE")?;
            warn!(lost, "Timebase loss of lock");
        }
        Ok(event)
    }

    /// Writes and reads back `n` random values over the control link, returns the number of
    /// errors seen, the master monitor's counts included
    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn test_swt(&self, n: usize, show_progress: bool) -> Result<u32> {
        let saved = self.gbt_packer.timeout_to_start()?;
        self.master_monitor.reset_all_counters()?;
        let pb = if show_progress {
            ProgressBar::new(n as u64)
        } else {
            ProgressBar::hidden()
        };
        let mut rng = rand::thread_rng();
        let mut errors = 0;
        for i in 0..n {
            let value: u16 = rng.gen();
            self.gbt_packer.set_timeout_to_start(value)?;
            let read = self.gbt_packer.timeout_to_start()?;
            if read != value {
                let reread = self.gbt_packer.timeout_to_start()?;
                error!(
                    "SWT test {i}: wrote {value:#06x}, read {read:#06x}, read again {reread:#06x}"
                );
                errors += 1;
            }
            pb.inc(1);
        }
        pb.finish_and_clear();
        let counters =
            self.master_monitor
                .read_counters(Some(&["WR_ERRORS", "RD_ERRORS"]), true, false)?;
        for (name, count) in &counters {
            if *count > 0 {
                error!("Master monitor {name}: {count}");
                errors += count;
            }
        }
        self.gbt_packer.set_timeout_to_start(saved)?;
        Ok(errors)
    }

    /// Register dump of every module of the board
    /// # Errors
    /// Returns an error if the channel is gone
    pub fn dump_config(&self) -> Result<String> {
        let mut dump = [
            self.identity.dump_config()?,
            self.clock_health.dump_config()?,
            self.gth.dump_config()?,
            self.gpio.dump_config()?,
            self.readout_master.dump_config()?,
            self.datalane_ib.dump_config()?,
            self.datalane_ob.dump_config()?,
            self.calibration_lane.dump_config()?,
            self.gbt_packer.dump_config()?,
            self.alpide_control.dump_config()?,
            self.trigger_handler.dump_config()?,
            self.gbtx_bridge.dump_config()?,
        ]
        .concat();
        if let Some(pu) = &self.power_unit {
            dump.push_str(&pu.dump_config()?);
        }
        Ok(dump)
    }

    /// The whole bring-up: identity, clocking, power, lanes and trigger. Any failure once the
    /// board was touched powers the stave off before it is returned.
    /// # Errors
    /// Returns the first failed step
    pub fn bringup(&mut self, config: &BringupConfig) -> anyhow::Result<IdentityReport> {
        let report = self.identify()?;
        let (layer, stave) = self.stave(config)?;
        info!("Bringing up {stave}");
        if let Err(e) = self.bringup_sequence(config, layer, report.dna) {
            error!("Bring-up of {stave} failed: {e:#}");
            if let Some(pu) = &self.power_unit {
                info!("Powering off");
                if let Err(off) = pu.power_off_all(true) {
                    error!("Power off failed: {off}");
                }
            }
            return Err(e);
        }
        info!("{stave} ready");
        Ok(report)
    }

    fn bringup_sequence(
        &mut self,
        config: &BringupConfig,
        layer: Layer,
        dna: u128,
    ) -> anyhow::Result<()> {
        self.initialize(config.charge_pump(dna), config.gbtx_config(layer)?.as_ref())?;
        self.log_clock_event()?;
        self.power_on_stave(config)?;
        if config.compensate {
            self.compensate_voltage_drops(config)?;
        }
        self.align_lanes(layer, config.align_retries)?;
        self.configure_trigger(&config.trigger)
    }
}
