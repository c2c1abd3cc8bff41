//! One Power Unit, driven through its main and auxiliary I2C buses and watched by its
//! controller.
//!
//! Channel `2 * module` feeds the analog rail (AVDD) of a module and channel `2 * module + 1` its
//! digital rail (DVDD). Low level operations return the crate [`Result`]; the power sequences,
//! which check what they did and power everything off when a check fails, return
//! [`anyhow::Result`].

use crate::{
    core::ModuleHandle,
    error::{
        ensure_range,
        Result,
    },
    i2c::pu::{
        I2cBridge,
        PuAuxRegister,
        PuBus,
        PuConnector,
        PuMainRegister,
    },
    modules::identity::Layer,
    power::{
        controller::{
            invert_bias,
            BiasAdc,
            ModuleAdc,
            PuController,
        },
        conversions::{
            Conversions,
            PowerUnitVersion,
            RtdSensor,
        },
        topology::{
            modules_channels,
            InterlockTopology,
            POWER_CHANNELS,
        },
        IDLE_BB_VOLTAGE,
        MAX_AVDD,
        MAX_AVDD_RESET,
        MAX_CURRENT,
        MAX_DVDD,
        MAX_DVDD_RESET,
        MIN_BB_VOLTAGE,
        MODULES,
        PT100_DISCONNECTED,
    },
    transport::Transport,
};
use anyhow::{
    bail,
    ensure,
};
use kstring::KString;
use ru_utils::calibration::PuOffsets;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    time::Duration,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

const ADC_SETUP_SEQUENCE: [u16; 4] = [0x0000, 0x0701, 0x0B02, 0x0001];
/// Starts a conversion of the selected ADC input
const ADC_CONVERT: u16 = 0x20;
const RTD_CONFIG: u16 = 0x80 << 8;
const RTD_FILTER_50HZ: u16 = 0xC3;
const RTD_FILTER_60HZ: u16 = 0xC2;
/// Selects the current threshold register of one channel
const THRESHOLD_SELECT: u16 = 0x30;
/// Selects every current threshold register at once
const THRESHOLD_SELECT_ALL: u16 = 0x3F;
const THRESHOLD_MAX: u16 = 0xFFF;
const BIAS_DAC_SELECT: u16 = 0x11 << 8;
/// Hardware wait between switching AVDD and DVDD of one module
const AVDD_TO_DVDD_CYCLES: u32 = 0x40_0000;

/// One of the two rails of a module
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rail {
    Analog,
    Digital,
}

impl Rail {
    pub const ALL: [Rail; 2] = [Rail::Analog, Rail::Digital];

    /// Power channel of this rail on `module`
    #[must_use]
    pub fn channel(self, module: u8) -> u8 {
        match self {
            Rail::Analog => 2 * module,
            Rail::Digital => 2 * module + 1,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Rail::Analog => "AVDD",
            Rail::Digital => "DVDD",
        }
    }

    #[must_use]
    pub fn max_voltage(self) -> f64 {
        match self {
            Rail::Analog => MAX_AVDD,
            Rail::Digital => MAX_DVDD,
        }
    }

    /// Voltage and current ADC codes of this rail
    #[must_use]
    pub fn codes(self, adc: &ModuleAdc) -> (u16, u16) {
        match self {
            Rail::Analog => (adc.avdd_voltage, adc.avdd_current),
            Rail::Digital => (adc.dvdd_voltage, adc.dvdd_current),
        }
    }
}

/// Set-points applied to a group of modules
#[derive(Debug, Copy, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PowerSetup {
    /// Volts
    pub dvdd: f64,
    /// Volts
    pub avdd: f64,
    /// Amps
    pub dvdd_current: f64,
    /// Amps
    pub avdd_current: f64,
    /// Back-bias, volts, zero for none
    pub bb: f64,
    /// Ignore the DAC calibration offsets
    pub no_offset: bool,
}

impl Default for PowerSetup {
    fn default() -> Self {
        Self {
            dvdd: 1.9,
            avdd: 1.9,
            dvdd_current: 1.5,
            avdd_current: 1.5,
            bb: 0.0,
            no_offset: false,
        }
    }
}

/// Snapshot of the enables and ADC codes of a Power Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerValues {
    pub power_enable_status: u16,
    pub bias_enable_status: u8,
    pub bb_voltage: u16,
    pub bb_current: u16,
    pub modules: BTreeMap<u8, ModuleAdc>,
}

/// A Power Unit and its controller
#[derive(Debug)]
pub struct PowerUnit<T> {
    connector: PuConnector,
    /// Main bus master, for waits and commits
    handle: ModuleHandle<T>,
    main: I2cBridge<T>,
    aux: I2cBridge<T>,
    controller: PuController<T>,
    offsets: PuOffsets,
    filter_50hz: bool,
}

impl<T> PowerUnit<T>
where
    T: Transport,
{
    /// Builds the Power Unit on `connector` feeding a stave of `layer`
    pub fn new(
        handle: &ModuleHandle<T>,
        connector: PuConnector,
        layer: Layer,
        version: PowerUnitVersion,
    ) -> Self {
        Self {
            connector,
            handle: handle.sibling(connector.bus(PuBus::Main)),
            main: I2cBridge::new(handle, connector, PuBus::Main),
            aux: I2cBridge::new(handle, connector, PuBus::Aux),
            controller: PuController::new(
                handle,
                connector,
                Conversions::new(version, 0.0),
                InterlockTopology::new(layer),
            ),
            offsets: PuOffsets::default(),
            filter_50hz: true,
        }
    }

    #[must_use]
    pub fn connector(&self) -> PuConnector {
        self.connector
    }

    #[must_use]
    pub fn main(&self) -> &I2cBridge<T> {
        &self.main
    }

    #[must_use]
    pub fn aux(&self) -> &I2cBridge<T> {
        &self.aux
    }

    #[must_use]
    pub fn controller(&self) -> &PuController<T> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut PuController<T> {
        &mut self.controller
    }

    #[must_use]
    pub fn conversions(&self) -> &Conversions {
        self.controller.conversions()
    }

    #[must_use]
    pub fn topology(&self) -> &InterlockTopology {
        self.controller.topology()
    }

    #[must_use]
    pub fn version(&self) -> PowerUnitVersion {
        self.conversions().version
    }

    pub fn set_version(&mut self, version: PowerUnitVersion) {
        self.controller.conversions_mut().version = version;
    }

    /// Resistance the cable adds to the external PT100 loops, in ohms
    pub fn set_resistance_offset(&mut self, ohms: f64) {
        self.controller.conversions_mut().resistance_offset = ohms;
    }

    #[must_use]
    pub fn resistance_offset(&self) -> f64 {
        self.conversions().resistance_offset
    }

    #[must_use]
    pub fn offsets(&self) -> &PuOffsets {
        &self.offsets
    }

    pub fn set_offsets(&mut self, offsets: PuOffsets) {
        self.offsets = offsets;
    }

    /// Selects the 50 Hz (otherwise 60 Hz) mains rejection of the RTD converters
    pub fn set_filter_50hz(&mut self, filter_50hz: bool) {
        self.filter_50hz = filter_50hz;
    }

    /// Sensors watched by the temperature interlock
    pub fn set_interlock_vector(&mut self, sensors: &[RtdSensor]) {
        self.controller.set_interlock_vector(sensors);
    }

    /// Configures the ADCs and, unless the controller is already polling them, the RTDs
    /// # Errors
    /// Returns an error on bad transport
    pub fn initialize(&self) -> Result<()> {
        let enabled = self.controller.is_temperature_interlock_enabled(None)?;
        self.configure_bias_adc()?;
        self.configure_power_adc()?;
        if !enabled {
            for sensor in RtdSensor::ALL {
                self.initialize_temperature_sensor(sensor)?;
            }
            // Rewriting the mask restarts the controller polling
            let mask = self.controller.temperature_interlock_enable_mask()?;
            self.controller.set_temperature_interlock_enable_mask(mask)?;
        }
        Ok(())
    }

    /// Reads the internal temperature `checks` times to exercise the main bus
    /// # Errors
    /// Returns an error if a reading is implausible, or on bad transport
    pub fn check_i2c_comm(&self, checks: usize) -> anyhow::Result<()> {
        for _ in 0..checks {
            let temp = self.read_temperature(RtdSensor::Pu)?;
            ensure!(
                0.0 < temp && temp < 80.0,
                "Implausible Power Unit temperature {temp:.2} C"
            );
        }
        Ok(())
    }

    // Current thresholds

    /// # Errors
    /// Returns an error if the channel or code is out of range, or on bad transport
    pub fn set_current_threshold(&self, channel: u8, code: u16) -> Result<()> {
        ensure_range!(channel < POWER_CHANNELS, "channel {channel} not in 0..16");
        ensure_range!(code <= THRESHOLD_MAX, "threshold code {code:#x}");
        self.main.write(
            PuMainRegister::InternalRegister,
            THRESHOLD_SELECT | u16::from(channel & 0x3),
        )?;
        self.main
            .write(threshold_register(channel >> 2), threshold_data(code))
    }

    /// # Errors
    /// Returns an error if the code is out of range, or on bad transport
    pub fn set_all_current_thresholds(&self, code: u16) -> Result<()> {
        ensure_range!(code <= THRESHOLD_MAX, "threshold code {code:#x}");
        self.main
            .write(PuMainRegister::InternalRegister, THRESHOLD_SELECT_ALL)?;
        for quad in 0..4 {
            self.main
                .queue_write(threshold_register(quad), threshold_data(code))?;
        }
        self.handle.flush()
    }

    /// Sets the threshold of every channel in `mask`
    /// # Errors
    /// Returns an error if the code is out of range, or on bad transport
    pub fn set_current_thresholds_mask(&self, mask: u16, code: u16) -> Result<()> {
        for channel in 0..POWER_CHANNELS {
            if (mask >> channel) & 1 == 1 {
                self.set_current_threshold(channel, code)?;
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn raise_current_thresholds_to_max(&self) -> Result<()> {
        self.set_all_current_thresholds(THRESHOLD_MAX)
    }

    /// Drops every threshold to zero, tripping any channel that is on
    /// # Errors
    /// Returns an error on bad transport
    pub fn lower_current_thresholds_to_min(&self) -> Result<()> {
        self.set_all_current_thresholds(0)
    }

    /// # Errors
    /// Returns an error if the module or code is out of range, or on bad transport
    pub fn configure_current_threshold(&self, module: u8, rail: Rail, code: u16) -> Result<()> {
        ensure_range!(module < MODULES, "module {module} not in 0..8");
        self.set_current_threshold(rail.channel(module), code)
    }

    /// Sets the over-current limits, in amps, of `modules`
    /// # Errors
    /// Returns an error if a module or limit is out of range, or on bad transport
    pub fn configure_current_limits_modules(
        &self,
        dvdd_current: f64,
        avdd_current: f64,
        modules: &[u8],
    ) -> Result<()> {
        ensure_range!(
            (0.0..=MAX_CURRENT).contains(&dvdd_current),
            "DVDD current {dvdd_current} A"
        );
        ensure_range!(
            (0.0..=MAX_CURRENT).contains(&avdd_current),
            "AVDD current {avdd_current} A"
        );
        let conv = self.conversions();
        for &module in modules {
            self.configure_current_threshold(module, Rail::Analog, conv.ith_to_code(avdd_current))?;
            self.configure_current_threshold(module, Rail::Digital, conv.ith_to_code(dvdd_current))?;
        }
        Ok(())
    }

    // Power enables

    /// # Errors
    /// Returns an error if the channel is out of range, or on bad transport
    pub fn enable_power(&self, channel: u8) -> Result<()> {
        ensure_range!(channel < POWER_CHANNELS, "channel {channel} not in 0..16");
        let reg = if channel < 8 {
            PuAuxRegister::IoExpanderPower0
        } else {
            PuAuxRegister::IoExpanderPower1
        };
        self.aux.write(reg, 1 << (channel & 0x7))
    }

    /// Switches on exactly the channels of `mask`
    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_power_with_mask(&self, mask: u16) -> Result<()> {
        self.aux
            .queue_write(PuAuxRegister::IoExpanderPower0, mask & 0xFF)?;
        self.aux.write(PuAuxRegister::IoExpanderPower1, mask >> 8)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_power_all(&self) -> Result<()> {
        self.enable_power_with_mask(0xFFFF)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_power_all(&self) -> Result<()> {
        self.enable_power_with_mask(0)
    }

    /// Channels switched on, read back from the expanders
    /// # Errors
    /// Returns an error on bad transport
    pub fn power_enable_status(&self) -> Result<u16> {
        let low = self.aux.read(PuAuxRegister::IoExpanderPower0Read)?;
        let high = self.aux.read(PuAuxRegister::IoExpanderPower1Read)?;
        Ok((high & 0xFF) << 8 | (low & 0xFF))
    }

    // Bias enables, the expander outputs are active low

    /// Switches on exactly the bias outputs of `mask`
    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_bias_with_mask(&self, mask: u8) -> Result<()> {
        self.main
            .write(PuMainRegister::IoExpanderBias, u16::from(mask ^ 0xFF))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_bias_all(&self) -> Result<()> {
        self.main.write(PuMainRegister::IoExpanderBias, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_bias_all(&self) -> Result<()> {
        self.main.write(PuMainRegister::IoExpanderBias, 0xFF)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn bias_enable_status(&self) -> Result<u8> {
        let raw = self.main.read(PuMainRegister::IoExpanderBiasRead)?;
        Ok(invert_bias(raw))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn log_enable_status(&self) -> Result<(u16, u8)> {
        let power = self.power_enable_status()?;
        let bias = self.bias_enable_status()?;
        info!("Power enable status: {power:04X}, Bias enable status: {bias:02X}");
        Ok((power, bias))
    }

    // DACs

    /// Raw DAC write, not limited to the rail maximum. Set-points go through
    /// [`Self::set_voltage`].
    /// # Errors
    /// Returns an error if the channel is out of range, or on bad transport
    pub(crate) fn set_power_dac(&self, channel: u8, code: u8) -> Result<()> {
        ensure_range!(channel < POWER_CHANNELS, "channel {channel} not in 0..16");
        self.main.write(
            pot_register(channel >> 2),
            u16::from(channel & 0x3) << 8 | u16::from(code),
        )
    }

    /// # Errors
    /// Returns an error on bad transport
    pub(crate) fn set_all_power_dacs(&self, code: u8) -> Result<()> {
        for channel in 0..POWER_CHANNELS {
            self.set_power_dac(channel, code)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn set_bias_dac(&self, code: u8) -> Result<()> {
        self.main
            .write(PuMainRegister::PotBias, BIAS_DAC_SELECT | u16::from(code))
    }

    /// Programs `rail` of `module` to `volts`, corrected by `offset`. Requests above the rail
    /// maximum are limited to it.
    /// # Errors
    /// Returns an error if the module is out of range, or on bad transport
    pub fn set_voltage(&self, module: u8, rail: Rail, volts: f64, offset: u8) -> Result<()> {
        ensure_range!(module < MODULES, "module {module} not in 0..8");
        let max = rail.max_voltage();
        let volts = if volts > max {
            warn!(
                "{} of {volts} V requested on module {module}, limiting to {max} V",
                rail.name()
            );
            max
        } else {
            volts
        };
        let code = self.conversions().vout_to_code(volts, offset);
        self.set_power_dac(rail.channel(module), code)
    }

    /// Calibration offset of `rail` on `module`
    #[must_use]
    pub fn offset(&self, module: u8, rail: Rail) -> u8 {
        let m = usize::from(module);
        match rail {
            Rail::Analog => self.offsets.avdd[m],
            Rail::Digital => self.offsets.dvdd[m],
        }
    }

    // ADCs

    fn configure_adc(&self, reg: PuMainRegister) -> Result<()> {
        for data in ADC_SETUP_SEQUENCE {
            self.main.write(reg, data)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn configure_power_adc(&self) -> Result<()> {
        for reg in [
            PuMainRegister::AdcSetup0,
            PuMainRegister::AdcSetup1,
            PuMainRegister::AdcSetup2,
            PuMainRegister::AdcSetup3,
        ] {
            self.configure_adc(reg)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn configure_bias_adc(&self) -> Result<()> {
        self.configure_adc(PuMainRegister::AdcBiasSetup)
    }

    /// Converts and reads one of the 32 power ADC inputs
    /// # Errors
    /// Returns an error if the channel is out of range, or on bad transport
    pub fn read_power_adc_channel(&self, channel: u8) -> Result<u16> {
        ensure_range!(channel < 32, "power ADC channel {channel} not in 0..32");
        let (select, read) = adc_registers(channel >> 3);
        self.main.write(select, ADC_CONVERT | u16::from(channel & 0x7))?;
        Ok(self.main.read(read)? >> 4)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_power_adc(&self) -> Result<Vec<u16>> {
        (0..32).map(|ch| self.read_power_adc_channel(ch)).collect()
    }

    /// # Errors
    /// Returns an error if the module is out of range, or on bad transport
    pub fn power_adc_values(&self, module: u8) -> Result<ModuleAdc> {
        ensure_range!(module < MODULES, "module {module} not in 0..8");
        let first = ModuleAdc::first_channel(module);
        Ok(ModuleAdc::from_codes([
            self.read_power_adc_channel(first)?,
            self.read_power_adc_channel(first + 1)?,
            self.read_power_adc_channel(first + 2)?,
            self.read_power_adc_channel(first + 3)?,
        ]))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_bias_adc_channel(&self, input: BiasAdc) -> Result<u16> {
        self.main.write(
            PuMainRegister::AdcBias,
            ADC_CONVERT | u16::from(input.channel()),
        )?;
        Ok(self.main.read(PuMainRegister::AdcBiasRead)? >> 4)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_bias_adc(&self) -> Result<Vec<u16>> {
        BiasAdc::ALL
            .into_iter()
            .map(|input| self.read_bias_adc_channel(input))
            .collect()
    }

    // Temperatures

    /// # Errors
    /// Returns an error on bad transport
    pub fn initialize_temperature_sensor(&self, sensor: RtdSensor) -> Result<()> {
        self.main
            .write(PuMainRegister::InternalRegister, 1 << sensor.index())?;
        let filter = if self.filter_50hz {
            RTD_FILTER_50HZ
        } else {
            RTD_FILTER_60HZ
        };
        self.main
            .write(PuMainRegister::TempThreshConfig, RTD_CONFIG | filter)
    }

    /// Reads `sensor` directly over I2C
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_temperature(&self, sensor: RtdSensor) -> Result<f64> {
        self.main.write(
            PuMainRegister::InternalRegister,
            (1 << sensor.index()) << 8 | 0x1,
        )?;
        self.main.write(PuMainRegister::TempThreshRd, 0xFFFF)?;
        let code = self.main.read(PuMainRegister::TempThreshRdRead)? >> 1;
        self.conversions().code_to_temperature(code, sensor)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_all_temperatures(&self) -> Result<Vec<(RtdSensor, f64)>> {
        RtdSensor::ALL
            .into_iter()
            .map(|s| Ok((s, self.read_temperature(s)?)))
            .collect()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn log_temperatures(&self) -> Result<()> {
        for (sensor, temp) in self.read_all_temperatures()? {
            info!("RTD {}: {temp:.2} C", sensor.name());
        }
        Ok(())
    }

    // Monitoring

    /// Enables and ADC codes of `modules`, from the controller mirrors while it polls the Power
    /// Unit and `use_i2c` isn't set, otherwise over I2C
    /// # Errors
    /// Returns an error on bad transport
    pub fn values_modules(&self, modules: &[u8], use_i2c: bool) -> Result<PowerValues> {
        let mirrored = self
            .controller
            .is_temperature_interlock_enabled(Some(&[RtdSensor::Pu]))?;
        let via_controller = mirrored && !use_i2c;
        if !mirrored && !use_i2c {
            warn!("Temperature interlock not active!");
        }
        let mut values = if via_controller {
            PowerValues {
                power_enable_status: self.controller.power_enable_status()?,
                bias_enable_status: self.controller.bias_enable_status()?,
                bb_voltage: self.controller.read_bias_adc_channel(BiasAdc::Voltage)?,
                bb_current: self.controller.read_bias_adc_channel(BiasAdc::Current)?,
                modules: BTreeMap::new(),
            }
        } else {
            debug!("Using I2C to retrieve values!");
            PowerValues {
                power_enable_status: self.power_enable_status()?,
                bias_enable_status: self.bias_enable_status()?,
                bb_voltage: self.read_bias_adc_channel(BiasAdc::Voltage)?,
                bb_current: self.read_bias_adc_channel(BiasAdc::Current)?,
                modules: BTreeMap::new(),
            }
        };
        for &m in modules {
            let adc = if via_controller {
                self.controller.power_adc_values(m)?
            } else {
                self.power_adc_values(m)?
            };
            values.modules.insert(m, adc);
        }
        Ok(values)
    }

    /// Logs the enables, rails and temperatures of `modules` and checks the interlock latch.
    /// Returns `false` if any rail of `modules` reads zero volts.
    /// # Errors
    /// Returns an error on bad transport
    pub fn log_values_modules(&self, modules: &[u8], use_i2c: bool) -> Result<bool> {
        let values = self.values_modules(modules, use_i2c)?;
        let conv = self.conversions();
        info!("Power enable status: 0x{:04X}", values.power_enable_status);
        info!("Bias enable status: 0x{:02X}", values.bias_enable_status);
        info!(
            "Backbias: {:.3} V, {:.1} mA",
            conv.code_to_vbias(values.bb_voltage),
            conv.code_to_ibias(values.bb_current)
        );
        let mut all_on = true;
        for (module, adc) in &values.modules {
            let mut msg = format!("Module {module}, ");
            for rail in Rail::ALL {
                let (v, i) = rail.codes(adc);
                let (v, i) = (conv.code_to_vpower(v), conv.code_to_i(i));
                all_on &= v != 0.0;
                msg.push_str(&format!("{}: ({v:5.3} V, {i:5.1} mA) ", rail.name()));
            }
            info!("{msg}");
        }
        if self
            .controller
            .is_temperature_interlock_enabled(Some(&[RtdSensor::Pu]))?
            && !use_i2c
        {
            self.controller.log_temperatures()?;
        } else {
            self.log_temperatures()?;
        }
        self.controller.did_interlock_fire()?;
        Ok(all_on)
    }

    /// Checks that both rails of every module in `modules` show voltage and current
    /// # Errors
    /// Returns an error naming the first dead rail, or on bad transport
    pub fn check_module_power(&self, modules: &[u8], use_i2c: bool) -> anyhow::Result<()> {
        let values = self.values_modules(modules, use_i2c)?;
        let conv = self.conversions();
        for (module, adc) in &values.modules {
            for rail in Rail::ALL {
                let (v, i) = rail.codes(adc);
                let (v, i) = (conv.code_to_vpower(v), conv.code_to_i(i));
                ensure!(
                    v > 0.0,
                    "module_{module}_{} voltage is not above 0, was {v}",
                    rail.name().to_lowercase()
                );
                ensure!(
                    i > 0.0,
                    "module_{module}_{} current is not above 0, was {i}",
                    rail.name().to_lowercase()
                );
            }
        }
        Ok(())
    }

    // Power sequences

    fn check_interlock_ready(&self) -> anyhow::Result<()> {
        ensure!(
            self.controller.is_temperature_interlock_enabled(None)?,
            "Temperature interlock is not enabled"
        );
        ensure!(
            !self.controller.did_interlock_fire()?,
            "Interlock is active and fired! Please verify that it is fine, and retry!"
        );
        Ok(())
    }

    /// Programs voltages, back-bias and current limits of `modules` without switching anything
    /// on. Voltages above the rail maximum are clamped.
    /// # Errors
    /// Returns an error if a set-point is out of range, if `check_interlock` is set and the
    /// temperature interlock is off or has fired, or on bad transport
    pub fn setup_power_modules(
        &self,
        setup: &PowerSetup,
        modules: &[u8],
        check_interlock: bool,
    ) -> anyhow::Result<()> {
        for &m in modules {
            ensure!(m < MODULES, "{m} not in range(8), modules = {modules:?}");
        }
        let mut setup = *setup;
        if setup.dvdd > MAX_DVDD {
            warn!(
                "DVDD of {} requested for modules {modules:?}, limiting to {MAX_DVDD} V",
                setup.dvdd
            );
            setup.dvdd = MAX_DVDD;
        }
        if setup.avdd > MAX_AVDD {
            warn!(
                "AVDD of {} requested for modules {modules:?}, limiting to {MAX_AVDD} V",
                setup.avdd
            );
            setup.avdd = MAX_AVDD;
        }
        ensure!(setup.dvdd >= 0.0, "DVDD {} V", setup.dvdd);
        ensure!(setup.avdd >= 0.0, "AVDD {} V", setup.avdd);
        ensure!(
            (0.0..=MAX_CURRENT).contains(&setup.dvdd_current),
            "DVDD current {} A",
            setup.dvdd_current
        );
        ensure!(
            (0.0..=MAX_CURRENT).contains(&setup.avdd_current),
            "AVDD current {} A",
            setup.avdd_current
        );
        ensure!(
            (MIN_BB_VOLTAGE..=0.0).contains(&setup.bb),
            "back-bias {} V",
            setup.bb
        );
        if check_interlock {
            self.check_interlock_ready()?;
        }
        if modules.is_empty() {
            return Ok(());
        }
        for &m in modules {
            info!("Setup power on module {m}");
            for (rail, volts) in [(Rail::Analog, setup.avdd), (Rail::Digital, setup.dvdd)] {
                let offset = if setup.no_offset { 0 } else { self.offset(m, rail) };
                self.set_voltage(m, rail, volts, offset)?;
            }
        }
        // The bias DAC is never left at zero
        let bb = if setup.bb == 0.0 {
            IDLE_BB_VOLTAGE
        } else {
            setup.bb
        };
        self.set_bias_dac(self.conversions().vbias_to_code(bb))?;
        self.raise_current_thresholds_to_max()?;
        self.configure_current_limits_modules(setup.dvdd_current, setup.avdd_current, modules)?;
        Ok(())
    }

    /// # Errors
    /// See [`Self::setup_power_modules`]
    pub fn setup_power_module(
        &self,
        setup: &PowerSetup,
        module: u8,
        check_interlock: bool,
    ) -> anyhow::Result<()> {
        self.setup_power_modules(setup, &[module], check_interlock)
    }

    fn assert_enables(&self, power: u16, bias: u8) -> anyhow::Result<()> {
        let (power_status, bias_status) = self.log_enable_status()?;
        ensure!(
            power_status == power,
            "0x{power_status:04X} != 0x{power:04X}"
        );
        ensure!(bias_status == bias, "0x{bias_status:02X} != 0x{bias:02X}");
        Ok(())
    }

    fn power_on_sequence(&self, modules: &[u8], backbias: bool, check_interlock: bool) -> anyhow::Result<()> {
        info!("All off");
        self.log_enable_status()?;
        let mut mask_b = 0;
        if backbias {
            info!("Bias powering ON");
            mask_b = self.topology().modules_bias(modules);
            self.enable_bias_with_mask(mask_b)?;
            info!("BB on");
            self.assert_enables(0, mask_b)?;
        }
        let mut mask_ad = 0;
        let mut mask_pw = 0u8;
        info!("Analog + Digital powering on");
        for &m in modules {
            info!("Powering module {m}");
            mask_ad |= 1 << Rail::Analog.channel(m);
            self.enable_power_with_mask(mask_ad)?;
            self.assert_enables(mask_ad, mask_b)?;
            self.handle.wait(AVDD_TO_DVDD_CYCLES)?;
            mask_ad |= modules_channels(&[m]);
            mask_pw |= 1 << m;
            self.enable_power_with_mask(mask_ad)?;
            self.assert_enables(mask_ad, mask_b)?;
        }
        self.assert_enables(mask_ad, mask_b)?;
        self.settle(Duration::from_millis(500))?;
        self.check_module_power(modules, false)?;
        info!("All modules powered on successfully. Checking interlock...");
        self.settle(Duration::from_millis(100))?;
        self.controller.enable_power_bias_interlock(mask_pw, mask_b)?;
        info!("Power/Bias Interlock enabled.");
        if check_interlock {
            ensure!(
                !self.controller.did_interlock_fire()?,
                "Interlock fired while powering on"
            );
        }
        self.assert_enables(mask_ad, mask_b)?;
        self.settle(Duration::from_millis(500))?;
        self.check_module_power(modules, false)?;
        info!("################   Power on succeeded!   ################");
        Ok(())
    }

    /// Switches on the back-bias (if requested), then AVDD and DVDD of each module in turn,
    /// checking the enables after every step, and finally arms the power and bias interlock.
    /// Any failure powers everything off before it is returned.
    /// # Errors
    /// Returns the first failed check, or an error on bad transport
    pub fn power_on_modules(
        &self,
        modules: &[u8],
        backbias: bool,
        check_interlock: bool,
    ) -> anyhow::Result<()> {
        for &m in modules {
            ensure!(m < MODULES, "{m} not in range(8), modules = {modules:?}");
            info!("Setup power on module {m}");
        }
        if check_interlock {
            self.check_interlock_ready()?;
        }
        if modules.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.power_on_sequence(modules, backbias, check_interlock) {
            error!("Power on failed, powering all off!");
            self.power_off_all(false)?;
            self.settle(Duration::from_millis(200))?;
            self.log_values_modules(modules, false)?;
            info!("Raising");
            return Err(e);
        }
        Ok(())
    }

    /// # Errors
    /// See [`Self::power_on_modules`]
    pub fn power_on_module(
        &self,
        module: u8,
        backbias: bool,
        check_interlock: bool,
    ) -> anyhow::Result<()> {
        self.power_on_modules(&[module], backbias, check_interlock)
    }

    /// Switches every channel and bias output off and zeroes the DACs and current limits
    /// # Errors
    /// Returns an error on bad transport
    pub fn power_off_all(&self, disable_power_interlock: bool) -> Result<()> {
        if disable_power_interlock {
            self.controller.disable_power_interlock()?;
        }
        self.aux.queue_write(PuAuxRegister::IoExpanderPower0, 0)?;
        self.aux.queue_write(PuAuxRegister::IoExpanderPower1, 0)?;
        self.disable_bias_all()?;
        self.set_all_power_dacs(0)?;
        self.set_bias_dac(0)?;
        self.lower_current_thresholds_to_min()
    }

    /// Returns the set-points of every module of the stave to at most the reset limits
    /// # Errors
    /// Returns an error if a set-point is negative, or on bad transport
    pub fn reset_voltage(&self, avdd: f64, dvdd: f64) -> anyhow::Result<()> {
        let mut setup = PowerSetup {
            avdd,
            dvdd,
            ..PowerSetup::default()
        };
        if setup.dvdd > MAX_DVDD_RESET {
            warn!("DVDD of {dvdd} requested, limiting to {MAX_DVDD_RESET} V for resetting");
            setup.dvdd = MAX_DVDD_RESET;
        }
        if setup.avdd > MAX_AVDD_RESET {
            warn!("AVDD of {avdd} requested, limiting to {MAX_AVDD_RESET} V for resetting");
            setup.avdd = MAX_AVDD_RESET;
        }
        ensure!(setup.dvdd >= 0.0 && setup.avdd >= 0.0, "negative reset voltage");
        for m in self.topology().stave_modules() {
            self.setup_power_module(&setup, m, true)?;
        }
        Ok(())
    }

    /// Powers everything off when a channel of `modules` is no longer on. Assumes the modules
    /// were switched on.
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_any_channel_tripped(&self, modules: &[u8]) -> Result<bool> {
        let expected = modules_channels(modules);
        let status = self.power_enable_status()?;
        if status == expected {
            return Ok(false);
        }
        error!("AVDD/DVDD mask 0x{status:X} not as expected 0x{expected:X}. Powering off");
        self.power_off_all(false)?;
        Ok(true)
    }

    /// Powers everything off when a bias output of `modules` is no longer on. Assumes the bias
    /// was switched on.
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_bias_tripped(&self, modules: &[u8]) -> Result<bool> {
        let expected = self.topology().modules_bias(modules);
        let status = self.bias_enable_status()?;
        if status == expected {
            return Ok(false);
        }
        error!("bias mask 0x{status:X} not as expected 0x{expected:X}. Powering off");
        self.power_off_all(false)?;
        Ok(true)
    }

    /// Whether an external sensor reads above `trip_temperature`. Disconnected sensors are
    /// skipped.
    /// # Errors
    /// Returns an error if the trip temperature is outside 10..=50 °C, or on bad transport
    pub fn is_overtemperature(&self, trip_temperature: f64) -> Result<bool> {
        ensure_range!(
            (10.0..=50.0).contains(&trip_temperature),
            "trip temperature {trip_temperature} C not in 10..=50"
        );
        let mut overtemp = false;
        for sensor in [RtdSensor::Ext1, RtdSensor::Ext2] {
            let temp = self.read_temperature(sensor)?;
            if temp > PT100_DISCONNECTED {
                debug!("sensor {} powerunit PT100 disconnected!", sensor.name());
            } else if temp > trip_temperature {
                warn!("Sensor {} temperature: {temp:.3} C", sensor.name());
                overtemp = true;
            } else {
                info!("Sensor {} temperature: {temp:.3} C", sensor.name());
            }
        }
        Ok(overtemp)
    }

    /// Counters of both bus monitors, keyed by bus
    /// # Errors
    /// Returns an error on bad transport
    pub fn read_counters(
        &self,
        reset_after: bool,
    ) -> Result<BTreeMap<&'static str, BTreeMap<KString, u32>>> {
        Ok(BTreeMap::from([
            ("main", self.main.read_counters(reset_after)?),
            ("aux", self.aux.read_counters(reset_after)?),
        ]))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_all_counters(&self) -> Result<()> {
        self.main.reset_counters()?;
        self.aux.reset_counters()
    }

    /// # Errors
    /// Returns an error if a dump fails
    pub fn dump_config(&self) -> Result<String> {
        Ok([
            self.main.dump_config()?,
            self.aux.dump_config()?,
            self.controller.dump_config()?,
        ]
        .concat())
    }

    pub(crate) fn settle(&self, duration: Duration) -> Result<()> {
        self.handle.settle(duration)
    }

    pub(crate) fn wait_cycles(&self, cycles: u32) -> Result<()> {
        self.handle.wait(cycles)
    }

    /// Validates a set-point before it reaches a DAC
    pub(crate) fn check_set_point(rail: Rail, volts: f64) -> anyhow::Result<()> {
        if !(0.0..=rail.max_voltage()).contains(&volts) {
            bail!(
                "Requested {} ({volts:.3} V) exceeds {} ({:.3} V)",
                rail.name(),
                match rail {
                    Rail::Analog => "MAX_AVDD",
                    Rail::Digital => "MAX_DVDD",
                },
                rail.max_voltage()
            );
        }
        Ok(())
    }
}

fn threshold_register(quad: u8) -> PuMainRegister {
    match quad {
        0 => PuMainRegister::ThresCurr0,
        1 => PuMainRegister::ThresCurr1,
        2 => PuMainRegister::ThresCurr2,
        _ => PuMainRegister::ThresCurr3,
    }
}

/// The 12-bit threshold split as the DAC expects it: the upper byte, then the low nibble
/// left-aligned
fn threshold_data(code: u16) -> u16 {
    ((code >> 4) & 0xFF) << 8 | (code & 0xF) << 4
}

fn pot_register(quad: u8) -> PuMainRegister {
    match quad {
        0 => PuMainRegister::PotPower0,
        1 => PuMainRegister::PotPower1,
        2 => PuMainRegister::PotPower2,
        _ => PuMainRegister::PotPower3,
    }
}

fn adc_registers(adc: u8) -> (PuMainRegister, PuMainRegister) {
    match adc {
        0 => (PuMainRegister::Adc0, PuMainRegister::Adc0Read),
        1 => (PuMainRegister::Adc1, PuMainRegister::Adc1Read),
        2 => (PuMainRegister::Adc2, PuMainRegister::Adc2Read),
        _ => (PuMainRegister::Adc3, PuMainRegister::Adc3Read),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::ModuleId,
        master::WishboneMaster,
        modules::alpide_control::AlpideControl,
        power::{
            controller::TemperatureLimit,
            topology::TrippedBit,
        },
        transport::mock::Mock,
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    type Master = Arc<Mutex<WishboneMaster<Mock>>>;

    fn power_unit(layer: Layer) -> (Master, PowerUnit<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::Identity);
        let pu = PowerUnit::new(
            &handle,
            PuConnector::One,
            layer,
            PowerUnitVersion::Production,
        );
        (master, pu)
    }

    fn enable_interlock(pu: &PowerUnit<Mock>) {
        pu.controller()
            .enable_temperature_interlock(
                &[TemperatureLimit {
                    sensor: RtdSensor::Pu,
                    high: 40.0,
                    low: None,
                }],
                false,
            )
            .unwrap();
    }

    #[test]
    fn test_threshold_data_layout() {
        assert_eq!(threshold_data(0xFFF), 0xFFF0);
        assert_eq!(threshold_data(0xABC), 0xABC0);
        assert_eq!(threshold_data(0x00F), 0x00F0);
    }

    #[test]
    fn test_set_voltage_limited() {
        let (master, pu) = power_unit(Layer::L5);
        let conv = *pu.conversions();
        pu.set_voltage(2, Rail::Analog, 2.7, 0).unwrap();
        pu.set_voltage(2, Rail::Digital, 3.0, 0x10).unwrap();
        pu.set_voltage(3, Rail::Analog, 1.8, 0).unwrap();
        let dacs = {
            let mut master = master.lock().unwrap();
            let mock = master.transport_mut();
            [4, 5, 6].map(|ch| mock.pu_dac(PuConnector::One, ch))
        };
        assert_eq!(dacs[0], conv.vout_to_code(MAX_AVDD, 0));
        assert_eq!(dacs[1], conv.vout_to_code(MAX_DVDD, 0x10));
        assert_eq!(dacs[2], conv.vout_to_code(1.8, 0));
    }

    #[test]
    fn test_rail_channels() {
        assert_eq!(Rail::Analog.channel(3), 6);
        assert_eq!(Rail::Digital.channel(3), 7);
        assert_eq!(Rail::Digital.max_voltage(), MAX_DVDD);
    }

    #[test]
    fn test_enable_status_roundtrip() {
        let (_master, pu) = power_unit(Layer::L5);
        pu.enable_bias_with_mask(0xAA).unwrap();
        assert_eq!(pu.bias_enable_status().unwrap(), 0xAA);
        assert_eq!(pu.controller().bias_enable_status().unwrap(), 0xAA);
        pu.enable_power_with_mask(0x5500).unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0x5500);
        assert_eq!(pu.controller().power_enable_status().unwrap(), 0x5500);
        pu.enable_power(0).unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0x5501);
        pu.enable_power(9).unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0x0201);
        assert!(pu.enable_power(16).is_err());
    }

    #[test]
    fn test_lower_thresholds_trip_interlock() {
        let (_master, pu) = power_unit(Layer::L5);
        pu.enable_power_all().unwrap();
        pu.controller().enable_power_bias_interlock(0xFF, 0).unwrap();
        assert!(!pu.controller().did_interlock_fire().unwrap());
        pu.lower_current_thresholds_to_min().unwrap();
        pu.settle(Duration::from_millis(200)).unwrap();
        let latch = pu.controller().tripped_latch().unwrap();
        assert_eq!(latch.indices(), vec![0, 1, 5]);
        assert!(latch.contains(TrippedBit::MaskDiffers));
        assert_eq!(pu.controller().power_enable_status().unwrap(), 0);
        assert_eq!(pu.controller().tripped_power_enables().unwrap(), 0);
        assert!(pu.controller().did_interlock_fire().unwrap());
    }

    #[test]
    fn test_single_channel_threshold() {
        let (_master, pu) = power_unit(Layer::L5);
        let low = pu.conversions().ith_to_code(0.1);
        pu.set_current_threshold(3, low).unwrap();
        pu.enable_power_all().unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0xFFF7);
        pu.raise_current_thresholds_to_max().unwrap();
        pu.enable_power_all().unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0xFFFF);
        pu.set_current_thresholds_mask(0x0300, low).unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0xFCFF);
        assert!(pu.set_current_threshold(16, 0).is_err());
        assert!(pu.set_current_threshold(0, 0x1000).is_err());
    }

    #[test]
    fn test_temperatures() {
        let (master, mut pu) = power_unit(Layer::L5);
        pu.initialize().unwrap();
        assert!((pu.read_temperature(RtdSensor::Pu).unwrap() - 25.0).abs() < 0.05);
        {
            let mut m = master.lock().unwrap();
            m.transport_mut()
                .set_rtd_temperature(PuConnector::One, RtdSensor::Ext1, 33.0);
            m.transport_mut()
                .set_rtd_cable_resistance(PuConnector::One, 2.5);
        }
        pu.set_resistance_offset(2.5);
        assert!((pu.read_temperature(RtdSensor::Ext1).unwrap() - 33.0).abs() < 0.05);
        assert_eq!(pu.read_all_temperatures().unwrap().len(), 3);
        pu.check_i2c_comm(5).unwrap();
    }

    #[test]
    fn test_hot_power_unit_fails_comm_check() {
        let (master, pu) = power_unit(Layer::L5);
        master
            .lock()
            .unwrap()
            .transport_mut()
            .set_rtd_temperature(PuConnector::One, RtdSensor::Pu, 90.0);
        assert!(pu.check_i2c_comm(3).is_err());
    }

    #[test]
    fn test_overtemperature() {
        let (master, pu) = power_unit(Layer::L5);
        assert!(pu.is_overtemperature(5.0).is_err());
        assert!(!pu.is_overtemperature(40.0).unwrap());
        {
            let mut m = master.lock().unwrap();
            // An open PT100 reads full scale
            m.transport_mut()
                .set_rtd_temperature(PuConnector::One, RtdSensor::Ext2, 1000.0);
        }
        assert!(!pu.is_overtemperature(40.0).unwrap());
        master
            .lock()
            .unwrap()
            .transport_mut()
            .set_rtd_temperature(PuConnector::One, RtdSensor::Ext1, 45.0);
        assert!(pu.is_overtemperature(40.0).unwrap());
    }

    #[test]
    fn test_setup_validates() {
        let (_master, pu) = power_unit(Layer::L5);
        let bad_current = PowerSetup {
            dvdd_current: 3.5,
            ..PowerSetup::default()
        };
        assert!(pu.setup_power_modules(&bad_current, &[0], false).is_err());
        let bad_bias = PowerSetup {
            bb: -5.0,
            ..PowerSetup::default()
        };
        assert!(pu.setup_power_modules(&bad_bias, &[0], false).is_err());
        assert!(pu
            .setup_power_modules(&PowerSetup::default(), &[8], false)
            .is_err());
        // Without the temperature interlock nothing is programmed
        assert!(pu
            .setup_power_modules(&PowerSetup::default(), &[0], true)
            .is_err());
    }

    #[test]
    fn test_setup_clamps_voltage() {
        let (_master, pu) = power_unit(Layer::L5);
        let setup = PowerSetup {
            avdd: 3.0,
            dvdd: 3.0,
            ..PowerSetup::default()
        };
        pu.setup_power_modules(&setup, &[2], false).unwrap();
        pu.power_on_module(2, false, false).unwrap();
        let adc = pu.power_adc_values(2).unwrap();
        let conv = pu.conversions();
        assert!(conv.code_to_vpower(adc.avdd_voltage) <= MAX_AVDD + 0.005);
        assert!(conv.code_to_vpower(adc.dvdd_voltage) <= MAX_DVDD + 0.005);
    }

    #[test]
    fn test_power_on_and_off() {
        let (_master, pu) = power_unit(Layer::L5);
        enable_interlock(&pu);
        pu.initialize().unwrap();
        let modules = [0, 1];
        pu.setup_power_modules(&PowerSetup::default(), &modules, true)
            .unwrap();
        pu.power_on_modules(&modules, true, true).unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0x000F);
        assert_eq!(pu.bias_enable_status().unwrap(), 0b001);
        assert_eq!(
            pu.controller().expected_power_bias_enable_mask().unwrap(),
            (0b11, 0b001)
        );
        assert!(!pu.is_any_channel_tripped(&modules).unwrap());
        assert!(!pu.is_bias_tripped(&modules).unwrap());
        let values = pu.values_modules(&modules, false).unwrap();
        let i2c = pu.values_modules(&modules, true).unwrap();
        assert_eq!(values.power_enable_status, i2c.power_enable_status);
        assert_eq!(values.modules.len(), 2);
        assert!(pu.log_values_modules(&modules, false).unwrap());

        pu.power_off_all(true).unwrap();
        pu.settle(Duration::from_millis(500)).unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0);
        assert_eq!(pu.bias_enable_status().unwrap(), 0);
        assert!(!pu.controller().is_power_interlock_enabled().unwrap());
        assert!(!pu.controller().did_interlock_fire().unwrap());
    }

    #[test]
    fn test_failed_power_on_powers_off() {
        let (_master, pu) = power_unit(Layer::L5);
        let setup = PowerSetup {
            avdd_current: 0.1,
            ..PowerSetup::default()
        };
        pu.setup_power_modules(&setup, &[0, 1], false).unwrap();
        let err = pu.power_on_modules(&[0, 1], false, false).unwrap_err();
        assert!(err.to_string().contains("!= 0x0001"));
        assert_eq!(pu.power_enable_status().unwrap(), 0);
        assert_eq!(pu.bias_enable_status().unwrap(), 0);
    }

    #[test]
    fn test_tripped_channel_detected() {
        let (master, pu) = power_unit(Layer::L5);
        pu.setup_power_modules(&PowerSetup::default(), &[0], false)
            .unwrap();
        pu.power_on_module(0, false, false).unwrap();
        // 2 A is over the 1.5 A limit
        master
            .lock()
            .unwrap()
            .transport_mut()
            .set_pu_current(PuConnector::One, 1, 2.0);
        assert!(pu.is_any_channel_tripped(&[0]).unwrap());
        assert_eq!(pu.power_enable_status().unwrap(), 0);
    }

    #[test]
    fn test_clock_interlock_trips_unclocked_half() {
        let (master, pu) = power_unit(Layer::L5);
        pu.setup_power_modules(&PowerSetup::default(), &[0, 4], false)
            .unwrap();
        pu.power_on_modules(&[0, 4], false, false).unwrap();
        pu.controller().disable_power_interlock().unwrap();
        assert_eq!(pu.power_enable_status().unwrap(), 0x0303);

        let alpide = AlpideControl::new(ModuleHandle::new(
            Arc::downgrade(&master),
            ModuleId::AlpideControl,
        ));
        alpide.enable_all_dclk().unwrap();
        // Both rails sit at 1.9 V, well above the threshold
        pu.controller().set_clock_interlock_threshold(1.0).unwrap();
        pu.settle(Duration::from_millis(10)).unwrap();
        assert!(!pu.controller().did_interlock_fire().unwrap());
        alpide.disable_dclk(&[0, 1]).unwrap();
        pu.settle(Duration::from_millis(10)).unwrap();

        let latch = pu.controller().tripped_latch().unwrap();
        assert!(latch.contains(TrippedBit::Clock01));
        assert!(latch.contains(TrippedBit::TurnOffModules03));
        assert!(!latch.contains(TrippedBit::Clock23));
        // Module 4 sits on the clocked upper half
        assert_eq!(pu.power_enable_status().unwrap(), 0x0300);
        assert!(pu.controller().did_interlock_fire().unwrap());
    }

    #[test]
    fn test_reset_voltage() {
        let (_master, pu) = power_unit(Layer::L0);
        assert!(pu.reset_voltage(2.0, 2.0).is_err());
        enable_interlock(&pu);
        pu.reset_voltage(2.0, 2.0).unwrap();
        pu.power_on_module(0, false, false).unwrap();
        let adc = pu.power_adc_values(0).unwrap();
        let conv = pu.conversions();
        assert!((conv.code_to_vpower(adc.avdd_voltage) - MAX_AVDD_RESET).abs() < 0.005);
        assert!((conv.code_to_vpower(adc.dvdd_voltage) - MAX_DVDD_RESET).abs() < 0.005);
    }

    #[test]
    fn test_counters_and_dump() {
        let (_master, pu) = power_unit(Layer::L5);
        pu.reset_all_counters().unwrap();
        pu.enable_power_with_mask(0x3).unwrap();
        let counters = pu.read_counters(false).unwrap();
        assert!(counters["aux"]["COUNTER_COMPLETED_BYTE"] > 0);
        let dump = pu.dump_config().unwrap();
        assert!(dump.contains("--- PU MAIN module ---"));
        assert!(dump.contains("--- PU AUX module ---"));
        assert!(dump.contains("--- PU CONTROLLER module ---"));
    }
}
