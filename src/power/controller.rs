//! The Power Unit controller: the firmware block that polls the Power Unit over I2C, mirrors its
//! ADCs and temperatures and enforces the temperature, power mask and clock interlocks.

use crate::{
    core::{
        ModuleHandle,
        RegisterMap,
    },
    error::{
        ensure_range,
        Error,
        Result,
    },
    i2c::pu::PuConnector,
    power::{
        conversions::{
            Conversions,
            RtdSensor,
        },
        topology::{
            InterlockTopology,
            TrippedFlags,
        },
    },
    transport::Transport,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum PuControllerRegister {
    LimitTemp0 = 0x00,
    LimitTemp1 = 0x01,
    LimitTemp2 = 0x02,
    TempPt0 = 0x03,
    TempPt1 = 0x04,
    TempPt2 = 0x05,
    FifoRst = 0x06,
    Tripped = 0x07,
    EnablePwr = 0x08,
    EnableBias = 0x09,
    EnableMask = 0x0A,
    TempInterlockEnable = 0x0B,
    PwrInterlockEnable = 0x0C,
    LoLimitTemp0 = 0x0D,
    LoLimitTemp1 = 0x0E,
    LoLimitTemp2 = 0x0F,
    Adc00 = 0x10,
    Adc01 = 0x11,
    Adc02 = 0x12,
    Adc03 = 0x13,
    Adc04 = 0x14,
    Adc05 = 0x15,
    Adc06 = 0x16,
    Adc07 = 0x17,
    Adc08 = 0x18,
    Adc09 = 0x19,
    Adc10 = 0x1A,
    Adc11 = 0x1B,
    Adc12 = 0x1C,
    Adc13 = 0x1D,
    Adc14 = 0x1E,
    Adc15 = 0x1F,
    Adc16 = 0x20,
    Adc17 = 0x21,
    Adc18 = 0x22,
    Adc19 = 0x23,
    Adc20 = 0x24,
    Adc21 = 0x25,
    Adc22 = 0x26,
    Adc23 = 0x27,
    Adc24 = 0x28,
    Adc25 = 0x29,
    Adc26 = 0x2A,
    Adc27 = 0x2B,
    Adc28 = 0x2C,
    Adc29 = 0x2D,
    Adc30 = 0x2E,
    Adc31 = 0x2F,
    Adc32 = 0x30,
    Adc33 = 0x31,
    Adc34 = 0x32,
    TrippedPwr = 0x33,
    TrippedBias = 0x34,
    TrippedLtch = 0x35,
    MaxAdc = 0x36,
}

/// Mirrored ADC channels: four per module, then the back-bias
pub const ADC_CHANNELS: u8 = 35;
/// Channels of the 32 power ADC inputs
pub const POWER_ADC_CHANNELS: u8 = 32;
/// Number of I2C result FIFOs the controller can reset
pub const FIFOS: u8 = 4;
/// `MAX_ADC` value that never trips the clock interlock
pub const CLOCK_INTERLOCK_DISABLED: u16 = 0xFFF0;

/// The back-bias inputs of the bias ADC
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BiasAdc {
    Current,
    Voltage,
}

impl BiasAdc {
    pub const ALL: [BiasAdc; 2] = [BiasAdc::Current, BiasAdc::Voltage];

    /// Input of the bias ADC on the main I2C bus
    #[must_use]
    pub fn channel(self) -> u8 {
        match self {
            BiasAdc::Current => 0,
            BiasAdc::Voltage => 2,
        }
    }

    /// Channel of the controller mirror
    #[must_use]
    pub fn mirror_channel(self) -> u8 {
        POWER_ADC_CHANNELS + self.channel()
    }
}

/// Raw ADC codes of one module
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ModuleAdc {
    pub avdd_voltage: u16,
    pub avdd_current: u16,
    pub dvdd_voltage: u16,
    pub dvdd_current: u16,
}

impl ModuleAdc {
    /// First ADC channel of `module`, followed by AVDD current, DVDD voltage and DVDD current
    #[must_use]
    pub fn first_channel(module: u8) -> u8 {
        4 * module
    }

    #[must_use]
    pub fn from_codes(codes: [u16; 4]) -> Self {
        Self {
            avdd_voltage: codes[0],
            avdd_current: codes[1],
            dvdd_voltage: codes[2],
            dvdd_current: codes[3],
        }
    }
}

/// Upper and optional lower limit of one temperature sensor, in °C
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TemperatureLimit {
    pub sensor: RtdSensor,
    pub high: f64,
    pub low: Option<f64>,
}

/// Converts the ones-mean-off bias expander encoding to an enable mask and back
#[must_use]
pub fn invert_bias(raw: u16) -> u8 {
    (raw & 0xFF) as u8 ^ 0xFF
}

fn limit_register(sensor: RtdSensor) -> PuControllerRegister {
    match sensor {
        RtdSensor::Pu => PuControllerRegister::LimitTemp0,
        RtdSensor::Ext1 => PuControllerRegister::LimitTemp1,
        RtdSensor::Ext2 => PuControllerRegister::LimitTemp2,
    }
}

fn low_limit_register(sensor: RtdSensor) -> PuControllerRegister {
    match sensor {
        RtdSensor::Pu => PuControllerRegister::LoLimitTemp0,
        RtdSensor::Ext1 => PuControllerRegister::LoLimitTemp1,
        RtdSensor::Ext2 => PuControllerRegister::LoLimitTemp2,
    }
}

fn temperature_register(sensor: RtdSensor) -> PuControllerRegister {
    match sensor {
        RtdSensor::Pu => PuControllerRegister::TempPt0,
        RtdSensor::Ext1 => PuControllerRegister::TempPt1,
        RtdSensor::Ext2 => PuControllerRegister::TempPt2,
    }
}

/// Controller of one Power Unit
#[derive(Debug)]
pub struct PuController<T> {
    handle: ModuleHandle<T>,
    conversions: Conversions,
    topology: InterlockTopology,
    /// Sensors the temperature interlock watches
    interlock: Vec<RtdSensor>,
}

impl<T> PuController<T>
where
    T: Transport,
{
    pub fn new(
        handle: &ModuleHandle<T>,
        connector: PuConnector,
        conversions: Conversions,
        topology: InterlockTopology,
    ) -> Self {
        Self {
            handle: handle.sibling(connector.controller()),
            conversions,
            topology,
            interlock: vec![RtdSensor::Pu],
        }
    }

    #[must_use]
    pub fn conversions(&self) -> &Conversions {
        &self.conversions
    }

    pub fn conversions_mut(&mut self) -> &mut Conversions {
        &mut self.conversions
    }

    #[must_use]
    pub fn topology(&self) -> &InterlockTopology {
        &self.topology
    }

    #[must_use]
    pub fn interlock_vector(&self) -> &[RtdSensor] {
        &self.interlock
    }

    pub fn set_interlock_vector(&mut self, sensors: &[RtdSensor]) {
        let mut sensors = sensors.to_vec();
        sensors.sort_unstable();
        sensors.dedup();
        self.interlock = sensors;
    }

    /// Sets the limits of the watched sensors and enables their interlock, unless the temperature
    /// interlock already runs
    /// # Errors
    /// Returns an error if the limits leave a watched sensor unconfigured, or on bad transport
    pub fn enable_temperature_interlock(
        &self,
        limits: &[TemperatureLimit],
        suppress_warnings: bool,
    ) -> Result<()> {
        if self.is_temperature_interlock_enabled(None)? {
            if !suppress_warnings {
                warn!("Temperature interlock was already enabled!");
            }
            return Ok(());
        }
        let mut interlocks = vec![];
        for limit in limits {
            if self.interlock.contains(&limit.sensor) {
                self.set_temperature_limit(limit.sensor, limit.high)?;
                if let Some(low) = limit.low {
                    self.set_low_temperature_limit(limit.sensor, low)?;
                }
                interlocks.push(limit.sensor);
            } else {
                warn!(
                    "Setting a limit for the {} temperature, which is not monitored",
                    limit.sensor.name()
                );
            }
        }
        interlocks.sort_unstable();
        interlocks.dedup();
        if interlocks != self.interlock {
            return Err(Error::Precondition(format!(
                "invalid interlock configuration: {interlocks:?}, expected {:?}",
                self.interlock
            )));
        }
        self.enable_temperature_monitor(&interlocks)
    }

    /// # Errors
    /// Returns an error if the temperature has no RTD code, or on bad transport
    pub fn set_temperature_limit(&self, sensor: RtdSensor, temperature: f64) -> Result<()> {
        let code = self.conversions.temperature_to_code(temperature, sensor)?;
        self.handle.write(limit_register(sensor), code)
    }

    /// # Errors
    /// Returns an error if the temperature has no RTD code, or on bad transport
    pub fn set_low_temperature_limit(&self, sensor: RtdSensor, temperature: f64) -> Result<()> {
        let code = self.conversions.temperature_to_code(temperature, sensor)?;
        self.handle.write(low_limit_register(sensor), code)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_temperature_limit(&self, sensor: RtdSensor) -> Result<()> {
        self.handle.write(limit_register(sensor), 0)
    }

    fn read_temperature_register(&self, reg: PuControllerRegister, sensor: RtdSensor) -> Result<f64> {
        let code = self.handle.read(reg)?;
        self.conversions.code_to_temperature(code >> 1, sensor)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn temperature_limit(&self, sensor: RtdSensor) -> Result<f64> {
        self.read_temperature_register(limit_register(sensor), sensor)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn low_temperature_limit(&self, sensor: RtdSensor) -> Result<f64> {
        self.read_temperature_register(low_limit_register(sensor), sensor)
    }

    /// Last temperature the controller polled from `sensor`
    /// # Errors
    /// Returns an error on bad transport
    pub fn temperature(&self, sensor: RtdSensor) -> Result<f64> {
        self.read_temperature_register(temperature_register(sensor), sensor)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_all_temperatures(&self) -> Result<Vec<(RtdSensor, f64)>> {
        RtdSensor::ALL
            .into_iter()
            .map(|s| Ok((s, self.temperature(s)?)))
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

    /// # Errors
    /// Returns an error if `fifo` doesn't exist, or on bad transport
    pub fn reset_fifo(&self, fifo: u8) -> Result<()> {
        ensure_range!(fifo < FIFOS, "FIFO {fifo} not in 0..{FIFOS}");
        self.handle.write(PuControllerRegister::FifoRst, 1 << fifo)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_all_fifos(&self) -> Result<()> {
        self.handle.write(PuControllerRegister::FifoRst, 0xF)
    }

    /// Interlock conditions active right now
    /// # Errors
    /// Returns an error on bad transport
    pub fn tripped(&self) -> Result<TrippedFlags> {
        Ok(self.handle.read(PuControllerRegister::Tripped)?.into())
    }

    /// Interlock conditions seen since the last [`Self::reset_tripped_latch`]
    /// # Errors
    /// Returns an error on bad transport
    pub fn tripped_latch(&self) -> Result<TrippedFlags> {
        Ok(self.handle.read(PuControllerRegister::TrippedLtch)?.into())
    }

    /// Any write clears the latch
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_tripped_latch(&self) -> Result<()> {
        self.handle.write(PuControllerRegister::TrippedLtch, 1)
    }

    /// Whether the clock interlock threshold is armed
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_clock_interlock_enabled(&self) -> Result<bool> {
        Ok(self.handle.read(PuControllerRegister::MaxAdc)? < CLOCK_INTERLOCK_DISABLED)
    }

    /// Checks the latch against what the enabled interlocks may raise. Flags no enabled interlock
    /// accounts for are logged as a misconfiguration and don't count as fired.
    /// # Errors
    /// Returns an error on bad transport
    pub fn did_interlock_fire(&self) -> Result<bool> {
        let latch = self.tripped_latch()?;
        let expected = self.topology.expected_trips(
            &self.interlock,
            self.is_power_interlock_enabled()?,
            self.is_clock_interlock_enabled()?,
        );
        let mut fired = false;
        for bit in latch.bits() {
            if latch.outside(expected).contains(bit) {
                error!("{} bit is 1! Interlock wrongly configured!", bit.name());
            } else {
                warn!("{} bit is 1! Interlock fired!", bit.name());
                fired = true;
            }
        }
        Ok(fired)
    }

    /// Power channels switched on, as seen by the controller
    /// # Errors
    /// Returns an error on bad transport
    pub fn power_enable_status(&self) -> Result<u16> {
        self.handle.read(PuControllerRegister::EnablePwr)
    }

    /// Bias outputs switched on, as seen by the controller
    /// # Errors
    /// Returns an error on bad transport
    pub fn bias_enable_status(&self) -> Result<u8> {
        Ok(invert_bias(self.handle.read(PuControllerRegister::EnableBias)?))
    }

    /// Sets the modules expected to have AVDD and DVDD on, and the bias outputs expected on
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_expected_power_bias_enable_mask(&self, power_mask: u8, bias_mask: u8) -> Result<()> {
        let mask = u16::from(power_mask) | u16::from(bias_mask ^ 0xFF) << 8;
        self.handle.write(PuControllerRegister::EnableMask, mask)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn expected_power_bias_enable_mask(&self) -> Result<(u8, u8)> {
        let mask = self.handle.read(PuControllerRegister::EnableMask)?;
        Ok(((mask & 0xFF) as u8, invert_bias(mask >> 8)))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn log_expected_power_bias_enable_mask(&self) -> Result<()> {
        let (power, bias) = self.expected_power_bias_enable_mask()?;
        info!("Power mask {power:#04x}, bias mask {bias:#04x}");
        Ok(())
    }

    /// # Errors
    /// Returns an error if `mask` selects unknown sensors, or on bad transport
    pub fn set_temperature_interlock_enable_mask(&self, mask: u8) -> Result<()> {
        ensure_range!(mask <= 0x7, "temperature interlock mask {mask:#x}");
        self.handle
            .write(PuControllerRegister::TempInterlockEnable, u16::from(mask))
    }

    /// Enables the temperature interlock of exactly `sensors`
    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_temperature_monitor(&self, sensors: &[RtdSensor]) -> Result<()> {
        let mask = sensors.iter().fold(0, |acc, s| acc | 1 << s.index());
        self.set_temperature_interlock_enable_mask(mask)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_all_temperature_interlock(&self) -> Result<()> {
        self.set_temperature_interlock_enable_mask(0)?;
        for sensor in RtdSensor::ALL {
            self.reset_temperature_limit(sensor)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn temperature_interlock_enable_mask(&self) -> Result<u8> {
        Ok((self.handle.read(PuControllerRegister::TempInterlockEnable)? & 0x7) as u8)
    }

    /// Whether every sensor of `sensors` (the watched ones when `None`) has its interlock enabled
    /// # Errors
    /// Returns an error on bad transport
    pub fn is_temperature_interlock_enabled(&self, sensors: Option<&[RtdSensor]>) -> Result<bool> {
        let mask = self.temperature_interlock_enable_mask()?;
        Ok(sensors
            .unwrap_or(&self.interlock)
            .iter()
            .all(|s| (mask >> s.index()) & 1 == 1))
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn enable_power_bias_interlock(&self, power_mask: u8, bias_mask: u8) -> Result<()> {
        debug!("Enabling power bias interlock with power_mask {power_mask:#04x}, bias_mask {bias_mask:#04x}");
        self.set_expected_power_bias_enable_mask(power_mask, bias_mask)?;
        self.handle.write(PuControllerRegister::PwrInterlockEnable, 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_power_interlock(&self) -> Result<()> {
        self.handle.queue_write(PuControllerRegister::PwrInterlockEnable, 0)?;
        self.set_expected_power_bias_enable_mask(0, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn power_interlock_enable(&self) -> Result<u16> {
        self.handle.read(PuControllerRegister::PwrInterlockEnable)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_power_interlock_enabled(&self) -> Result<bool> {
        Ok(self.power_interlock_enable()? == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_all_interlocks(&self) -> Result<()> {
        self.disable_all_temperature_interlock()?;
        self.disable_power_interlock()
    }

    /// Mirrored ADC code of `channel`, without its four unused LSBs
    /// # Errors
    /// Returns an error if the channel doesn't exist, or on bad transport
    pub fn read_adc_channel(&self, channel: u8) -> Result<u16> {
        ensure_range!(channel < ADC_CHANNELS, "ADC channel {channel}");
        let reg = PuControllerRegister::Adc00.addr() + channel;
        Ok(self.handle.read_addr(reg)? >> 4)
    }

    /// # Errors
    /// Returns an error if `channel` isn't a power channel, or on bad transport
    pub fn read_power_adc_channel(&self, channel: u8) -> Result<u16> {
        ensure_range!(
            channel < POWER_ADC_CHANNELS,
            "{channel} is not a power ADC channel"
        );
        self.read_adc_channel(channel)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_bias_adc_channel(&self, input: BiasAdc) -> Result<u16> {
        self.read_adc_channel(input.mirror_channel())
    }

    /// # Errors
    /// Returns an error if the module doesn't exist, or on bad transport
    pub fn power_adc_values(&self, module: u8) -> Result<ModuleAdc> {
        ensure_range!(module < 8, "module {module} not in 0..8");
        let first = ModuleAdc::first_channel(module);
        Ok(ModuleAdc::from_codes([
            self.read_power_adc_channel(first)?,
            self.read_power_adc_channel(first + 1)?,
            self.read_power_adc_channel(first + 2)?,
            self.read_power_adc_channel(first + 3)?,
        ]))
    }

    /// Power enables captured when the power interlock last tripped
    /// # Errors
    /// Returns an error on bad transport
    pub fn tripped_power_enables(&self) -> Result<u16> {
        self.handle.read(PuControllerRegister::TrippedPwr)
    }

    /// Bias enables captured when the power interlock last tripped
    /// # Errors
    /// Returns an error on bad transport
    pub fn tripped_bias_enables(&self) -> Result<u8> {
        Ok(invert_bias(self.handle.read(PuControllerRegister::TrippedBias)?))
    }

    /// Sets the rail voltage above which a stopped sensor clock trips the interlock
    /// # Errors
    /// Returns an error on bad transport
    pub fn set_clock_interlock_threshold(&self, voltage: f64) -> Result<()> {
        let code = self.conversions.vpower_to_code(voltage) << 4;
        self.handle.write(PuControllerRegister::MaxAdc, code)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn disable_clock_interlock(&self) -> Result<()> {
        self.handle
            .write(PuControllerRegister::MaxAdc, CLOCK_INTERLOCK_DISABLED)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn clock_interlock_threshold(&self) -> Result<f64> {
        let code = self.handle.read(PuControllerRegister::MaxAdc)? >> 4;
        Ok(self.conversions.code_to_vpower(code))
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<PuControllerRegister>("PU CONTROLLER")
    }
}
