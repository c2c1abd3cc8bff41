//! Code/physical-unit conversions of the Power Unit DACs, ADCs and RTD converters.
//!
//! Every conversion depends on the board revision, so a Power Unit carries exactly one
//! [`Conversions`] and routes all of them through it.

use crate::error::{
    ensure_range,
    Result,
};
use serde::Deserialize;
use tracing::warn;

/// Reference of the ADC128D818 converters
pub const ADC_VREF: f64 = 2.56;
/// Full scale of the 12 bit ADCs
pub const ADC_FULL_SCALE: f64 = 4095.0;
/// Full scale of the 15 bit MAX31865 RTD converters
pub const RTD_FULL_SCALE: f64 = 32767.0;
/// Reference resistor of the RTD measurement
pub const TEMP_REF_RES: f64 = 400.0;
pub const PT100_ZERO_RES: f64 = 100.0;
/// DIN 43760 temperature coefficient
pub const PT100_ALPHA: f64 = 3.85e-3;
/// Volts per step of the output regulator DACs
pub const VOUT_STEP: f64 = 0.004_86;
/// Output DAC code of 0 V
pub const VOUT_ZERO_CODE: f64 = 306.0;
/// Offset of the current sense amplifier, in volts
pub const CURRENT_SENSE_OFFSET: f64 = 0.25;
/// Gain of the current sense amplifier, in V/A
pub const CURRENT_SENSE_GAIN: f64 = 0.75;

/// Board revision of a Power Unit
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerUnitVersion {
    /// Square, dual PCB
    Production,
    /// Square, dual PCB, pre-series
    #[default]
    PreProduction,
    /// Rectangular, single PCB
    Prototype,
}

/// The three PT100 sensors read by a Power Unit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RtdSensor {
    /// On the Power Unit itself
    Pu = 0,
    Ext1 = 1,
    Ext2 = 2,
}

impl RtdSensor {
    pub const ALL: [RtdSensor; 3] = [RtdSensor::Pu, RtdSensor::Ext1, RtdSensor::Ext2];

    #[must_use]
    pub fn index(self) -> u8 {
        self as u8
    }

    /// External sensors see the extra resistance of the cable and stave
    #[must_use]
    pub fn is_external(self) -> bool {
        !matches!(self, RtdSensor::Pu)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RtdSensor::Pu => "PU",
            RtdSensor::Ext1 => "EXT1",
            RtdSensor::Ext2 => "EXT2",
        }
    }
}

/// Conversions of one Power Unit
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct Conversions {
    pub version: PowerUnitVersion,
    /// Resistance the cable and stave add to the external PT100 loops, in ohms
    pub resistance_offset: f64,
}

fn adc_lsb() -> f64 {
    ADC_VREF / ADC_FULL_SCALE
}

impl Conversions {
    #[must_use]
    pub fn new(version: PowerUnitVersion, resistance_offset: f64) -> Self {
        Self {
            version,
            resistance_offset,
        }
    }

    /// Back-bias DAC code of `vbias` volts (negative), clamped to a byte
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn vbias_to_code(&self, vbias: f64) -> u8 {
        let code = (vbias * -25.0) as i64;
        if code > 0xFF {
            warn!("code out of range, set to max (code:{code}/255)");
            0xFF
        } else if code < 0 {
            warn!("code out of range, set to 0 (code: {code})");
            0
        } else {
            code as u8
        }
    }

    /// Back-bias voltage from its ADC code. The ADC sees it through a 1/2 divider.
    #[must_use]
    pub fn code_to_vbias(&self, code: u16) -> f64 {
        -2.0 * adc_lsb() * f64::from(code)
    }

    /// Back-bias current in mA from its ADC code
    #[must_use]
    pub fn code_to_ibias(&self, code: u16) -> f64 {
        let i = match self.version {
            // The regulator monitor pin gives 10 mV/mA
            PowerUnitVersion::Production => 1000.0 * adc_lsb() / 10.0 * f64::from(code),
            _ => 1000.0 * adc_lsb() * f64::from(code),
        };
        i.max(0.0)
    }

    /// ADC code of a back-bias current in mA
    #[must_use]
    pub fn ibias_to_code(&self, ibias: f64) -> f64 {
        match self.version {
            PowerUnitVersion::Production => 10.0 * (ibias / 1000.0) / adc_lsb(),
            _ => (ibias / 1000.0) / adc_lsb(),
        }
    }

    /// Output DAC code of `vout` volts, corrected by the channel `offset` and clamped to a byte
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn vout_to_code(&self, vout: f64, offset: u8) -> u8 {
        let code = (vout / VOUT_STEP - VOUT_ZERO_CODE) as i64 - i64::from(offset);
        if code < 0 {
            warn!("code out of range, set to 0 (code:{code})");
            0
        } else if code > 0xFF {
            warn!("code out of range, set to max (code:{code}/255)");
            0xFF
        } else {
            code as u8
        }
    }

    /// Rail voltage from its ADC code
    #[must_use]
    pub fn code_to_vpower(&self, code: u16) -> f64 {
        match self.version {
            PowerUnitVersion::Prototype => ADC_VREF / 4096.0 * f64::from(code),
            // 200 + 1k divider in front of the ADC
            _ => (200.0 + 1000.0) / 1000.0 * adc_lsb() * f64::from(code),
        }
    }

    /// ADC code of a rail voltage, clamped to 12 bits
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn vpower_to_code(&self, vpower: f64) -> u16 {
        let code = match self.version {
            PowerUnitVersion::Prototype => (vpower / adc_lsb()) as i64,
            _ => (1000.0 / (200.0 + 1000.0) * vpower / adc_lsb()) as i64,
        };
        if code > 0xFFF {
            warn!("code out of range, set to max (code:{code}/4095)");
            0xFFF
        } else {
            code.max(0) as u16
        }
    }

    /// Over-current threshold code of `ith` amps, clamped to 12 bits
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn ith_to_code(&self, ith: f64) -> u16 {
        let code = match self.version {
            PowerUnitVersion::Prototype => (410.0 + 3685.0 / 3.0 * ith) as i64,
            _ => (400.0 + 3695.0 / 3.0 * ith) as i64,
        };
        if code < 0 {
            warn!("code out of range, set to 0 (code:{code})");
            0
        } else if code > 0xFFF {
            warn!("code out of range, set to max (code: {code:#05X}/0xFFF)");
            0xFFF
        } else {
            code as u16
        }
    }

    /// Rail current in mA from its ADC code
    #[must_use]
    pub fn code_to_i(&self, code: u16) -> f64 {
        let i = 1000.0 * (adc_lsb() * f64::from(code) - CURRENT_SENSE_OFFSET) / CURRENT_SENSE_GAIN;
        i.max(0.0)
    }

    fn loop_resistance(&self, sensor: RtdSensor) -> f64 {
        if sensor.is_external() {
            PT100_ZERO_RES + self.resistance_offset
        } else {
            PT100_ZERO_RES
        }
    }

    /// 16 bit RTD threshold code (the 15 bit resistance shifted by one) of `temperature` °C
    /// # Errors
    /// Returns an error if the code doesn't fit in 16 bits
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn temperature_to_code(&self, temperature: f64, sensor: RtdSensor) -> Result<u16> {
        let resistance = temperature * PT100_ZERO_RES * PT100_ALPHA + self.loop_resistance(sensor);
        let code = ((resistance * RTD_FULL_SCALE / TEMP_REF_RES) as i64) << 1;
        ensure_range!(
            (0..=0xFFFF).contains(&code),
            "{temperature} C doesn't fit in an RTD code"
        );
        Ok(code as u16)
    }

    /// Temperature in °C from a 15 bit RTD resistance code
    /// # Errors
    /// Returns an error if `code` is wider than 15 bits
    pub fn code_to_temperature(&self, code: u16, sensor: RtdSensor) -> Result<f64> {
        ensure_range!(code <= 0x7FFF, "RTD code {code:#06x} is wider than 15 bits");
        let resistance = f64::from(code) * TEMP_REF_RES / RTD_FULL_SCALE;
        Ok((resistance - self.loop_resistance(sensor)) / (PT100_ZERO_RES * PT100_ALPHA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production() -> Conversions {
        Conversions::new(PowerUnitVersion::Production, 0.0)
    }

    #[test]
    fn test_vout_code() {
        let conv = production();
        // 1.8 V / 4.86 mV = 370.37
        assert_eq!(conv.vout_to_code(1.8, 0), 64);
        assert_eq!(conv.vout_to_code(1.8, 0x12), 46);
        assert_eq!(conv.vout_to_code(0.5, 0), 0);
        assert_eq!(conv.vout_to_code(3.0, 0), 0xFF);
    }

    #[test]
    fn test_vbias_code() {
        let conv = production();
        assert_eq!(conv.vbias_to_code(-3.0), 75);
        assert_eq!(conv.vbias_to_code(0.0), 0);
        assert_eq!(conv.vbias_to_code(1.0), 0);
        assert_eq!(conv.vbias_to_code(-20.0), 0xFF);
    }

    #[test]
    fn test_vpower_depends_on_version() {
        let prod = production();
        let proto = Conversions::new(PowerUnitVersion::Prototype, 0.0);
        assert!((prod.code_to_vpower(2400) - 1.800_44).abs() < 1e-4);
        assert!((proto.code_to_vpower(2400) - 1.5).abs() < 1e-9);
        let code = prod.vpower_to_code(1.8);
        assert!((prod.code_to_vpower(code) - 1.8).abs() < 1e-3);
        assert_eq!(prod.vpower_to_code(10.0), 0xFFF);
    }

    #[test]
    fn test_current_threshold_code() {
        assert_eq!(production().ith_to_code(0.0), 400);
        assert_eq!(production().ith_to_code(1.5), 2247);
        assert_eq!(production().ith_to_code(3.5), 0xFFF);
        let proto = Conversions::new(PowerUnitVersion::Prototype, 0.0);
        assert_eq!(proto.ith_to_code(0.0), 410);
    }

    #[test]
    fn test_current_below_sense_offset_is_zero() {
        let conv = production();
        assert_eq!(conv.code_to_i(0), 0.0);
        assert_eq!(conv.code_to_i(399), 0.0);
        // 0.25 V + 0.75 V/A * 0.5 A = 0.625 V
        let i = conv.code_to_i(1000);
        assert!((i - 500.0).abs() < 1.0, "{i}");
    }

    #[test]
    fn test_bias_current_factor() {
        let prod = production();
        let pre = Conversions::default();
        assert!((pre.code_to_ibias(100) / prod.code_to_ibias(100) - 10.0).abs() < 1e-9);
        assert!((prod.ibias_to_code(prod.code_to_ibias(100)) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_round_trip() {
        let conv = Conversions::new(PowerUnitVersion::Production, 2.5);
        for sensor in RtdSensor::ALL {
            let code = conv.temperature_to_code(30.0, sensor).unwrap();
            let t = conv.code_to_temperature(code >> 1, sensor).unwrap();
            assert!((t - 30.0).abs() < 0.05, "{sensor:?} {t}");
        }
        let internal = conv.temperature_to_code(30.0, RtdSensor::Pu).unwrap();
        let external = conv.temperature_to_code(30.0, RtdSensor::Ext1).unwrap();
        assert!(external > internal);
    }

    #[test]
    fn test_temperature_code_width() {
        let conv = production();
        assert!(conv.code_to_temperature(0x8000, RtdSensor::Pu).is_err());
        assert!(conv.temperature_to_code(2000.0, RtdSensor::Pu).is_err());
    }
}
