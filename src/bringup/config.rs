//! Runtime configuration of a stave bring-up

use crate::{
    error::Error,
    i2c::pu::PuConnector,
    modules::identity::Layer,
    power::{
        PowerSetup,
        PowerUnitVersion,
        RtdSensor,
        TemperatureLimit,
    },
    trigger::{
        handler::MIN_TRIGGER_DISTANCE,
        sequencer::{
            PhysicsTriggerMode,
            SequencerConfig,
            SequencerMode,
        },
    },
};
use ru_utils::{
    cable::{
        CableResistance,
        CableTable,
    },
    calibration::{
        PuCalibration,
        PuOffsets,
    },
    chargepump::{
        ChargePumpTable,
        DEFAULT_CHARGE_PUMP,
    },
    dna::DnaTable,
};
use serde::Deserialize;
use std::path::{
    Path,
    PathBuf,
};
use tracing::warn;

/// Which of the trigger handler modes the run uses
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Triggered,
    Continuous,
}

/// How the trigger handler is set up at the end of the bring-up
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TriggerSetup {
    pub mode: TriggerMode,
    /// Triggers come from the trigger link, otherwise from the internal sequencer
    pub external: bool,
    /// Internal trigger period of the continuous mode, BC
    pub period_bc: u16,
    /// Minimum distance between two sensor triggers in triggered mode, BC
    pub min_distance: u16,
    pub send_pulses: bool,
    /// Sequencer run length, `None` runs until stopped
    pub timeframes: Option<u16>,
    pub hb_per_tf: u16,
    pub hba_per_tf: u16,
    /// Physics trigger period of the sequencer, BC
    pub pt_period: u16,
}

impl Default for TriggerSetup {
    fn default() -> Self {
        Self {
            mode: TriggerMode::Triggered,
            external: true,
            period_bc: 198,
            min_distance: MIN_TRIGGER_DISTANCE,
            send_pulses: false,
            timeframes: None,
            hb_per_tf: 256,
            hba_per_tf: 256,
            pt_period: 0xFFF,
        }
    }
}

impl TriggerSetup {
    #[must_use]
    pub fn sequencer_config(&self) -> SequencerConfig {
        SequencerConfig {
            mode: match self.mode {
                TriggerMode::Triggered => SequencerMode::Triggered,
                TriggerMode::Continuous => SequencerMode::Continuous,
            },
            timeframes: self.timeframes,
            hb_per_tf: self.hb_per_tf,
            hba_per_tf: self.hba_per_tf,
            pt_mode: PhysicsTriggerMode::Periodic,
            pt_period: self.pt_period,
        }
    }
}

/// Interlock limits in °C. A sensor without a limit isn't watched.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TemperatureLimits {
    pub pu: f64,
    pub ext1: Option<f64>,
    pub ext2: Option<f64>,
}

impl Default for TemperatureLimits {
    fn default() -> Self {
        Self {
            pu: 35.0,
            ext1: None,
            ext2: None,
        }
    }
}

impl TemperatureLimits {
    #[must_use]
    pub fn limits(&self) -> Vec<TemperatureLimit> {
        [
            (RtdSensor::Pu, Some(self.pu)),
            (RtdSensor::Ext1, self.ext1),
            (RtdSensor::Ext2, self.ext2),
        ]
        .into_iter()
        .filter_map(|(sensor, high)| {
            high.map(|high| TemperatureLimit {
                sensor,
                high,
                low: None,
            })
        })
        .collect()
    }

    #[must_use]
    pub fn sensors(&self) -> Vec<RtdSensor> {
        self.limits().iter().map(|l| l.sensor).collect()
    }
}

/// GBTx1 and GBTx2 register dumps of one kind of stave
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GbtxFiles {
    pub gbtx1: PathBuf,
    pub gbtx2: PathBuf,
}

/// Loaded GBTx1 and GBTx2 configurations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GbtxConfig {
    pub gbtx1: Vec<u8>,
    pub gbtx2: Vec<u8>,
}

impl GbtxConfig {
    /// # Errors
    /// Returns an error if either dump can't be read or parsed
    pub fn from_files(files: &GbtxFiles) -> Result<Self, Error> {
        Ok(Self {
            gbtx1: ru_utils::gbtx::from_file(&files.gbtx1)?,
            gbtx2: ru_utils::gbtx::from_file(&files.gbtx2)?,
        })
    }
}

/// Everything a stave bring-up needs besides the board itself
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BringupConfig {
    /// Overrides the layer decoded from the front-end id
    pub layer: Option<u8>,
    /// Power Unit connector feeding the stave, 1 or 2
    pub power_unit: u8,
    pub power_unit_version: PowerUnitVersion,
    /// Modules to power, the whole stave when empty
    pub modules: Vec<u8>,
    pub power: PowerSetup,
    pub backbias: bool,
    pub temperature: TemperatureLimits,
    /// Compensate the voltage drops once powered
    pub compensate: bool,
    /// Middle and outer layer power cable length, metres
    pub cable_length: f64,
    pub trigger: TriggerSetup,
    /// Polls while waiting for a transceiver reset or alignment
    pub align_retries: usize,
    pub dna_table: Option<PathBuf>,
    pub charge_pump_table: Option<PathBuf>,
    pub calibration: Option<PathBuf>,
    pub cable_table: Option<PathBuf>,
    pub gbtx_ib: Option<GbtxFiles>,
    pub gbtx_ob: Option<GbtxFiles>,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            layer: None,
            power_unit: 1,
            power_unit_version: PowerUnitVersion::default(),
            modules: vec![],
            power: PowerSetup::default(),
            backbias: false,
            temperature: TemperatureLimits::default(),
            compensate: false,
            cable_length: 8.0,
            trigger: TriggerSetup::default(),
            align_retries: 10,
            dna_table: None,
            charge_pump_table: None,
            calibration: None,
            cable_table: None,
            gbtx_ib: None,
            gbtx_ob: None,
        }
    }
}

impl BringupConfig {
    /// Parses a JSON document, absent fields keep their defaults
    /// # Errors
    /// Returns an error on malformed JSON
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| Error::Config(ru_utils::Error::Json(e)))
    }

    /// # Errors
    /// Returns an error if the file can't be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// # Errors
    /// Returns an error if the connector isn't 1 or 2
    pub fn connector(&self) -> Result<PuConnector, Error> {
        match self.power_unit {
            1 => Ok(PuConnector::One),
            2 => Ok(PuConnector::Two),
            n => Err(Error::OutOfRange(format!("Power Unit connector {n}"))),
        }
    }

    /// The layer override, if any
    /// # Errors
    /// Returns an error if the override isn't a layer number
    pub fn layer_override(&self) -> Result<Option<Layer>, Error> {
        self.layer
            .map(|n| Layer::from_number(n).ok_or_else(|| Error::OutOfRange(format!("layer {n}"))))
            .transpose()
    }

    /// GBTx1 and GBTx2 configuration of a `layer` stave, `None` if no dumps were given
    /// # Errors
    /// Returns an error if the dumps can't be read or parsed
    pub fn gbtx_config(&self, layer: Layer) -> Result<Option<GbtxConfig>, Error> {
        let files = if layer.is_ib() {
            &self.gbtx_ib
        } else {
            &self.gbtx_ob
        };
        files.as_ref().map(GbtxConfig::from_files).transpose()
    }

    /// Charge pump setting of the board with FPGA `dna`. Any missing table or entry falls back
    /// to [`DEFAULT_CHARGE_PUMP`].
    #[must_use]
    pub fn charge_pump(&self, dna: u128) -> u8 {
        let (Some(dna_path), Some(cp_path)) = (&self.dna_table, &self.charge_pump_table) else {
            return DEFAULT_CHARGE_PUMP;
        };
        let serial = match DnaTable::from_file(dna_path) {
            Ok(table) => table.serial(dna),
            Err(e) => {
                warn!("{}", Error::CalibrationMissing(format!("DNA table: {e}")));
                None
            }
        };
        let Some(serial) = serial else {
            warn!(
                "{}",
                Error::CalibrationMissing(format!("no serial number for DNA {dna:#x}"))
            );
            return DEFAULT_CHARGE_PUMP;
        };
        match ChargePumpTable::from_file(cp_path) {
            Ok(table) => table.get(serial),
            Err(e) => {
                warn!("{}", Error::CalibrationMissing(format!("charge pump table: {e}")));
                DEFAULT_CHARGE_PUMP
            }
        }
    }

    /// DAC offsets of the Power Unit feeding `stave`, the defaults if it has no calibration
    #[must_use]
    pub fn offsets(&self, stave: &str) -> PuOffsets {
        let Some(path) = &self.calibration else {
            return PuOffsets::default();
        };
        match PuCalibration::from_file(path).and_then(|table| table.get(stave)) {
            Ok(offsets) => offsets,
            Err(e) => {
                warn!("{}", Error::CalibrationMissing(format!("{stave}: {e}")));
                PuOffsets::default()
            }
        }
    }

    /// Measured cable resistances of `stave`
    /// # Errors
    /// Returns an error if no cable table was given, or it has no entry for `stave`
    pub fn cable(&self, stave: &str) -> Result<CableResistance, Error> {
        let path = self
            .cable_table
            .as_ref()
            .ok_or_else(|| Error::CalibrationMissing("no cable resistance table".into()))?;
        Ok(CableTable::from_file(path)?.get(stave)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("rucontrol_config_{name}"));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_from_empty_document() {
        let config = BringupConfig::from_json("{}").unwrap();
        assert_eq!(config, BringupConfig::default());
        assert_eq!(config.connector().unwrap(), PuConnector::One);
        assert_eq!(config.layer_override().unwrap(), None);
    }

    #[test]
    fn test_partial_document() {
        let config = BringupConfig::from_json(
            r#"{
                "layer": 3,
                "power_unit": 2,
                "modules": [0, 1],
                "power": {"dvdd": 1.85},
                "temperature": {"pu": 30.0, "ext1": 28.0},
                "trigger": {"mode": "continuous", "external": false, "period_bc": 594}
            }"#,
        )
        .unwrap();
        assert_eq!(config.layer_override().unwrap(), Some(Layer::L3));
        assert_eq!(config.connector().unwrap(), PuConnector::Two);
        assert!((config.power.dvdd - 1.85).abs() < 1e-9);
        assert!((config.power.avdd - PowerSetup::default().avdd).abs() < 1e-9);
        assert_eq!(config.temperature.sensors(), vec![RtdSensor::Pu, RtdSensor::Ext1]);
        assert_eq!(config.trigger.mode, TriggerMode::Continuous);
        assert_eq!(config.trigger.period_bc, 594);
        assert_eq!(config.trigger.hb_per_tf, 256);
        assert_eq!(
            config.trigger.sequencer_config().mode,
            SequencerMode::Continuous
        );
    }

    #[test]
    fn test_bad_connector_and_layer() {
        let config = BringupConfig {
            power_unit: 3,
            layer: Some(9),
            ..BringupConfig::default()
        };
        assert!(matches!(config.connector(), Err(Error::OutOfRange(_))));
        assert!(matches!(config.layer_override(), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn test_charge_pump_lookup() {
        let dna = fixture("dna.json", r#"{"0xABCD": 42}"#);
        let cp = fixture("cp.yml", "42:\n  cp_dac: 9\n");
        let config = BringupConfig {
            dna_table: Some(dna),
            charge_pump_table: Some(cp),
            ..BringupConfig::default()
        };
        assert_eq!(config.charge_pump(0xABCD), 9);
        // Unknown board
        assert_eq!(config.charge_pump(0x1234), DEFAULT_CHARGE_PUMP);
    }

    #[test]
    fn test_charge_pump_missing_files() {
        let config = BringupConfig {
            dna_table: Some(PathBuf::from("/nonexistent/dna.json")),
            charge_pump_table: Some(PathBuf::from("/nonexistent/cp.yml")),
            ..BringupConfig::default()
        };
        assert_eq!(config.charge_pump(0xABCD), DEFAULT_CHARGE_PUMP);
        assert_eq!(BringupConfig::default().charge_pump(0xABCD), DEFAULT_CHARGE_PUMP);
    }

    #[test]
    fn test_missing_calibration_falls_back() {
        let config = BringupConfig {
            calibration: Some(PathBuf::from("/nonexistent/calibration.json")),
            ..BringupConfig::default()
        };
        assert_eq!(config.offsets("L0_03"), PuOffsets::default());
        assert!(matches!(
            config.cable("L0_03"),
            Err(Error::CalibrationMissing(_))
        ));
    }

    #[test]
    fn test_gbtx_config_by_layer() {
        let dump: String = (0..366).map(|i| format!("{:02X}\n", i % 256)).collect();
        let path = fixture("gbtx.txt", &dump);
        let config = BringupConfig {
            gbtx_ob: Some(GbtxFiles {
                gbtx1: path.clone(),
                gbtx2: path,
            }),
            ..BringupConfig::default()
        };
        assert!(config.gbtx_config(Layer::L0).unwrap().is_none());
        let gbtx = config.gbtx_config(Layer::L4).unwrap().unwrap();
        assert_eq!(gbtx.gbtx1.len(), 366);
        assert_eq!(gbtx.gbtx2[17], 17);
    }
}
