//! Power Unit DAC offset calibration tables

use crate::{
    parse_hex,
    read_file,
    Error,
};
use kstring::KString;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::Path,
};

/// Offset applied to every channel of an uncalibrated Power Unit
pub const DEFAULT_OFFSET: u8 = 0x12;
pub const MODULES: usize = 8;

#[derive(Debug, Deserialize)]
struct RawEntry {
    offset_avdd: Vec<String>,
    offset_dvdd: Vec<String>,
}

/// Per-module DAC offsets of one Power Unit
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PuOffsets {
    pub avdd: [u8; MODULES],
    pub dvdd: [u8; MODULES],
}

impl Default for PuOffsets {
    fn default() -> Self {
        Self {
            avdd: [DEFAULT_OFFSET; MODULES],
            dvdd: [DEFAULT_OFFSET; MODULES],
        }
    }
}

fn offsets(raw: &[String], name: &str) -> Result<[u8; MODULES], Error> {
    if raw.len() != MODULES {
        return Err(Error::Parse(format!(
            "{name} needs {MODULES} entries, found {}",
            raw.len()
        )));
    }
    let mut out = [0u8; MODULES];
    for (o, s) in out.iter_mut().zip(raw) {
        *o = u8::try_from(parse_hex(s)?).map_err(|_| Error::BadHex(s.clone()))?;
    }
    Ok(out)
}

/// Calibration of every Power Unit in an installation, keyed by stave name
#[derive(Debug, Default, Clone)]
pub struct PuCalibration(HashMap<KString, PuOffsets>);

impl PuCalibration {
    /// # Errors
    /// Returns an error on malformed JSON or offsets that don't fit in a byte
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: HashMap<KString, RawEntry> = serde_json::from_str(json)?;
        let mut table = HashMap::with_capacity(raw.len());
        for (name, entry) in raw {
            let avdd = offsets(&entry.offset_avdd, "offset_avdd")?;
            let dvdd = offsets(&entry.offset_dvdd, "offset_dvdd")?;
            table.insert(name, PuOffsets { avdd, dvdd });
        }
        Ok(Self(table))
    }

    /// # Errors
    /// Returns an error if the file can't be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_json(&read_file(path)?)
    }

    /// # Errors
    /// Returns an error if the stave has no calibration
    pub fn get(&self, stave: &str) -> Result<PuOffsets, Error> {
        self.0
            .get(stave)
            .copied()
            .ok_or_else(|| Error::Missing(stave.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "L0_03": {
            "offset_avdd": ["0x10", "0x11", "0x12", "0x13", "0x14", "0x15", "0x16", "0x17"],
            "offset_dvdd": ["0x0", "0x1", "0x2", "0x3", "0x4", "0x5", "0x6", "0xff"]
        }
    }"#;

    #[test]
    fn test_offsets() {
        let cal = PuCalibration::from_json(TABLE).unwrap();
        let pu = cal.get("L0_03").unwrap();
        assert_eq!(pu.avdd[2], 0x12);
        assert_eq!(pu.dvdd[7], 0xff);
        assert!(matches!(cal.get("L6_01"), Err(Error::Missing(_))));
    }

    #[test]
    fn test_wrong_length() {
        let json = r#"{"L1_00": {"offset_avdd": ["0x1"], "offset_dvdd": []}}"#;
        assert!(matches!(PuCalibration::from_json(json), Err(Error::Parse(_))));
    }

    #[test]
    fn test_default() {
        assert_eq!(PuOffsets::default().avdd, [0x12; 8]);
    }
}
