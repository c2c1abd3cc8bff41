//! FPGA DNA to board serial number lookup

use crate::{
    read_file,
    Error,
};
use std::{
    collections::HashMap,
    path::Path,
};

#[derive(Debug, Default, Clone)]
pub struct DnaTable(HashMap<u128, u32>);

impl DnaTable {
    /// Parses `{"0x<dna>": <serial>, ...}`
    /// # Errors
    /// Returns an error on malformed JSON or DNA keys
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: HashMap<String, u32> = serde_json::from_str(json)?;
        let mut table = HashMap::with_capacity(raw.len());
        for (k, serial) in raw {
            let digits = k.trim().trim_start_matches("0x").trim_start_matches("0X");
            let dna = u128::from_str_radix(digits, 16).map_err(|_| Error::BadHex(k.clone()))?;
            table.insert(dna, serial);
        }
        Ok(Self(table))
    }

    /// # Errors
    /// Returns an error if the file can't be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_json(&read_file(path)?)
    }

    #[must_use]
    pub fn serial(&self, dna: u128) -> Option<u32> {
        self.0.get(&dna).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let table =
            DnaTable::from_json(r#"{"0x400200000129d0a52c6060c5": 163, "0x1234": 2}"#).unwrap();
        assert_eq!(table.serial(0x4002_0000_0129_d0a5_2c60_60c5), Some(163));
        assert_eq!(table.serial(0x1234), Some(2));
        assert_eq!(table.serial(0), None);
    }

    #[test]
    fn test_bad_key() {
        assert!(matches!(
            DnaTable::from_json(r#"{"dna": 1}"#),
            Err(Error::BadHex(_))
        ));
    }
}
