//! Per-board overrides of the GBTx0 phase-detector charge pump

use crate::{
    read_file,
    Error,
};
use serde_yaml::Value;
use std::{
    collections::HashMap,
    path::Path,
};
use tracing::warn;

/// Value used when a board has no (valid) override
pub const DEFAULT_CHARGE_PUMP: u8 = 15;
const MAX_CHARGE_PUMP: u64 = 15;

/// Overrides keyed by board serial number
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChargePumpTable(HashMap<u32, u8>);

impl ChargePumpTable {
    /// Parses a document shaped like `{<serial>: {cp_dac: <0..=15>}}`.
    ///
    /// Entries with an out-of-range value are dropped with a warning.
    /// # Errors
    /// Returns an error on malformed YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let doc: Value = serde_yaml::from_str(yaml)?;
        let mut table = HashMap::new();
        let Value::Mapping(map) = doc else {
            return Err(Error::Parse("charge pump table is not a mapping".into()));
        };
        for (key, entry) in map {
            let serial = match &key {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(|| Error::Parse(format!("invalid serial number key {key:?}")))?;
            let Some(cp) = entry.get("cp_dac").and_then(Value::as_u64) else {
                warn!(serial, "Charge pump entry without cp_dac, skipping");
                continue;
            };
            if cp > MAX_CHARGE_PUMP {
                warn!(serial, cp, "Invalid charge pump value found in YAML file, falling back to default");
                continue;
            }
            table.insert(serial, cp as u8);
        }
        Ok(Self(table))
    }

    /// # Errors
    /// Returns an error if the file can't be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_yaml(&read_file(path)?)
    }

    /// The configured value for `serial` or [`DEFAULT_CHARGE_PUMP`]
    #[must_use]
    pub fn get(&self, serial: u32) -> u8 {
        self.0.get(&serial).copied().unwrap_or(DEFAULT_CHARGE_PUMP)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
