//! Cable resistance tables used for voltage-drop compensation.
//!
//! Keys are stave names `L<layer>_<stave>` where either part may be the wildcard `X`/`XX`. A stave
//! takes the most specific entry available: its own name, then `L<layer>_XX`, then `LX_XX`.

use crate::{
    read_file,
    Error,
};
use kstring::KString;
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{
        digit1,
        one_of,
    },
    combinator::{
        all_consuming,
        map,
        map_res,
    },
    sequence::{
        preceded,
        separated_pair,
    },
    IResult,
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::Path,
};
use tracing::debug;

/// Resistances, in ohms, of the four conductors feeding one stave
#[derive(Debug, Default, Copy, Clone, PartialEq, Deserialize)]
pub struct CableResistance {
    pub dvdd: f64,
    pub dgnd: f64,
    pub avdd: f64,
    pub agnd: f64,
}

impl CableResistance {
    /// Round-trip resistance of the digital rail
    #[must_use]
    pub fn digital(&self) -> f64 {
        self.dvdd + self.dgnd
    }

    /// Round-trip resistance of the analog rail
    #[must_use]
    pub fn analog(&self) -> f64 {
        self.avdd + self.agnd
    }
}

/// Parsed form of a table key
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StaveKey {
    Any,
    Layer(u8),
    Stave { layer: u8, stave: u8 },
}

fn number(input: &str) -> IResult<&str, u8> {
    map_res(digit1, |s: &str| s.parse::<u8>())(input)
}

fn wildcard(input: &str) -> IResult<&str, Option<u8>> {
    alt((map(alt((tag("XX"), tag("X"))), |_| None), map(number, Some)))(input)
}

fn stave_key(input: &str) -> IResult<&str, StaveKey> {
    map(
        separated_pair(preceded(one_of("Ll"), wildcard), tag("_"), wildcard),
        |key| match key {
            (Some(layer), Some(stave)) => StaveKey::Stave { layer, stave },
            (Some(layer), None) => StaveKey::Layer(layer),
            (None, _) => StaveKey::Any,
        },
    )(input)
}

impl StaveKey {
    /// # Errors
    /// Returns an error if `s` isn't a stave name
    pub fn parse(s: &str) -> Result<Self, Error> {
        all_consuming(stave_key)(s)
            .map(|(_, k)| k)
            .map_err(|_| Error::Parse(format!("invalid stave name `{s}`")))
    }
}

#[derive(Debug, Default, Clone)]
pub struct CableTable(HashMap<StaveKey, CableResistance>);

impl CableTable {
    /// # Errors
    /// Returns an error on malformed JSON or keys
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let raw: HashMap<KString, CableResistance> = serde_json::from_str(json)?;
        let mut table = HashMap::with_capacity(raw.len());
        for (k, v) in raw {
            table.insert(StaveKey::parse(&k)?, v);
        }
        Ok(Self(table))
    }

    /// # Errors
    /// Returns an error if the file can't be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_json(&read_file(path)?)
    }

    /// Looks up the resistance for a stave name such as `L0_05`
    /// # Errors
    /// Returns an error if the name is malformed or no entry matches
    pub fn get(&self, stave: &str) -> Result<CableResistance, Error> {
        let StaveKey::Stave { layer, stave: idx } = StaveKey::parse(stave)? else {
            return Err(Error::Parse(format!("`{stave}` is not a single stave")));
        };
        let mut found = None;
        for key in [
            StaveKey::Any,
            StaveKey::Layer(layer),
            StaveKey::Stave { layer, stave: idx },
        ] {
            if let Some(r) = self.0.get(&key) {
                found = Some(*r);
            }
        }
        let r = found.ok_or_else(|| Error::Missing(stave.to_owned()))?;
        debug!(stave, ?r, "Read cable resistance");
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(StaveKey::parse("LX_XX").unwrap(), StaveKey::Any);
        assert_eq!(StaveKey::parse("L3_XX").unwrap(), StaveKey::Layer(3));
        assert_eq!(
            StaveKey::parse("L0_05").unwrap(),
            StaveKey::Stave { layer: 0, stave: 5 }
        );
        assert!(StaveKey::parse("stave5").is_err());
    }

    #[test]
    fn test_precedence() {
        let json = r#"{
            "LX_XX": {"dvdd": 1.0, "dgnd": 1.0, "avdd": 1.0, "agnd": 1.0},
            "L0_XX": {"dvdd": 0.5, "dgnd": 0.5, "avdd": 0.5, "agnd": 0.5},
            "L0_05": {"dvdd": 0.3, "dgnd": 0.1, "avdd": 1.0, "agnd": 0.4}
        }"#;
        let table = CableTable::from_json(json).unwrap();
        assert_eq!(table.get("L0_05").unwrap().dvdd, 0.3);
        assert_eq!(table.get("L0_06").unwrap().dvdd, 0.5);
        assert_eq!(table.get("L4_06").unwrap().dvdd, 1.0);
        assert!((table.get("L0_05").unwrap().analog() - 1.4).abs() < 1e-9);
    }

    #[test]
    fn test_missing() {
        let table = CableTable::from_json(r#"{"L1_XX": {"dvdd": 0, "dgnd": 0, "avdd": 0, "agnd": 0}}"#)
            .unwrap();
        assert!(matches!(table.get("L2_00"), Err(Error::Missing(_))));
    }
}
