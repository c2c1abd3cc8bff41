//! # Readout Unit utilities
//!
//! Parsers for the files that accompany a Readout Unit installation: GBTx register dumps,
//! Power Unit calibration tables, cable resistances, per-board charge pump overrides and the FPGA
//! DNA to serial number lookup tables.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cable;
pub mod calibration;
pub mod chargepump;
pub mod dna;
pub mod gbtx;

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("Parsing failed to match the grammar: {0}")]
    Parse(String),
    #[error("Invalid hex literal `{0}`")]
    BadHex(String),
    #[error("No entry for `{0}`")]
    Missing(String),
    #[error("File {0} does not exist")]
    NotFound(PathBuf),
}

/// Parses `0x..` or bare hex literals the way calibration tables write them
pub(crate) fn parse_hex(s: &str) -> Result<u64, Error> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(digits, 16).map_err(|_| Error::BadHex(s.to_owned()))
}

pub(crate) fn read_file(path: &std::path::Path) -> Result<String, Error> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
pub(crate) fn fixture(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ru_utils_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
