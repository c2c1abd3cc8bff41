//! GBTx register configuration dumps: one hexadecimal register value per line, in register order.

use crate::{
    read_file,
    Error,
};
use nom::{
    character::complete::{
        hex_digit1,
        line_ending,
        space0,
    },
    combinator::{
        map_res,
        opt,
    },
    multi::many0,
    sequence::{
        delimited,
        terminated,
    },
    IResult,
};
use std::path::Path;

/// Number of registers a complete GBTx configuration holds
pub const GBTX_CONFIG_REGISTERS: usize = 366;

fn value(input: &str) -> IResult<&str, u8> {
    map_res(
        delimited(space0, hex_digit1, space0),
        |s: &str| u8::from_str_radix(s, 16),
    )(input)
}

fn line(input: &str) -> IResult<&str, u8> {
    terminated(value, opt(line_ending))(input)
}

/// Parses a register dump
/// # Errors
/// Returns an error if the text is malformed or doesn't contain a full configuration
pub fn parse_config(text: &str) -> Result<Vec<u8>, Error> {
    let (rest, values) =
        many0(line)(text).map_err(|e| Error::Parse(format!("GBTx config: {e}")))?;
    if !rest.trim().is_empty() {
        let bad = rest.lines().next().unwrap_or_default();
        return Err(Error::Parse(format!("GBTx config: unexpected `{bad}`")));
    }
    if values.len() < GBTX_CONFIG_REGISTERS {
        return Err(Error::Parse(format!(
            "GBTx config has {} registers, expected {GBTX_CONFIG_REGISTERS}",
            values.len()
        )));
    }
    Ok(values)
}

/// # Errors
/// Returns an error if the file can't be read or parsed
pub fn from_file(path: &Path) -> Result<Vec<u8>, Error> {
    parse_config(&read_file(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture;

    fn dump() -> String {
        (0..GBTX_CONFIG_REGISTERS)
            .map(|i| format!("{:02X}\n", i % 256))
            .collect()
    }

    #[test]
    fn test_parse() {
        let values = parse_config(&dump()).unwrap();
        assert_eq!(values.len(), GBTX_CONFIG_REGISTERS);
        assert_eq!(values[0xAB], 0xAB);
        assert_eq!(values[300], 44);
    }

    #[test]
    fn test_crlf() {
        let text = dump().replace('\n', "\r\n");
        assert_eq!(parse_config(&text).unwrap().len(), GBTX_CONFIG_REGISTERS);
    }

    #[test]
    fn test_short_or_garbage() {
        assert!(parse_config("00\n01\n").is_err());
        let mut text = dump();
        text.push_str("zz\n");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_file() {
        let path = fixture("gbtx.txt", &dump());
        assert_eq!(from_file(&path).unwrap()[1], 1);
    }
}
