//! Timing-system trigger frames

use crate::Error;
use num_derive::{
    FromPrimitive,
    ToPrimitive,
};
use num_traits::FromPrimitive;
use std::{
    fmt::Display,
    ops::{
        BitOr,
        BitOrAssign,
    },
};

/// Bit positions inside the 32-bit trigger type word
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum TriggerBit {
    Orbit = 0,
    Hb = 1,
    Hbr = 2,
    Hc = 3,
    Physics = 4,
    Pp = 5,
    Cal = 6,
    Sot = 7,
    Eot = 8,
    Soc = 9,
    Eoc = 10,
    Tf = 11,
    FeRst = 12,
    Rt = 13,
    Rs = 14,
}

impl TriggerBit {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TriggerBit::Orbit => "ORBIT",
            TriggerBit::Hb => "HB",
            TriggerBit::Hbr => "HBr",
            TriggerBit::Hc => "HC",
            TriggerBit::Physics => "PHYSICS",
            TriggerBit::Pp => "PP",
            TriggerBit::Cal => "CAL",
            TriggerBit::Sot => "SOT",
            TriggerBit::Eot => "EOT",
            TriggerBit::Soc => "SOC",
            TriggerBit::Eoc => "EOC",
            TriggerBit::Tf => "TF",
            TriggerBit::FeRst => "FE_RST",
            TriggerBit::Rt => "RT",
            TriggerBit::Rs => "RS",
        }
    }
}

/// Set of trigger bits carried by one frame
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TriggerType(pub u32);

impl TriggerType {
    pub const EMPTY: Self = Self(0);
    pub const ORBIT: Self = Self(1 << TriggerBit::Orbit as u32);
    pub const HB: Self = Self(1 << TriggerBit::Hb as u32);
    pub const HBR: Self = Self(1 << TriggerBit::Hbr as u32);
    pub const HC: Self = Self(1 << TriggerBit::Hc as u32);
    pub const PHYSICS: Self = Self(1 << TriggerBit::Physics as u32);
    pub const PP: Self = Self(1 << TriggerBit::Pp as u32);
    pub const CAL: Self = Self(1 << TriggerBit::Cal as u32);
    pub const SOT: Self = Self(1 << TriggerBit::Sot as u32);
    pub const EOT: Self = Self(1 << TriggerBit::Eot as u32);
    pub const SOC: Self = Self(1 << TriggerBit::Soc as u32);
    pub const EOC: Self = Self(1 << TriggerBit::Eoc as u32);
    pub const TF: Self = Self(1 << TriggerBit::Tf as u32);
    pub const FE_RST: Self = Self(1 << TriggerBit::FeRst as u32);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the known bits set in this word
    pub fn bits(self) -> impl Iterator<Item = TriggerBit> {
        (0..32)
            .filter(move |i| (self.0 >> i) & 1 == 1)
            .filter_map(TriggerBit::from_u32)
    }
}

impl BitOr for TriggerType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TriggerType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.bits().map(TriggerBit::name).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// One frame on the trigger link: `{type(32), bc(12), orbit(32)}`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TriggerFrame {
    pub kind: TriggerType,
    pub bc: u16,
    pub orbit: u32,
}

impl TriggerFrame {
    const BC_MASK: u16 = 0x0FFF;
    pub const BYTES: usize = 10;

    /// # Errors
    /// Returns an error if the bunch crossing doesn't fit in 12 bits
    pub fn new(kind: TriggerType, bc: u16, orbit: u32) -> Result<Self, Error> {
        if bc & !Self::BC_MASK != 0 {
            return Err(Error::BunchCrossing(bc));
        }
        Ok(Self { kind, bc, orbit })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::BYTES] {
        let mut bytes = [0u8; Self::BYTES];
        bytes[..4].copy_from_slice(&self.kind.0.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.bc.to_le_bytes());
        bytes[6..].copy_from_slice(&self.orbit.to_le_bytes());
        bytes
    }

    /// # Errors
    /// Returns an error if the payload is short or the bunch crossing is out of range
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::BYTES {
            return Err(Error::Incomplete {
                expected: Self::BYTES,
                got: bytes.len(),
            });
        }
        let kind = TriggerType(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        let bc = u16::from_le_bytes([bytes[4], bytes[5]]);
        let orbit = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Self::new(kind, bc, orbit)
    }

    /// An orbit tick is a heartbeat carrying the orbit bit
    #[must_use]
    pub fn is_orbit_tick(&self) -> bool {
        self.kind.contains(TriggerType::ORBIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_positions() {
        assert_eq!(TriggerType::PHYSICS.0, 0x10);
        assert_eq!(TriggerType::SOC.0, 0x200);
        assert_eq!(TriggerType::FE_RST.0, 0x1000);
    }

    #[test]
    fn test_display() {
        let kind = TriggerType::HB | TriggerType::ORBIT | TriggerType::SOT;
        assert_eq!(kind.to_string(), "ORBIT|HB|SOT");
    }

    #[test]
    fn test_bc_range() {
        assert_eq!(
            TriggerFrame::new(TriggerType::HB, 0x1000, 0),
            Err(Error::BunchCrossing(0x1000))
        );
    }

    #[test]
    fn test_frame_bytes() {
        let frame = TriggerFrame::new(TriggerType::PHYSICS, 0xabc, 0x4321_5678).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(bytes, [0x10, 0, 0, 0, 0xbc, 0x0a, 0x78, 0x56, 0x21, 0x43]);
        assert_eq!(TriggerFrame::from_bytes(&bytes).unwrap(), frame);
        assert!(matches!(
            TriggerFrame::from_bytes(&bytes[..6]),
            Err(Error::Incomplete { .. })
        ));
    }

    #[test]
    fn test_contains() {
        let kind = TriggerType::HB | TriggerType::HBR;
        assert!(kind.contains(TriggerType::HBR));
        assert!(!kind.contains(TriggerType::ORBIT));
        assert!(!kind.contains(TriggerType::EMPTY));
    }
}
