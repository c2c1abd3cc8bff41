//! How the Power Unit controller maps interlock trips onto the channels of a stave.
//!
//! The sixteen power channels are numbered `2 * module` (AVDD) and `2 * module + 1` (DVDD). The
//! controller cuts power by halves, channels 0..8 and 8..16, and each half drags along the
//! back-bias outputs of the channel groups it touches. Which groups share a bias output depends
//! on the layer the stave belongs to.

use crate::{
    modules::identity::Layer,
    power::conversions::RtdSensor,
};
use std::{
    fmt::Display,
    ops::{
        BitOr,
        BitOrAssign,
        Range,
    },
};

/// Bits of the controller `TRIPPED` and `TRIPPED_LTCH` registers
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrippedBit {
    TurnOffModules03 = 0,
    TurnOffModules47 = 1,
    InternalTemp = 2,
    Ext1Temp = 3,
    Ext2Temp = 4,
    MaskDiffers = 5,
    Clock01 = 6,
    Clock23 = 7,
}

impl TrippedBit {
    pub const ALL: [TrippedBit; 8] = [
        TrippedBit::TurnOffModules03,
        TrippedBit::TurnOffModules47,
        TrippedBit::InternalTemp,
        TrippedBit::Ext1Temp,
        TrippedBit::Ext2Temp,
        TrippedBit::MaskDiffers,
        TrippedBit::Clock01,
        TrippedBit::Clock23,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            TrippedBit::TurnOffModules03 => "TURN_OFF_MODULES_0_3",
            TrippedBit::TurnOffModules47 => "TURN_OFF_MODULES_4_7",
            TrippedBit::InternalTemp => "INTERNAL_TEMP",
            TrippedBit::Ext1Temp => "EXT1_TEMP",
            TrippedBit::Ext2Temp => "EXT2_TEMP",
            TrippedBit::MaskDiffers => "MASK_DIFFERS",
            TrippedBit::Clock01 => "CLOCK01",
            TrippedBit::Clock23 => "CLOCK23",
        }
    }
}

/// A set of [`TrippedBit`]s, as held by the tripped registers
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TrippedFlags(pub u8);

impl TrippedFlags {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn bit(bit: TrippedBit) -> Self {
        Self(1 << bit as u8)
    }

    #[must_use]
    pub fn of(bits: &[TrippedBit]) -> Self {
        bits.iter().fold(Self::EMPTY, |acc, &b| acc | Self::bit(b))
    }

    #[must_use]
    pub fn contains(self, bit: TrippedBit) -> bool {
        (self.0 >> bit as u8) & 1 == 1
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flags of `self` missing from `allowed`
    #[must_use]
    pub fn outside(self, allowed: Self) -> Self {
        Self(self.0 & !allowed.0)
    }

    pub fn bits(self) -> impl Iterator<Item = TrippedBit> {
        TrippedBit::ALL.into_iter().filter(move |&b| self.contains(b))
    }

    /// Indices of the set bits
    #[must_use]
    pub fn indices(self) -> Vec<u8> {
        self.bits().map(|b| b as u8).collect()
    }
}

impl BitOr for TrippedFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TrippedFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<u16> for TrippedFlags {
    #[allow(clippy::cast_possible_truncation)]
    fn from(raw: u16) -> Self {
        Self((raw & 0xFF) as u8)
    }
}

impl Display for TrippedFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.bits().map(TrippedBit::name).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// Power channels sharing one back-bias output
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BiasGroup {
    /// Mask over the sixteen power channels
    pub channels: u16,
    pub bias_bit: u8,
}

const fn span(first: u8, last: u8) -> u16 {
    let mut mask = 0;
    let mut ch = first;
    while ch <= last {
        mask |= 1 << ch;
        ch += 1;
    }
    mask
}

// Channels 14 and 15 have no bias output on inner and outer layer staves
const IB_OL_GROUPS: [BiasGroup; 3] = [
    BiasGroup {
        channels: span(0, 3),
        bias_bit: 0,
    },
    BiasGroup {
        channels: span(4, 9),
        bias_bit: 1,
    },
    BiasGroup {
        channels: span(10, 13),
        bias_bit: 2,
    },
];

const ML_GROUPS: [BiasGroup; 4] = [
    BiasGroup {
        channels: span(0, 3),
        bias_bit: 0,
    },
    BiasGroup {
        channels: span(4, 7),
        bias_bit: 1,
    },
    BiasGroup {
        channels: span(8, 11),
        bias_bit: 2,
    },
    BiasGroup {
        channels: span(12, 15),
        bias_bit: 3,
    },
];

pub const POWER_CHANNELS: u8 = 16;
pub const ALL_CHANNELS: u16 = 0xFFFF;
/// Channels cut by `TURN_OFF_MODULES_0_3`
pub const LOWER_HALF: u16 = 0x00FF;
/// Channels cut by `TURN_OFF_MODULES_4_7`
pub const UPPER_HALF: u16 = 0xFF00;

/// Both channels (AVDD and DVDD) of `module`
#[must_use]
pub fn module_channels(module: u8) -> u16 {
    0x3 << (2 * module)
}

/// Channel mask of every module in `modules`
#[must_use]
pub fn modules_channels(modules: &[u8]) -> u16 {
    modules.iter().fold(0, |acc, &m| acc | module_channels(m))
}

/// Interlock topology of the stave a Power Unit feeds
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InterlockTopology {
    layer: Layer,
}

impl InterlockTopology {
    #[must_use]
    pub fn new(layer: Layer) -> Self {
        Self { layer }
    }

    #[must_use]
    pub fn layer(&self) -> Layer {
        self.layer
    }

    #[must_use]
    pub fn groups(&self) -> &'static [BiasGroup] {
        if self.layer.is_ml() {
            &ML_GROUPS
        } else {
            &IB_OL_GROUPS
        }
    }

    /// Modules populated on a stave of this layer
    #[must_use]
    pub fn stave_modules(&self) -> Range<u8> {
        if self.layer.is_ib() {
            0..1
        } else if self.layer.is_ml() {
            0..8
        } else {
            0..7
        }
    }

    /// Bias outputs shared with any of `channels`
    #[must_use]
    pub fn bias_of_channels(&self, channels: u16) -> u8 {
        self.groups()
            .iter()
            .filter(|g| g.channels & channels != 0)
            .fold(0, |acc, g| acc | 1 << g.bias_bit)
    }

    /// Power channels sharing any of the `bias` outputs
    #[must_use]
    pub fn channels_of_bias(&self, bias: u8) -> u16 {
        self.groups()
            .iter()
            .filter(|g| (bias >> g.bias_bit) & 1 == 1)
            .fold(0, |acc, g| acc | g.channels)
    }

    /// Bias outputs feeding `modules`
    #[must_use]
    pub fn modules_bias(&self, modules: &[u8]) -> u8 {
        self.bias_of_channels(modules_channels(modules))
    }

    /// Trip flags raised when `sensor` exceeds its limits
    #[must_use]
    pub fn temperature_trip(&self, sensor: RtdSensor) -> TrippedFlags {
        let (lower, upper) = (TrippedBit::TurnOffModules03, TrippedBit::TurnOffModules47);
        match sensor {
            RtdSensor::Pu => TrippedFlags::of(&[lower, upper, TrippedBit::InternalTemp]),
            RtdSensor::Ext1 if self.layer.is_ib() => {
                TrippedFlags::of(&[lower, upper, TrippedBit::Ext1Temp])
            }
            RtdSensor::Ext1 => TrippedFlags::of(&[lower, TrippedBit::Ext1Temp]),
            RtdSensor::Ext2 => TrippedFlags::of(&[upper, TrippedBit::Ext2Temp]),
        }
    }

    /// Trip flags raised when the clock of the connector pair stops under power
    #[must_use]
    pub fn clock_trip(&self, upper_pair: bool) -> TrippedFlags {
        if upper_pair {
            TrippedFlags::of(&[TrippedBit::TurnOffModules47, TrippedBit::Clock23])
        } else {
            TrippedFlags::of(&[TrippedBit::TurnOffModules03, TrippedBit::Clock01])
        }
    }

    /// Flags raised by a power or bias mask mismatch on `channels`
    #[must_use]
    pub fn mask_trip(&self, channels: u16) -> TrippedFlags {
        let mut flags = TrippedFlags::bit(TrippedBit::MaskDiffers);
        if channels & LOWER_HALF != 0 {
            flags |= TrippedFlags::bit(TrippedBit::TurnOffModules03);
        }
        if channels & UPPER_HALF != 0 {
            flags |= TrippedFlags::bit(TrippedBit::TurnOffModules47);
        }
        flags
    }

    /// Power channels cut when `flags` trip
    #[must_use]
    pub fn channels_cut_by(&self, flags: TrippedFlags) -> u16 {
        let mut channels = 0;
        if flags.contains(TrippedBit::TurnOffModules03) {
            channels |= LOWER_HALF;
        }
        if flags.contains(TrippedBit::TurnOffModules47) {
            channels |= UPPER_HALF;
        }
        channels
    }

    /// Every flag the enabled interlocks may legitimately raise
    #[must_use]
    pub fn expected_trips(
        &self,
        sensors: &[RtdSensor],
        power_interlock: bool,
        clock_interlock: bool,
    ) -> TrippedFlags {
        let mut flags = sensors
            .iter()
            .fold(TrippedFlags::EMPTY, |acc, &s| acc | self.temperature_trip(s));
        if power_interlock {
            flags |= self.mask_trip(ALL_CHANNELS);
        }
        if clock_interlock {
            flags |= self.clock_trip(false) | self.clock_trip(true);
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outer_layer_groups() {
        let topo = InterlockTopology::new(Layer::L5);
        assert_eq!(topo.bias_of_channels(0x000F), 0b001);
        assert_eq!(topo.bias_of_channels(module_channels(2)), 0b010);
        assert_eq!(topo.bias_of_channels(0xC000), 0);
        assert_eq!(topo.channels_of_bias(0b100), 0x3C00);
        assert_eq!(topo.stave_modules(), 0..7);
    }

    #[test]
    fn test_middle_layer_groups() {
        let topo = InterlockTopology::new(Layer::L3);
        assert_eq!(topo.bias_of_channels(0xF000), 0b1000);
        assert_eq!(topo.modules_bias(&[0, 1, 2, 3, 4, 5, 6, 7]), 0xF);
        assert_eq!(topo.channels_of_bias(0xF), ALL_CHANNELS);
    }

    #[test]
    fn test_temperature_trips() {
        let ib = InterlockTopology::new(Layer::L0);
        let ol = InterlockTopology::new(Layer::L6);
        assert_eq!(ib.temperature_trip(RtdSensor::Pu).indices(), vec![0, 1, 2]);
        assert_eq!(ib.temperature_trip(RtdSensor::Ext1).indices(), vec![0, 1, 3]);
        assert_eq!(ol.temperature_trip(RtdSensor::Ext1).indices(), vec![0, 3]);
        assert_eq!(ol.temperature_trip(RtdSensor::Ext2).indices(), vec![1, 4]);
        assert_eq!(
            ol.channels_cut_by(ol.temperature_trip(RtdSensor::Ext2)),
            UPPER_HALF
        );
    }

    #[test]
    fn test_mask_trip() {
        let topo = InterlockTopology::new(Layer::L4);
        assert_eq!(topo.mask_trip(ALL_CHANNELS).indices(), vec![0, 1, 5]);
        assert_eq!(topo.mask_trip(module_channels(1)).indices(), vec![0, 5]);
    }

    #[test]
    fn test_expected_trips() {
        let topo = InterlockTopology::new(Layer::L5);
        let expected = topo.expected_trips(&[RtdSensor::Pu], false, false);
        let fired = TrippedFlags::of(&[TrippedBit::InternalTemp, TrippedBit::MaskDiffers]);
        assert_eq!(
            fired.outside(expected),
            TrippedFlags::bit(TrippedBit::MaskDiffers)
        );
        assert!(fired
            .outside(topo.expected_trips(&[RtdSensor::Pu], true, false))
            .is_empty());
        assert_eq!(format!("{fired}"), "INTERNAL_TEMP|MASK_DIFFERS");
    }
}
