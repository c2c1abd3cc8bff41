//! The identity module: firmware git hash, FPGA DNA, uptime and the front-end id set on the dip
//! switches.

use crate::{
    core::{
        ModuleHandle,
        RegisterMap,
        WB_CLOCK_HZ,
    },
    error::{
        Error,
        Result,
    },
    transport::Transport,
};
use ru_utils::dna::DnaTable;
use std::cell::Cell;
use tracing::warn;

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum IdentityRegister {
    GithashLsb = 0x00,
    GithashMsb = 0x01,
    Seed = 0x02,
    Dead1 = 0x03,
    Dead2 = 0x04,
    OsLsb = 0x05,
    DipswitchVal = 0x06,
    Dead3 = 0x07,
    DnaChunk0 = 0x08,
    DnaChunk1 = 0x09,
    DnaChunk2 = 0x0A,
    DnaChunk3 = 0x0B,
    DnaChunk4 = 0x0C,
    DnaChunk5 = 0x0D,
    UptimeLsb = 0x0E,
    UptimeCsb = 0x0F,
    UptimeMsb = 0x10,
    TimeSinceResetLsb = 0x11,
    TimeSinceResetCsb = 0x12,
    TimeSinceResetMsb = 0x13,
}

const DNA_CHUNKS: [IdentityRegister; 6] = [
    IdentityRegister::DnaChunk0,
    IdentityRegister::DnaChunk1,
    IdentityRegister::DnaChunk2,
    IdentityRegister::DnaChunk3,
    IdentityRegister::DnaChunk4,
    IdentityRegister::DnaChunk5,
];

/// The seven detector layers, numbered from the beam pipe outwards
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    L0,
    L1,
    L2,
    L3,
    L4,
    L5,
    L6,
}

impl Layer {
    pub const ALL: [Layer; 7] = [
        Layer::L0,
        Layer::L1,
        Layer::L2,
        Layer::L3,
        Layer::L4,
        Layer::L5,
        Layer::L6,
    ];

    #[must_use]
    pub fn number(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n)).copied()
    }

    /// (mask, id) of the layer bits in the front-end id
    #[must_use]
    pub fn fee_id_bits(self) -> (u8, u8) {
        match self {
            Layer::L0 => (0xF0, 0x00),
            Layer::L1 => (0xF0, 0x10),
            Layer::L2 => (0xE0, 0x20),
            Layer::L3 => (0xE0, 0x40),
            Layer::L4 => (0xE0, 0x60),
            Layer::L5 => (0xC0, 0x80),
            Layer::L6 => (0xC0, 0xC0),
        }
    }

    /// Staves on the layer, including the test benches that share its numbering
    #[must_use]
    pub fn max_staves(self) -> u8 {
        match self {
            Layer::L0 => 12 + 2,
            Layer::L1 => 16,
            Layer::L2 => 20,
            Layer::L3 => 24 + 1,
            Layer::L4 => 30,
            Layer::L5 => 42 + 1,
            Layer::L6 => 48,
        }
    }

    #[must_use]
    pub fn is_ib(self) -> bool {
        matches!(self, Layer::L0 | Layer::L1 | Layer::L2)
    }

    #[must_use]
    pub fn is_ml(self) -> bool {
        matches!(self, Layer::L3 | Layer::L4)
    }

    #[must_use]
    pub fn is_ol(self) -> bool {
        matches!(self, Layer::L5 | Layer::L6)
    }

    #[must_use]
    pub fn is_ob(self) -> bool {
        !self.is_ib()
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// A decoded front-end id
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FeeId {
    pub raw: u8,
    pub layer: Layer,
    pub stave: u8,
}

impl FeeId {
    /// # Errors
    /// Returns an error if no layer matches `raw`
    pub fn decode(raw: u8) -> Result<Self> {
        Layer::ALL
            .iter()
            .find(|l| {
                let (mask, id) = l.fee_id_bits();
                raw & mask == id
            })
            .map(|&layer| Self {
                raw,
                layer,
                stave: raw & !layer.fee_id_bits().0,
            })
            .ok_or_else(|| Error::OutOfRange(format!("no layer for fee id {raw:#04x}")))
    }

    /// # Errors
    /// Returns an error if the stave doesn't exist on `layer`
    pub fn encode(layer: Layer, stave: u8) -> Result<Self> {
        if stave >= layer.max_staves() {
            return Err(Error::OutOfRange(format!(
                "stave {stave} on {layer} (max {})",
                layer.max_staves()
            )));
        }
        Ok(Self {
            raw: layer.fee_id_bits().1 | stave,
            layer,
            stave,
        })
    }

    /// The `L<layer>_<stave>` name used by every calibration table
    #[must_use]
    pub fn stave_name(&self) -> String {
        format!("L{}_{:02}", self.layer.number(), self.stave)
    }
}

#[derive(Debug)]
pub struct Identity<T> {
    handle: ModuleHandle<T>,
    fee_id: Cell<Option<u8>>,
    dna: Cell<Option<u128>>,
}

impl<T> Identity<T>
where
    T: Transport,
{
    pub fn new(handle: ModuleHandle<T>) -> Self {
        Self {
            handle,
            fee_id: Cell::new(None),
            dna: Cell::new(None),
        }
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn git_hash(&self) -> Result<u32> {
        let regs = self
            .handle
            .read_many(&[IdentityRegister::GithashMsb, IdentityRegister::GithashLsb])?;
        Ok(regs.iter().fold(0, |acc, r| u32::from(*r) | acc << 16))
    }

    /// # Errors
    /// Returns an error if the hash doesn't match
    pub fn check_git_hash(&self, expected: u32) -> Result<()> {
        let hash = self.git_hash()?;
        if hash == expected {
            Ok(())
        } else {
            Err(Error::HardwareInconsistency(format!(
                "expected git hash {expected:#010x}, got {hash:#010x}"
            )))
        }
    }

    /// The 96-bit FPGA DNA, cached after the first read
    /// # Errors
    /// Returns an error on bad transport or a zero DNA
    pub fn dna(&self, force_read: bool) -> Result<u128> {
        if let (Some(dna), false) = (self.dna.get(), force_read) {
            return Ok(dna);
        }
        let dna = self
            .handle
            .read_many(&DNA_CHUNKS)?
            .iter()
            .enumerate()
            .fold(0u128, |acc, (i, c)| acc | (u128::from(*c) << (16 * i)));
        if dna == 0 {
            return Err(Error::HardwareInconsistency("DNA value is zero".into()));
        }
        self.dna.set(Some(dna));
        Ok(dna)
    }

    /// Looks the board serial number up by DNA
    /// # Errors
    /// Returns an error on bad transport
    pub fn serial_number(&self, table: &DnaTable) -> Result<Option<u32>> {
        let dna = self.dna(false)?;
        let sn = table.serial(dna);
        if sn.is_none() {
            warn!("DNA {dna:024X} not in the DNA lookup table");
        }
        Ok(sn)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn uptime_cycles(&self) -> Result<u64> {
        self.handle.read_wide(&[
            IdentityRegister::UptimeLsb,
            IdentityRegister::UptimeCsb,
            IdentityRegister::UptimeMsb,
        ])
    }

    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_precision_loss)]
    pub fn uptime_seconds(&self) -> Result<f64> {
        Ok(self.uptime_cycles()? as f64 / WB_CLOCK_HZ)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn time_since_reset(&self) -> Result<u64> {
        self.handle.read_wide(&[
            IdentityRegister::TimeSinceResetLsb,
            IdentityRegister::TimeSinceResetCsb,
            IdentityRegister::TimeSinceResetMsb,
        ])
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn os(&self) -> Result<u16> {
        self.handle.read(IdentityRegister::OsLsb)
    }

    /// # Errors
    /// Returns an error on bad transport or an out of range value
    pub fn dipswitch(&self) -> Result<u16> {
        let dip = self.handle.read(IdentityRegister::DipswitchVal)?;
        if dip | 0x3FF != 0x3FF {
            return Err(Error::OutOfRange(format!("dipswitch value {dip:#x}")));
        }
        Ok(dip)
    }

    /// Whether the flash controller reprograms the FPGA on power up
    /// # Errors
    /// Returns an error on bad transport
    pub fn will_be_programmed(&self) -> Result<bool> {
        Ok(self.dipswitch()? & 1 == 1)
    }

    /// The front-end id, read once and cached
    /// # Errors
    /// Returns an error on bad transport
    pub fn fee_id(&self, force_read: bool) -> Result<u8> {
        if let (Some(id), false) = (self.fee_id.get(), force_read) {
            return Ok(id);
        }
        #[allow(clippy::cast_possible_truncation)]
        let id = (self.dipswitch()? >> 2) as u8;
        self.fee_id.set(Some(id));
        Ok(id)
    }

    /// # Errors
    /// Returns an error on bad transport or an id outside every layer
    pub fn decoded_fee_id(&self) -> Result<FeeId> {
        FeeId::decode(self.fee_id(false)?)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn stave_name(&self) -> Result<String> {
        Ok(self.decoded_fee_id()?.stave_name())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn layer(&self) -> Result<Layer> {
        Ok(self.decoded_fee_id()?.layer)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle.dump_config::<IdentityRegister>("IDENTITY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::ModuleId,
        master::WishboneMaster,
        transport::mock::Mock,
    };
    use paste::paste;
    use std::sync::{
        Arc,
        Mutex,
    };

    fn identity(mock: Mock) -> (Arc<Mutex<WishboneMaster<Mock>>>, Identity<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(mock)));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::Identity);
        (master, Identity::new(handle))
    }

    macro_rules! test_fee_id {
        ($layer:ident, $stave:literal, $name:literal) => {
            paste! {
                #[test]
                fn [<test_fee_id_ $layer:lower _ $stave>]() {
                    let fee = FeeId::encode(Layer::$layer, $stave).unwrap();
                    let back = FeeId::decode(fee.raw).unwrap();
                    assert_eq!(back, fee);
                    assert_eq!(back.stave_name(), $name);
                }
            }
        };
    }

    test_fee_id!(L0, 5, "L0_05");
    test_fee_id!(L2, 19, "L2_19");
    test_fee_id!(L3, 24, "L3_24");
    test_fee_id!(L5, 42, "L5_42");
    test_fee_id!(L6, 0, "L6_00");

    #[test]
    fn test_bad_stave() {
        assert!(FeeId::encode(Layer::L1, 16).is_err());
    }

    #[test]
    fn test_layer_classes() {
        assert!(Layer::L2.is_ib());
        assert!(Layer::L4.is_ml() && Layer::L4.is_ob());
        assert!(Layer::L6.is_ol() && !Layer::L6.is_ml());
    }

    #[test]
    fn test_board_fee_id() {
        let fee = FeeId::encode(Layer::L4, 7).unwrap();
        let (_master, id) = identity(Mock::with_fee_id(fee.raw));
        assert_eq!(id.decoded_fee_id().unwrap(), fee);
        // Cached
        assert_eq!(id.fee_id(false).unwrap(), fee.raw);
        assert_eq!(id.stave_name().unwrap(), "L4_07");
    }

    #[test]
    fn test_git_hash_and_dna() {
        let (master, id) = identity(Mock::new());
        let (hash, dna) = {
            let m = master.lock().unwrap();
            (m.transport().git_hash(), m.transport().dna())
        };
        assert_eq!(id.git_hash().unwrap(), hash);
        assert_eq!(id.dna(false).unwrap(), dna);
        assert!(id.check_git_hash(hash).is_ok());
        assert!(id.check_git_hash(!hash).is_err());
    }

    #[test]
    fn test_uptime_advances() {
        let (_master, id) = identity(Mock::new());
        let before = id.uptime_cycles().unwrap();
        id.handle.wait(4000).unwrap();
        assert!(id.uptime_cycles().unwrap() >= before + 4000);
    }
}
