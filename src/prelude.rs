//! Prelude (helpful reexports) for this package

pub use crate::{
    bringup::{
        BringupConfig,
        IdentityReport,
        ReadoutUnit,
        TriggerMode,
        TriggerSetup,
    },
    core::{
        ModuleHandle,
        ModuleId,
        RegisterMap,
    },
    error::{
        Error,
        Result,
    },
    master::WishboneMaster,
    power::{
        PowerSetup,
        PowerUnit,
    },
    transport::{
        mock::Mock,
        Transport,
    },
    trigger::{
        Sequencer,
        TriggerHandler,
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
    #[repr(u8)]
    enum Scratch {
        First = 0x00,
        SecondWord = 0x03,
    }

    #[test]
    fn test_derive_from_prelude() {
        assert_eq!(Scratch::ALL, &[Scratch::First, Scratch::SecondWord]);
        assert_eq!(Scratch::SecondWord.addr(), 3);
        assert_eq!(Scratch::SecondWord.name(), "SECOND_WORD");
    }
}
