//! Trigger subsystem: the trigger handler state machine and the internal sequencer.
//!
//! Frames arrive on the trigger link ([`crate::transport::Transport::send_trigger`]) or from the
//! sequencer when it is selected as the trigger source.

pub mod handler;
pub mod sequencer;

pub use handler::{
    OperatingMode,
    OperatingState,
    TriggerHandler,
    TriggerSource,
};
pub use sequencer::{
    Sequencer,
    SequencerConfig,
    SequencerMode,
};
