//! Defines the transport mechanism every link to a Readout Unit must implement

pub mod mock;

use crate::error::Result;
use std::time::Duration;
use swt::TriggerFrame;

/// The trait implemented by links to one Readout Unit.
///
/// A link carries two ordered streams: single-word transactions (and their replies) on the
/// control path, and trigger frames on the timing path. The methods of this trait *assume* that
/// the link is already open.
pub trait Transport {
    /// Pushes encoded SWT words to the board, in order
    fn send_swt(&mut self, words: &[[u8; 4]]) -> Result<()>;

    /// Receives up to `n` encoded replies. Returning fewer than `n` means the link timed out.
    fn receive_swt(&mut self, n: usize) -> Result<Vec<[u8; 4]>>;

    /// Injects one frame on the trigger link
    fn send_trigger(&mut self, frame: &TriggerFrame) -> Result<()>;

    /// Lets `bc` bunch crossings elapse on the trigger link without any frame
    fn send_idle(&mut self, bc: u32) -> Result<()>;

    /// Gives the hardware `duration` of wall time to settle
    fn settle(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
