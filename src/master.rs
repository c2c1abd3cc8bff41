//! The wishbone master proxy: formats register operations as single-word transactions, batches
//! them and matches the uplink replies to the reads that produced them.

use crate::{
    core::ModuleId,
    error::{
        Error,
        Result,
    },
    transport::Transport,
};
use std::{
    collections::VecDeque,
    time::Duration,
};
use swt::{
    Reply,
    Swt,
    TransactionIds,
    FIFO_DEPTH,
};
use tracing::{
    debug,
    info,
    trace,
    warn,
};

/// Largest value a single hardware wait instruction carries
const MAX_WAIT_CHUNK: u32 = 0xFFF0;

/// Owns the link to one Readout Unit and every transaction in flight on it
#[derive(Debug)]
pub struct WishboneMaster<T> {
    transport: T,
    /// Words queued but not yet committed
    pending: Vec<[u8; 4]>,
    /// Reads committed (or queued) whose reply has not been consumed, in issue order
    outstanding: VecDeque<Swt>,
    rderr_exception: bool,
    tids: TransactionIds,
}

impl<T> WishboneMaster<T>
where
    T: Transport,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: vec![],
            outstanding: VecDeque::new(),
            rderr_exception: true,
            tids: TransactionIds::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Queues a write without committing it
    /// # Errors
    /// Returns an error if `module` is not a valid module id
    pub fn queue_write(&mut self, module: u8, addr: u8, data: u16) -> Result<()> {
        let swt = Swt::write(module, addr, data)?;
        trace!(module, addr, data, "Queue write");
        self.pending.push(swt.to_bytes());
        Ok(())
    }

    /// Queues a read without committing it, its reply is consumed by [`Self::read_results`]
    /// # Errors
    /// Returns an error if `module` is not a valid module id
    pub fn queue_read(&mut self, module: u8, addr: u8) -> Result<()> {
        let swt = Swt::read(module, addr)?;
        trace!(module, addr, "Queue read");
        self.pending.push(swt.to_bytes());
        self.outstanding.push_back(swt);
        Ok(())
    }

    /// Commits every queued word to the link
    /// # Errors
    /// Returns an error on transport failure
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let words = std::mem::take(&mut self.pending);
        debug!(words = words.len(), "Flushing transactions");
        self.transport.send_swt(&words)
    }

    /// Writes `data` to `addr` of `module`, committing immediately when `commit` is set
    /// # Errors
    /// Returns an error on an invalid module or transport failure
    pub fn write(&mut self, module: u8, addr: u8, data: u16, commit: bool) -> Result<()> {
        self.queue_write(module, addr, data)?;
        if commit {
            self.flush()?;
        }
        Ok(())
    }

    /// Reads one register, committing everything queued before it
    /// # Errors
    /// Returns an error if the read fails or the slave flags it
    pub fn read(&mut self, module: u8, addr: u8) -> Result<u16> {
        self.queue_read(module, addr)?;
        let replies = self.flush_and_read_results(1)?;
        replies
            .first()
            .map(|r| r.data)
            .ok_or(Error::Timeout {
                module,
                addr,
                retries: 1,
            })
    }

    /// Commits the queue and collects `expected` replies
    /// # Errors
    /// See [`Self::read_results`]
    pub fn flush_and_read_results(&mut self, expected: usize) -> Result<Vec<Reply>> {
        self.flush()?;
        self.read_results(expected)
    }

    /// Collects the replies of the oldest `expected` outstanding reads, in issue order.
    ///
    /// Every reply is consumed even when one of them carries the error flag, so the link stays
    /// aligned; the first flagged reply is then reported if the read-error exception is enabled.
    /// # Errors
    /// Returns [`Error::Timeout`] if a reply never arrives, [`Error::TransactionIdMismatch`] if the
    /// expected reply can't be found in the uplink FIFO, and [`Error::IllegalAddress`] /
    /// [`Error::IllegalAccess`] for flagged replies.
    pub fn read_results(&mut self, expected: usize) -> Result<Vec<Reply>> {
        let mut replies = Vec::with_capacity(expected);
        for _ in 0..expected {
            let want = self.outstanding.pop_front().ok_or_else(|| {
                Error::Precondition("reading a result that was never requested".into())
            })?;
            replies.push(self.next_reply(&want)?);
        }
        if self.rderr_exception {
            if let Some(bad) = replies.iter().find(|r| r.error) {
                return Err(if bad.data & 1 == 1 {
                    Error::IllegalAddress {
                        module: bad.module,
                        addr: bad.addr,
                    }
                } else {
                    Error::IllegalAccess {
                        module: bad.module,
                        addr: bad.addr,
                    }
                });
            }
        }
        Ok(replies)
    }

    fn receive_one(&mut self, want: &Swt) -> Result<Reply> {
        let bytes = self.transport.receive_swt(1)?;
        let Some(bytes) = bytes.first() else {
            // Anything still outstanding will never be answered either
            self.outstanding.clear();
            return Err(Error::Timeout {
                module: want.module,
                addr: want.addr,
                retries: 1,
            });
        };
        Ok(Reply::from_bytes(*bytes))
    }

    fn next_reply(&mut self, want: &Swt) -> Result<Reply> {
        let first = self.receive_one(want)?;
        if first.echo() == want.echo() {
            return Ok(first);
        }
        warn!(
            expected = want.echo(),
            found = first.echo(),
            "Reply does not match the outstanding read, draining"
        );
        for count in 1..FIFO_DEPTH {
            let reply = match self.receive_one(want) {
                Ok(r) => r,
                Err(Error::Timeout { .. }) => break,
                Err(e) => return Err(e),
            };
            if reply.echo() == want.echo() {
                info!(
                    "Recovered transaction_id mismatch for transaction 0x{:04x} after reading {count} previous transactions",
                    want.echo()
                );
                return Ok(reply);
            }
        }
        Err(Error::TransactionIdMismatch {
            expected: want.echo(),
            found: first.echo(),
        })
    }

    /// Queues hardware wait instructions totalling `cycles` wishbone clock cycles
    /// # Errors
    /// Returns an error on transport failure
    pub fn wait(&mut self, cycles: u32, commit: bool) -> Result<()> {
        let module = ModuleId::FwWait as u8;
        for _ in 0..cycles / MAX_WAIT_CHUNK {
            self.queue_write(module, 0, MAX_WAIT_CHUNK as u16)?;
        }
        let rest = cycles % MAX_WAIT_CHUNK;
        if rest > 0 || cycles == 0 {
            self.queue_write(module, 0, rest as u16)?;
        }
        if commit {
            self.flush()?;
        }
        Ok(())
    }

    /// Commits the queue and lets the board settle for `duration`
    /// # Errors
    /// Returns an error on transport failure
    pub fn settle(&mut self, duration: Duration) -> Result<()> {
        self.flush()?;
        self.transport.settle(duration);
        Ok(())
    }

    pub fn enable_rderr_exception(&mut self) {
        self.rderr_exception = true;
    }

    pub fn disable_rderr_exception(&mut self) {
        self.rderr_exception = false;
    }

    #[must_use]
    pub fn rderr_exception(&self) -> bool {
        self.rderr_exception
    }

    /// Next transaction id for the I2C bridges of this channel
    pub fn next_tid(&mut self) -> u16 {
        self.tids.next_id()
    }

    /// Number of reads whose reply has not been consumed yet
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
