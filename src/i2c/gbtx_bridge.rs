//! The XCKU I2C master on the bus shared with the SCA and the three GBTx chips
use crate::{
    core::{
        ModuleHandle,
        ModuleId,
        RegisterMap,
    },
    error::{
        ensure_range,
        Error,
        Result,
    },
    modules::monitor::{
        CounterMonitor,
        I2C_GBTX_MONITOR,
    },
    transport::Transport,
};
use indicatif::ProgressBar;
use kstring::KString;
use std::collections::BTreeMap;
use tracing::{
    error,
    info,
    warn,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, RegisterMap)]
#[repr(u8)]
pub enum GbtxBridgeRegister {
    AddressGbtx0 = 0,
    AddressGbtx1 = 1,
    AddressGbtx2 = 2,
    Data = 3,
    Reset = 4,
    SniffI2c = 5,
    DbFifoData = 6,
    DbFifoEmpty = 7,
    DbFifoRdcnt = 8,
}

pub const GBTX_CHIPS: u8 = 3;
/// Registers read back by a full dump, including the read-only status block
pub const GBTX_REG_MAX: u16 = 435;
/// Bytes a healthy single register transaction completes on the bus
const MIN_COMPLETED_BYTES: u32 = 4;
const RECOVERY_ATTEMPTS: usize = 10;

/// Levels of the two bus lines
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct I2cPads {
    pub sda: bool,
    pub scl: bool,
}

#[derive(Debug)]
pub struct GbtxBridge<T> {
    handle: ModuleHandle<T>,
    monitor: CounterMonitor<T>,
}

impl<T> GbtxBridge<T>
where
    T: Transport,
{
    /// `handle` may point at any module of the board
    pub fn new(handle: &ModuleHandle<T>) -> Self {
        Self {
            handle: handle.sibling(ModuleId::I2cGbt),
            monitor: CounterMonitor::new(
                handle.sibling(ModuleId::I2cMonitorGbtx),
                "I2C GBTX MONITOR",
                I2C_GBTX_MONITOR,
            ),
        }
    }

    #[must_use]
    pub fn monitor(&self) -> &CounterMonitor<T> {
        &self.monitor
    }

    fn address_register(gbtx: u8) -> Result<u8> {
        ensure_range!(gbtx < GBTX_CHIPS, "GBTx index {gbtx}");
        Ok(GbtxBridgeRegister::AddressGbtx0.addr() + gbtx)
    }

    /// Sets the register the next data transaction on `gbtx` targets
    /// # Errors
    /// Returns an error on bad transport or an unknown chip
    pub fn set_address(&self, gbtx: u8, register: u16) -> Result<()> {
        self.handle.write_addr(Self::address_register(gbtx)?, register)
    }

    /// # Errors
    /// Returns an error on bad transport or an unknown chip
    pub fn address(&self, gbtx: u8) -> Result<u16> {
        self.handle.read_addr(Self::address_register(gbtx)?)
    }

    /// Toggles SCL nine times followed by a STOP condition to release a stuck slave
    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_i2c_bus(&self) -> Result<()> {
        self.handle.write(GbtxBridgeRegister::Reset, 0)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn sniff_i2c(&self) -> Result<I2cPads> {
        let raw = self.handle.read(GbtxBridgeRegister::SniffI2c)?;
        Ok(I2cPads {
            sda: raw >> 1 & 1 == 1,
            scl: raw & 1 == 1,
        })
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn is_bus_stuck(&self) -> Result<bool> {
        let pads = self.sniff_i2c()?;
        Ok(!pads.sda || !pads.scl)
    }

    /// Frees a stuck bus, first with bus resets and then by forcing writes to GBTx1 and GBTx2.
    /// Returns whether the bus is free afterwards.
    /// # Errors
    /// Returns an error on bad transport
    pub fn recover_stuck_bus(&self) -> Result<bool> {
        if !self.is_bus_stuck()? {
            info!("Bus is not stuck - no recovery needed");
            return Ok(true);
        }
        info!("Bus is stuck - attempting recovery...");
        for _ in 0..RECOVERY_ATTEMPTS {
            self.reset_i2c_bus()?;
            if !self.is_bus_stuck()? {
                info!("Bus is recovered by I2C reset!");
                return Ok(true);
            }
        }
        info!("I2C reset not sufficient, attempting force write of GBTx1&2!");
        for _ in 0..RECOVERY_ATTEMPTS {
            self.write_gbtx_register(1, 0, 0, false)?;
            self.write_gbtx_register(2, 0, 0, false)?;
            if !self.is_bus_stuck()? {
                info!("Bus is recovered by force write!");
                return Ok(true);
            }
        }
        error!("Bus recovery failed - powercycle required!");
        Ok(false)
    }

    /// Pops every word of the bus debug FIFO as `(sda, scl)` samples
    /// # Errors
    /// Returns an error on bad transport
    #[allow(clippy::cast_possible_truncation)]
    pub fn dump_db_fifo(&self) -> Result<Vec<(u8, u8)>> {
        let count = self.handle.read(GbtxBridgeRegister::DbFifoRdcnt)?;
        let regs = vec![GbtxBridgeRegister::DbFifoData; usize::from(count)];
        let words = self.handle.read_many(&regs)?;
        Ok(words
            .iter()
            .map(|w| ((w >> 8) as u8, (w & 0xFF) as u8))
            .collect())
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn db_fifo_empty(&self) -> Result<bool> {
        Ok(self.handle.read(GbtxBridgeRegister::DbFifoEmpty)? & 1 == 1)
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn reset_counters(&self) -> Result<()> {
        self.monitor.reset_all_counters()
    }

    /// # Errors
    /// Returns an error on bad transport
    pub fn read_counters(&self, reset_after: bool) -> Result<BTreeMap<KString, u32>> {
        self.monitor.read_counters(None, true, reset_after)
    }

    /// Fails with [`Error::I2cBadStatus`] unless the last transaction completed cleanly
    fn check_transaction(&self) -> Result<()> {
        let counters = self.read_counters(true)?;
        let get = |name: &str| counters.get(name).copied().unwrap_or_default();
        let completed = get("COUNTER_COMPLETED_BYTE");
        let al = get("COUNTER_AL_ERROR");
        let noack = get("COUNTER_NOACK_ERROR");
        if completed < MIN_COMPLETED_BYTES {
            warn!("completed_byte_count less than 4!");
        }
        if al > 0 {
            warn!("arbitration_lost_error_count is higher than 0!");
        }
        if noack > 0 {
            warn!("noack_error_count is higher than 0!");
        }
        if completed < MIN_COMPLETED_BYTES || al > 0 || noack > 0 {
            return Err(Error::I2cBadStatus {
                completed,
                al,
                noack,
            });
        }
        Ok(())
    }

    /// Runs `transaction` between a counter reset and a status check, once more if the bus
    /// reported a bad status
    fn checked<R>(&self, transaction: impl Fn() -> Result<R>) -> Result<R> {
        let attempt = || -> Result<R> {
            self.reset_counters()?;
            let value = transaction()?;
            self.check_transaction()?;
            Ok(value)
        };
        match attempt() {
            Err(Error::I2cBadStatus { .. }) => {
                warn!("I2C transaction failed, retrying once");
                attempt()
            }
            other => other,
        }
    }

    /// Writes one GBTx register
    /// # Errors
    /// Returns an error on bad transport, an unknown chip, or a bad bus status when `check` is set
    pub fn write_gbtx_register(&self, gbtx: u8, register: u16, value: u8, check: bool) -> Result<()> {
        let addr = Self::address_register(gbtx)?;
        let write = || {
            let id = self.handle.id() as u8;
            self.handle.with(|m| {
                m.queue_write(id, addr, register)?;
                m.write(id, GbtxBridgeRegister::Data.addr(), u16::from(value), true)
            })
        };
        if check {
            self.checked(write)
        } else {
            write()
        }
    }

    /// Reads one GBTx register
    /// # Errors
    /// Returns an error on bad transport, an unknown chip, or a bad bus status when `check` is set
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_gbtx_register(&self, gbtx: u8, register: u16, check: bool) -> Result<u8> {
        let addr = Self::address_register(gbtx)?;
        let read = || {
            let id = self.handle.id() as u8;
            self.handle.with(|m| {
                m.queue_write(id, addr, register)?;
                m.read(id, GbtxBridgeRegister::Data.addr())
            })
        };
        let value = if check { self.checked(read)? } else { read()? };
        Ok((value & 0xFF) as u8)
    }

    /// Writes consecutive registers starting at `start`, relying on the chip's address
    /// auto-increment
    /// # Errors
    /// Returns an error on bad transport or an unknown chip
    pub fn write_gbtx_registers(&self, gbtx: u8, start: u16, values: &[u8]) -> Result<()> {
        let addr = Self::address_register(gbtx)?;
        let id = self.handle.id() as u8;
        self.handle.with(|m| {
            m.queue_write(id, addr, start)?;
            for value in values {
                m.queue_write(id, GbtxBridgeRegister::Data.addr(), u16::from(*value))?;
            }
            m.flush()
        })
    }

    /// Reads `count` consecutive registers starting at `start` in one batch
    /// # Errors
    /// Returns an error on bad transport or an unknown chip
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_gbtx_registers(&self, gbtx: u8, start: u16, count: u16) -> Result<Vec<u8>> {
        let addr = Self::address_register(gbtx)?;
        let id = self.handle.id() as u8;
        let replies = self.handle.with(|m| {
            m.queue_write(id, addr, start)?;
            for _ in 0..count {
                m.queue_read(id, GbtxBridgeRegister::Data.addr())?;
            }
            m.flush_and_read_results(usize::from(count))
        })?;
        Ok(replies.iter().map(|r| (r.data & 0xFF) as u8).collect())
    }

    /// Whether `register` of `gbtx` holds `expected`
    /// # Errors
    /// Returns an error if the register can't be read
    pub fn check_gbtx_register(&self, gbtx: u8, register: u16, expected: u8) -> Result<bool> {
        let data = self.read_gbtx_register(gbtx, register, true)?;
        if data != expected {
            warn!("Register {register} was {data:02x} != expected {expected:02x}");
            return Ok(false);
        }
        Ok(true)
    }

    /// Writes every `(register, value)` pair of `registers` to `gbtx`
    /// # Errors
    /// Returns an error on the first failing write
    pub fn gbtx_config(
        &self,
        gbtx: u8,
        registers: &[(u16, u8)],
        check: bool,
        show_progress: bool,
    ) -> Result<()> {
        let pb = if show_progress {
            ProgressBar::new(registers.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        for (register, value) in registers {
            self.write_gbtx_register(gbtx, *register, *value, check)?;
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(())
    }

    /// Reads back `registers` and reports whether every one matches
    /// # Errors
    /// Returns an error on bad transport
    pub fn check_gbtx_config(&self, gbtx: u8, registers: &[(u16, u8)]) -> Result<bool> {
        ensure_range!(gbtx < GBTX_CHIPS, "GBTx index {gbtx}");
        let mut errors = 0;
        for (register, value) in registers {
            match self.check_gbtx_register(gbtx, *register, *value) {
                Ok(true) => (),
                Ok(false) => errors += 1,
                Err(e @ (Error::ChannelClosed | Error::Transport(_))) => return Err(e),
                Err(_) => {
                    error!("Reading of register {register} failed - could not check");
                    errors += 1;
                }
            }
        }
        Ok(errors == 0)
    }

    /// Lists every register of `gbtx` as `- N : 0xVV`
    /// # Errors
    /// Returns an error on bad transport
    pub fn dump_gbtx_config(&self, gbtx: u8) -> Result<String> {
        let values = self.read_gbtx_registers(gbtx, 0, GBTX_REG_MAX)?;
        let mut out = format!("--- GBTx {gbtx} ASIC ---\n");
        for (register, value) in values.iter().enumerate() {
            out.push_str(&format!("    - {register} : {value:#06X}\n"));
        }
        Ok(out)
    }

    /// # Errors
    /// Returns an error if the dump fails
    pub fn dump_config(&self) -> Result<String> {
        self.handle
            .dump_config::<GbtxBridgeRegister>("Wishbone i2gbtx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        master::WishboneMaster,
        transport::mock::Mock,
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    fn bridge() -> (Arc<Mutex<WishboneMaster<Mock>>>, GbtxBridge<Mock>) {
        let master = Arc::new(Mutex::new(WishboneMaster::new(Mock::new())));
        let handle = ModuleHandle::new(Arc::downgrade(&master), ModuleId::I2cGbt);
        (master, GbtxBridge::new(&handle))
    }

    #[test]
    fn test_checked_write_read() {
        let (_master, bridge) = bridge();
        bridge.write_gbtx_register(1, 35, 0xA5, true).unwrap();
        assert_eq!(bridge.read_gbtx_register(1, 35, true).unwrap(), 0xA5);
        // Each chip has its own register file
        assert_ne!(bridge.read_gbtx_register(2, 35, false).unwrap(), 0xA5);
        assert!(bridge.check_gbtx_register(1, 35, 0xA5).unwrap());
        assert!(!bridge.check_gbtx_register(1, 35, 0x00).unwrap());
    }

    #[test]
    fn test_unknown_chip() {
        let (_master, bridge) = bridge();
        assert!(matches!(
            bridge.write_gbtx_register(3, 0, 0, false),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn test_bad_status_retried_once() {
        let (master, bridge) = bridge();
        master.lock().unwrap().transport_mut().fail_gbtx_transactions(1);
        bridge.write_gbtx_register(0, 4, 0x11, true).unwrap();
        assert_eq!(bridge.read_gbtx_register(0, 4, true).unwrap(), 0x11);
    }

    #[test]
    fn test_bad_status_surfaced() {
        let (master, bridge) = bridge();
        master.lock().unwrap().transport_mut().fail_gbtx_transactions(2);
        assert!(matches!(
            bridge.write_gbtx_register(0, 4, 0x11, true),
            Err(Error::I2cBadStatus { noack: 1, .. })
        ));
    }

    #[test]
    fn test_auto_increment() {
        let (_master, bridge) = bridge();
        bridge.write_gbtx_registers(2, 10, &[1, 2, 3, 4]).unwrap();
        assert_eq!(bridge.read_gbtx_registers(2, 10, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(bridge.read_gbtx_register(2, 12, false).unwrap(), 3);
    }

    #[test]
    fn test_config_and_check() {
        let (_master, bridge) = bridge();
        let regs: Vec<(u16, u8)> = (0..20).map(|r| (r, (r * 3) as u8)).collect();
        bridge.gbtx_config(1, &regs, true, false).unwrap();
        assert!(bridge.check_gbtx_config(1, &regs).unwrap());
        assert!(!bridge.check_gbtx_config(2, &regs[1..]).unwrap());
    }

    #[test]
    fn test_stuck_bus_recovery() {
        let (master, bridge) = bridge();
        assert!(!bridge.is_bus_stuck().unwrap());
        master.lock().unwrap().transport_mut().set_i2c_stuck(3);
        assert!(bridge.is_bus_stuck().unwrap());
        assert!(bridge.recover_stuck_bus().unwrap());
        assert!(!bridge.is_bus_stuck().unwrap());
    }

    #[test]
    fn test_dump() {
        let (_master, bridge) = bridge();
        let dump = bridge.dump_gbtx_config(0).unwrap();
        assert!(dump.starts_with("--- GBTx 0 ASIC ---"));
        assert_eq!(dump.lines().count(), usize::from(GBTX_REG_MAX) + 1);
        assert!(bridge.dump_db_fifo().unwrap().is_empty());
    }
}
