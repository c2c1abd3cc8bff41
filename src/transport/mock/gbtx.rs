//! The three GBTx chips behind the wishbone to I2C bridge

use super::Mock;
use crate::{
    core::{
        ModuleId,
        RegisterMap,
    },
    i2c::{
        gbtx::{
            registers,
            PuFsmStatus,
        },
        gbtx_bridge::{
            GbtxBridgeRegister,
            GBTX_CHIPS,
            GBTX_REG_MAX,
        },
    },
};
use ru_utils::gbtx::GBTX_CONFIG_REGISTERS;
use tracing::debug;

const CHIPS: usize = GBTX_CHIPS as usize;
const BYTES_PER_ACCESS: u32 = 4;
const CONFIG_DONE_MAGIC: u8 = 0xAA;
const EPLL_LOCKED: u8 = 0x15;
const SERIAL_BASE: u16 = 0x1234;

fn fsm(status: PuFsmStatus) -> u8 {
    (status as u8) << 2
}

#[derive(Debug, Clone)]
pub(super) struct GbtxBus {
    chips: [Vec<u8>; CHIPS],
    pointers: [u16; CHIPS],
    /// Chip addressed by the last address write
    target: usize,
    failures: u32,
    /// Bus resets left before SDA is released
    stuck: u32,
}

impl GbtxBus {
    pub(super) fn new() -> Self {
        let chips = std::array::from_fn(|i| {
            let mut regs = vec![0u8; usize::from(GBTX_REG_MAX) + 1];
            let serial = Self::serial_of(i).to_le_bytes();
            regs[usize::from(registers::TEST_FUSE_DATA1)] = serial[0];
            regs[usize::from(registers::TEST_FUSE_DATA2)] = serial[1];
            regs[usize::from(registers::TX_RX_EPLL_LOCKED)] = EPLL_LOCKED;
            regs[usize::from(registers::INST_LOCK_PU_FSM)] = fsm(PuFsmStatus::PauseForConfig);
            regs
        });
        Self {
            chips,
            pointers: [0; CHIPS],
            target: 0,
            failures: 0,
            stuck: 0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn serial_of(chip: usize) -> u16 {
        SERIAL_BASE + chip as u16
    }

    pub(super) fn serial(&self, chip: usize) -> u16 {
        let regs = &self.chips[chip % CHIPS];
        u16::from_le_bytes([
            regs[usize::from(registers::TEST_FUSE_DATA1)],
            regs[usize::from(registers::TEST_FUSE_DATA2)],
        ])
    }

    /// The next `n` data transactions end without acknowledge
    pub(super) fn fail(&mut self, n: u32) {
        self.failures = n;
    }

    pub(super) fn stick(&mut self, resets: u32) {
        self.stuck = resets;
    }

    /// Consumes one injected failure, if any is left
    fn nack(&mut self) -> bool {
        if self.failures > 0 {
            self.failures -= 1;
            true
        } else {
            false
        }
    }

    fn store(&mut self, value: u8) {
        let reg = usize::from(self.pointers[self.target]);
        let chip = &mut self.chips[self.target];
        // The status block is read-only
        if reg < GBTX_CONFIG_REGISTERS {
            chip[reg] = value;
            if reg == usize::from(registers::CONFIG_DONE) && value == CONFIG_DONE_MAGIC {
                chip[usize::from(registers::INST_LOCK_PU_FSM)] = fsm(PuFsmStatus::Idle);
            }
        }
        self.pointers[self.target] = self.pointers[self.target].wrapping_add(1);
    }

    fn load(&mut self) -> u8 {
        let reg = usize::from(self.pointers[self.target]);
        let value = self.chips[self.target].get(reg).copied().unwrap_or_default();
        self.pointers[self.target] = self.pointers[self.target].wrapping_add(1);
        value
    }
}

impl Mock {
    fn gbtx_transaction(&mut self) -> bool {
        if self.gbtx.nack() {
            debug!("GBTx transaction not acknowledged");
            self.count(ModuleId::I2cMonitorGbtx, "COUNTER_NOACK_ERROR", 1);
            false
        } else {
            self.count(ModuleId::I2cMonitorGbtx, "COUNTER_COMPLETED_BYTE", BYTES_PER_ACCESS);
            true
        }
    }

    pub(super) fn gbtx_read(&mut self, addr: u8) -> u16 {
        let Some(reg) = GbtxBridgeRegister::from_addr(addr) else {
            return 0;
        };
        match reg {
            GbtxBridgeRegister::AddressGbtx0
            | GbtxBridgeRegister::AddressGbtx1
            | GbtxBridgeRegister::AddressGbtx2 => self.gbtx.pointers[usize::from(addr)],
            GbtxBridgeRegister::Data => {
                if self.gbtx_transaction() {
                    u16::from(self.gbtx.load())
                } else {
                    0
                }
            }
            GbtxBridgeRegister::SniffI2c => {
                if self.gbtx.stuck > 0 {
                    0b01
                } else {
                    0b11
                }
            }
            GbtxBridgeRegister::DbFifoEmpty => 1,
            GbtxBridgeRegister::DbFifoData | GbtxBridgeRegister::DbFifoRdcnt => 0,
            GbtxBridgeRegister::Reset => self.reg(ModuleId::I2cGbt, addr),
        }
    }

    pub(super) fn gbtx_write(&mut self, addr: u8, data: u16) {
        let Some(reg) = GbtxBridgeRegister::from_addr(addr) else {
            return;
        };
        match reg {
            GbtxBridgeRegister::AddressGbtx0
            | GbtxBridgeRegister::AddressGbtx1
            | GbtxBridgeRegister::AddressGbtx2 => {
                self.gbtx.target = usize::from(addr);
                self.gbtx.pointers[usize::from(addr)] = data;
            }
            GbtxBridgeRegister::Data => {
                if self.gbtx_transaction() {
                    #[allow(clippy::cast_possible_truncation)]
                    self.gbtx.store((data & 0xFF) as u8);
                }
            }
            GbtxBridgeRegister::Reset => {
                self.gbtx.stuck = self.gbtx.stuck.saturating_sub(1);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_done_completes_powerup() {
        let mut bus = GbtxBus::new();
        bus.target = 2;
        bus.pointers[2] = registers::CONFIG_DONE;
        bus.store(CONFIG_DONE_MAGIC);
        assert_eq!(
            bus.chips[2][usize::from(registers::INST_LOCK_PU_FSM)] >> 2,
            PuFsmStatus::Idle as u8
        );
        assert_eq!(
            bus.chips[0][usize::from(registers::INST_LOCK_PU_FSM)] >> 2,
            PuFsmStatus::PauseForConfig as u8
        );
    }

    #[test]
    fn test_status_block_read_only() {
        let mut bus = GbtxBus::new();
        bus.pointers[0] = registers::TEST_FUSE_DATA1;
        bus.store(0);
        assert_eq!(bus.serial(0), SERIAL_BASE);
        assert_eq!(bus.pointers[0], registers::TEST_FUSE_DATA2);
    }

    #[test]
    fn test_failures_consumed() {
        let mut mock = Mock::new();
        mock.fail_gbtx_transactions(1);
        mock.gbtx_write(GbtxBridgeRegister::Data.addr(), 7);
        mock.gbtx_write(GbtxBridgeRegister::AddressGbtx0.addr(), 0);
        mock.gbtx_write(GbtxBridgeRegister::Data.addr(), 7);
        assert_eq!(mock.gbtx.chips[0][0], 7);
    }
}
