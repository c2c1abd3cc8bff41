//! Power Unit side of the mock: the two I2C buses with their result FIFOs, the devices behind
//! them, the electrical behaviour of the regulators and the controller interlocks.

use super::Mock;
use crate::{
    core::{
        ModuleId,
        RegisterMap,
    },
    i2c::pu::{
        PuAuxRegister,
        PuBus,
        PuConnector,
        PuMainRegister,
    },
    modules::{
        alpide_control::AlpideControlRegister,
        identity::{
            FeeId,
            Layer,
        },
    },
    power::{
        controller::{
            PuControllerRegister,
            CLOCK_INTERLOCK_DISABLED,
        },
        conversions::{
            Conversions,
            PowerUnitVersion,
            RtdSensor,
            ADC_FULL_SCALE,
            ADC_VREF,
            CURRENT_SENSE_GAIN,
            CURRENT_SENSE_OFFSET,
            PT100_ALPHA,
            PT100_ZERO_RES,
            RTD_FULL_SCALE,
            TEMP_REF_RES,
            VOUT_STEP,
            VOUT_ZERO_CODE,
        },
        topology::{
            InterlockTopology,
            TrippedBit,
            TrippedFlags,
        },
    },
};
use ru_utils::calibration::DEFAULT_OFFSET;
use std::collections::VecDeque;
use tracing::{
    debug,
    warn,
};

const CHANNELS: usize = 16;
const EMPTY_FLAG: u16 = 0x8000;
const TID_MASK: u16 = 0x7FFF;
const SELECT_ALL: u16 = 0x3F;
const SELECT_ONE: u16 = 0x30;
const CONVERT: u16 = 0x20;
/// Bytes moved by one register access on either bus
const BYTES_PER_ACCESS: u32 = 3;
const DEFAULT_TEMPERATURE: f64 = 25.0;
const DEFAULT_DRAW: f64 = 0.15;
/// Leakage seen by the bias ADC while any bias output is on
const BIAS_LEAKAGE_CODE: u16 = 8;
const DCLK_OFF: u16 = 0xFF;

pub(super) fn index(connector: PuConnector) -> usize {
    match connector {
        PuConnector::One => 0,
        PuConnector::Two => 1,
    }
}

/// Connector and bus driven by the I2C master `id`
pub(super) fn bus_of(id: ModuleId) -> Option<(PuConnector, PuBus)> {
    match id {
        ModuleId::I2cPu1 => Some((PuConnector::One, PuBus::Main)),
        ModuleId::I2cPu1Aux => Some((PuConnector::One, PuBus::Aux)),
        ModuleId::I2cPu2 => Some((PuConnector::Two, PuBus::Main)),
        ModuleId::I2cPu2Aux => Some((PuConnector::Two, PuBus::Aux)),
        _ => None,
    }
}

fn controller_of(id: ModuleId) -> Option<PuConnector> {
    match id {
        ModuleId::I2cPu1Controller => Some(PuConnector::One),
        ModuleId::I2cPu2Controller => Some(PuConnector::Two),
        _ => None,
    }
}

fn adc_lsb() -> f64 {
    ADC_VREF / ADC_FULL_SCALE
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_code(value: f64, max: u16) -> u16 {
    value.floor().clamp(0.0, f64::from(max)) as u16
}

/// One Power Unit with the devices on both of its buses
#[derive(Debug, Clone)]
pub(super) struct PowerUnitModel {
    internal: u16,
    thresholds: [u16; CHANNELS],
    pub(super) dacs: [u8; CHANNELS],
    bias_dac: u8,
    power_enable: u16,
    /// Bias expander outputs, active low
    bias_raw: u8,
    adc_select: [u8; 4],
    bias_select: u8,
    pub(super) rtd: [f64; 3],
    pub(super) cable: f64,
    pub(super) draw: [f64; CHANNELS],
    /// Extra load of each channel while the sensors of its half-stave are clocked
    pub(super) clocked_draw: [f64; CHANNELS],
    /// DCLK running on the lower and upper half-stave
    clocked: [bool; 2],
    pub(super) dac_offset: u8,
    main_fifo: VecDeque<(u16, u16)>,
    aux_fifo: VecDeque<(u16, u16)>,
    tripped: u8,
    latch: u8,
    tripped_pwr: u16,
    tripped_bias: u8,
}

impl PowerUnitModel {
    pub(super) fn new() -> Self {
        Self {
            internal: 0,
            thresholds: [0xFFF; CHANNELS],
            dacs: [0; CHANNELS],
            bias_dac: 0,
            power_enable: 0,
            bias_raw: 0xFF,
            adc_select: [0; 4],
            bias_select: 0,
            rtd: [DEFAULT_TEMPERATURE; 3],
            cable: 0.0,
            draw: [DEFAULT_DRAW; CHANNELS],
            clocked_draw: [0.0; CHANNELS],
            clocked: [false; 2],
            dac_offset: DEFAULT_OFFSET,
            main_fifo: VecDeque::new(),
            aux_fifo: VecDeque::new(),
            tripped: 0,
            latch: 0,
            tripped_pwr: 0,
            tripped_bias: 0,
        }
    }

    fn conversions() -> Conversions {
        Conversions::new(PowerUnitVersion::Production, 0.0)
    }

    pub(super) fn fifo(&mut self, bus: PuBus) -> &mut VecDeque<(u16, u16)> {
        match bus {
            PuBus::Main => &mut self.main_fifo,
            PuBus::Aux => &mut self.aux_fifo,
        }
    }

    fn is_on(&self, channel: usize) -> bool {
        self.power_enable >> channel & 1 == 1
    }

    fn bias_on(&self) -> bool {
        self.bias_raw != 0xFF
    }

    fn output_voltage(&self, channel: usize) -> f64 {
        let code = f64::from(self.dacs[channel]) + f64::from(self.dac_offset) + VOUT_ZERO_CODE;
        code * VOUT_STEP
    }

    fn voltage_code(&self, channel: usize) -> u16 {
        if self.is_on(channel) {
            Self::conversions().vpower_to_code(self.output_voltage(channel))
        } else {
            0
        }
    }

    /// Amps drawn from `channel` while it is on
    fn load(&self, channel: usize) -> f64 {
        if self.clocked[channel / 8] {
            self.draw[channel] + self.clocked_draw[channel]
        } else {
            self.draw[channel]
        }
    }

    fn current_code(&self, channel: usize) -> u16 {
        if self.is_on(channel) {
            let sense = self.load(channel) * CURRENT_SENSE_GAIN + CURRENT_SENSE_OFFSET;
            to_code(sense / adc_lsb(), 0xFFF)
        } else {
            0
        }
    }

    /// One of the 32 power ADC inputs: AVDD voltage, AVDD current, DVDD voltage, DVDD current
    /// of each module
    fn power_adc(&self, input: u8) -> u16 {
        let module = usize::from(input / 4);
        match input % 4 {
            0 => self.voltage_code(2 * module),
            1 => self.current_code(2 * module),
            2 => self.voltage_code(2 * module + 1),
            _ => self.current_code(2 * module + 1),
        }
    }

    fn bias_voltage_code(&self) -> u16 {
        if self.bias_on() {
            to_code(f64::from(self.bias_dac) / 25.0 / (2.0 * adc_lsb()), 0xFFF)
        } else {
            0
        }
    }

    fn bias_current_code(&self) -> u16 {
        if self.bias_on() {
            BIAS_LEAKAGE_CODE
        } else {
            0
        }
    }

    fn bias_adc(&self, input: u8) -> u16 {
        match input {
            0 => self.bias_current_code(),
            2 => self.bias_voltage_code(),
            _ => 0,
        }
    }

    /// 15-bit resistance code of the RTD converter reading `sensor`
    fn temperature_code(&self, sensor: RtdSensor) -> u16 {
        let mut resistance =
            PT100_ZERO_RES + PT100_ZERO_RES * PT100_ALPHA * self.rtd[usize::from(sensor.index())];
        if sensor.is_external() {
            resistance += self.cable;
        }
        to_code(resistance * RTD_FULL_SCALE / TEMP_REF_RES, 0x7FFF)
    }

    /// Sensor picked by the one-hot selection in the upper byte of the internal register
    fn selected_sensor(&self) -> RtdSensor {
        let select = self.internal >> 8;
        RtdSensor::ALL
            .into_iter()
            .find(|s| select >> s.index() & 1 == 1)
            .unwrap_or(RtdSensor::Pu)
    }

    fn main_write(&mut self, reg: PuMainRegister, data: u16) {
        match reg {
            PuMainRegister::InternalRegister => self.internal = data,
            PuMainRegister::ThresCurr0
            | PuMainRegister::ThresCurr1
            | PuMainRegister::ThresCurr2
            | PuMainRegister::ThresCurr3 => {
                let quad = usize::from(reg.addr() - PuMainRegister::ThresCurr0.addr());
                let code = (data >> 4) & 0xFFF;
                if self.internal == SELECT_ALL {
                    self.thresholds[quad * 4..quad * 4 + 4].fill(code);
                } else if self.internal & SELECT_ONE == SELECT_ONE {
                    self.thresholds[quad * 4 + usize::from(self.internal & 0x3)] = code;
                }
            }
            PuMainRegister::PotPower0
            | PuMainRegister::PotPower1
            | PuMainRegister::PotPower2
            | PuMainRegister::PotPower3 => {
                let quad = usize::from(reg.addr() - PuMainRegister::PotPower0.addr());
                let channel = quad * 4 + usize::from((data >> 8) & 0x3);
                self.dacs[channel] = (data & 0xFF) as u8;
            }
            PuMainRegister::PotBias => self.bias_dac = (data & 0xFF) as u8,
            PuMainRegister::Adc0
            | PuMainRegister::Adc1
            | PuMainRegister::Adc2
            | PuMainRegister::Adc3 => {
                if data & CONVERT != 0 {
                    let adc = usize::from(reg.addr() - PuMainRegister::Adc0.addr());
                    self.adc_select[adc] = (data & 0x7) as u8;
                }
            }
            PuMainRegister::AdcBias => {
                if data & CONVERT != 0 {
                    self.bias_select = (data & 0x7) as u8;
                }
            }
            PuMainRegister::IoExpanderBias => self.bias_raw = (data & 0xFF) as u8,
            _ => {}
        }
    }

    /// Result of a read transaction started at `reg`
    fn main_read(&self, reg: PuMainRegister) -> u16 {
        match reg {
            PuMainRegister::Adc0Read
            | PuMainRegister::Adc1Read
            | PuMainRegister::Adc2Read
            | PuMainRegister::Adc3Read => {
                let adc = reg.addr() - PuMainRegister::Adc0Read.addr();
                self.power_adc(adc * 8 + self.adc_select[usize::from(adc)]) << 4
            }
            PuMainRegister::AdcBiasRead => self.bias_adc(self.bias_select) << 4,
            PuMainRegister::IoExpanderBiasRead => u16::from(self.bias_raw),
            PuMainRegister::TempThreshRdRead => self.temperature_code(self.selected_sensor()) << 1,
            _ => 0,
        }
    }

    fn aux_write(&mut self, reg: PuAuxRegister, data: u16) {
        match reg {
            PuAuxRegister::IoExpanderPower0 => {
                self.power_enable = (self.power_enable & 0xFF00) | (data & 0xFF);
            }
            PuAuxRegister::IoExpanderPower1 => {
                self.power_enable = (self.power_enable & 0x00FF) | (data & 0xFF) << 8;
            }
            _ => {}
        }
    }

    fn aux_read(&self, reg: PuAuxRegister) -> u16 {
        match reg {
            PuAuxRegister::IoExpanderPower0Read => self.power_enable & 0xFF,
            PuAuxRegister::IoExpanderPower1Read => self.power_enable >> 8,
            _ => 0,
        }
    }

    /// Switches off every channel drawing more than its threshold
    fn check_overcurrent(&mut self) {
        let conv = Self::conversions();
        for channel in 0..CHANNELS {
            if self.is_on(channel) && conv.ith_to_code(self.load(channel)) > self.thresholds[channel] {
                debug!(channel, "Over-current, channel switched off");
                self.power_enable &= !(1 << channel);
            }
        }
    }

    fn cut(&mut self, topology: &InterlockTopology, flags: TrippedFlags) {
        let channels = topology.channels_cut_by(flags);
        self.power_enable &= !channels;
        self.bias_raw |= topology.bias_of_channels(channels);
    }
}

impl Mock {
    fn layer(&self) -> Layer {
        FeeId::decode(self.fee_id).map_or(Layer::L5, |f| f.layer)
    }

    /// Whether the sensor clock runs on the lower and the upper half-stave
    fn dclk_running(&self) -> [bool; 2] {
        let off = |a: AlpideControlRegister| self.reg(ModuleId::AlpideControl, a.addr()) == DCLK_OFF;
        [
            !(off(AlpideControlRegister::SetDclkParallel0) && off(AlpideControlRegister::SetDclkParallel1)),
            !(off(AlpideControlRegister::SetDclkParallel2) && off(AlpideControlRegister::SetDclkParallel3)),
        ]
    }

    pub(super) fn check_overcurrent(&mut self) {
        let clocked = self.dclk_running();
        for pu in &mut self.pus {
            pu.clocked = clocked;
            pu.check_overcurrent();
        }
    }

    /// Over-current protection and every controller interlock of both Power Units
    pub(super) fn evaluate_power(&mut self) {
        self.check_overcurrent();
        for connector in [PuConnector::One, PuConnector::Two] {
            self.evaluate_interlocks(connector);
        }
    }

    fn evaluate_interlocks(&mut self, connector: PuConnector) {
        let ctrl = connector.controller();
        let topology = InterlockTopology::new(self.layer());
        let reg = |m: &Mock, r: PuControllerRegister| m.reg(ctrl, r.addr());
        let temp_mask = reg(self, PuControllerRegister::TempInterlockEnable);
        let power_interlock = reg(self, PuControllerRegister::PwrInterlockEnable) == 1;
        let enable_mask = reg(self, PuControllerRegister::EnableMask);
        let max_adc = reg(self, PuControllerRegister::MaxAdc);
        let mut limits = [(0u32, 0u32); 3];
        for sensor in RtdSensor::ALL {
            let i = sensor.index();
            limits[usize::from(i)] = (
                u32::from(self.reg(ctrl, PuControllerRegister::LimitTemp0.addr() + i)),
                u32::from(self.reg(ctrl, PuControllerRegister::LoLimitTemp0.addr() + i)),
            );
        }
        let clock_off = self.dclk_running().map(|running| !running);

        let pu = &mut self.pus[index(connector)];
        let previous = TrippedFlags(pu.tripped);
        let mut flags = TrippedFlags::EMPTY;

        for sensor in RtdSensor::ALL {
            if temp_mask >> sensor.index() & 1 == 0 {
                continue;
            }
            let pt = u32::from(pu.temperature_code(sensor)) << 1;
            let (high, low) = limits[usize::from(sensor.index())];
            if pt > high || (low != 0 && pt < low) {
                let trip = topology.temperature_trip(sensor);
                pu.cut(&topology, trip);
                flags |= trip;
            }
        }

        if power_interlock {
            let expected = (0..8)
                .filter(|m| enable_mask >> m & 1 == 1)
                .fold(0u16, |acc, m| acc | 0x3 << (2 * m));
            let expected_bias = ((enable_mask >> 8) as u8) ^ 0xFF;
            let bias = pu.bias_raw ^ 0xFF;
            if pu.power_enable != expected || bias != expected_bias {
                let differs =
                    (pu.power_enable ^ expected) | topology.channels_of_bias(bias ^ expected_bias);
                let trip = topology.mask_trip(differs);
                if !previous.contains(TrippedBit::MaskDiffers) {
                    warn!(
                        ?connector,
                        power = pu.power_enable,
                        expected,
                        "Power interlock tripped"
                    );
                    pu.tripped_pwr = pu.power_enable;
                    pu.tripped_bias = pu.bias_raw;
                }
                pu.cut(&topology, trip);
                flags |= trip;
            }
        }

        if max_adc < CLOCK_INTERLOCK_DISABLED {
            for (upper, half) in [(false, 0x00FFu16), (true, 0xFF00)] {
                let over = (0..CHANNELS)
                    .filter(|ch| half >> ch & 1 == 1)
                    .any(|ch| pu.voltage_code(ch) << 4 > max_adc);
                if clock_off[usize::from(upper)] && over {
                    let trip = topology.clock_trip(upper);
                    pu.cut(&topology, trip);
                    flags |= trip;
                }
            }
        }

        pu.latch |= flags.0;
        pu.tripped = flags.0;
    }

    pub(super) fn pu_bus_read(&mut self, id: ModuleId, addr: u8) -> u16 {
        let Some((connector, bus)) = bus_of(id) else {
            return 0;
        };
        let fifo = self.pus[index(connector)].fifo(bus);
        if addr == bus.data_empty_addr() {
            fifo.front().map_or(EMPTY_FLAG, |(tid, _)| *tid & TID_MASK)
        } else if addr == bus.data_addr() {
            fifo.pop_front().map_or(0, |(_, value)| value)
        } else {
            self.reg(id, addr)
        }
    }

    pub(super) fn pu_bus_write(&mut self, id: ModuleId, addr: u8, data: u16) {
        let Some((connector, bus)) = bus_of(id) else {
            return;
        };
        self.count(connector.monitor(bus), "COUNTER_COMPLETED_BYTE", BYTES_PER_ACCESS);
        let silent = self.pu_silent;
        let pu = &mut self.pus[index(connector)];
        let result = match bus {
            PuBus::Main => PuMainRegister::from_addr(addr).and_then(|reg| {
                if bus.is_read_addr(addr) {
                    Some(pu.main_read(reg))
                } else {
                    pu.main_write(reg, data);
                    None
                }
            }),
            PuBus::Aux => PuAuxRegister::from_addr(addr).and_then(|reg| {
                if bus.is_read_addr(addr) {
                    Some(pu.aux_read(reg))
                } else {
                    pu.aux_write(reg, data);
                    None
                }
            }),
        };
        if let (Some(value), false) = (result, silent) {
            pu.fifo(bus).push_back((data & TID_MASK, value));
        }
    }

    pub(super) fn controller_read(&self, id: ModuleId, addr: u8) -> u16 {
        let Some(connector) = controller_of(id) else {
            return 0;
        };
        let pu = &self.pus[index(connector)];
        let Some(reg) = PuControllerRegister::from_addr(addr) else {
            return 0;
        };
        let adc = addr.wrapping_sub(PuControllerRegister::Adc00.addr());
        match reg {
            PuControllerRegister::TempPt0
            | PuControllerRegister::TempPt1
            | PuControllerRegister::TempPt2 => {
                let i = addr - PuControllerRegister::TempPt0.addr();
                RtdSensor::ALL
                    .into_iter()
                    .find(|s| s.index() == i)
                    .map_or(0, |s| pu.temperature_code(s) << 1)
            }
            PuControllerRegister::Tripped => u16::from(pu.tripped),
            PuControllerRegister::TrippedLtch => u16::from(pu.latch),
            PuControllerRegister::EnablePwr => pu.power_enable,
            PuControllerRegister::EnableBias => u16::from(pu.bias_raw),
            PuControllerRegister::TrippedPwr => pu.tripped_pwr,
            PuControllerRegister::TrippedBias => u16::from(pu.tripped_bias),
            _ if adc < 32 => pu.power_adc(adc) << 4,
            _ if adc < 35 => pu.bias_adc(adc - 32) << 4,
            _ => self.reg(id, addr),
        }
    }

    pub(super) fn controller_write(&mut self, id: ModuleId, addr: u8, data: u16) {
        let Some(connector) = controller_of(id) else {
            return;
        };
        let pu = &mut self.pus[index(connector)];
        if addr == PuControllerRegister::TrippedLtch.addr() {
            pu.latch = 0;
        } else if addr == PuControllerRegister::FifoRst.addr() {
            if data & 0x1 != 0 {
                pu.main_fifo.clear();
            }
            if data & 0x2 != 0 {
                pu.aux_fifo.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_selection() {
        let mut pu = PowerUnitModel::new();
        pu.main_write(PuMainRegister::InternalRegister, SELECT_ONE | 2);
        pu.main_write(PuMainRegister::ThresCurr1, 0x1230);
        assert_eq!(pu.thresholds[6], 0x123);
        assert_eq!(pu.thresholds[5], 0xFFF);
        pu.main_write(PuMainRegister::InternalRegister, SELECT_ALL);
        pu.main_write(PuMainRegister::ThresCurr3, 0);
        assert!(pu.thresholds[12..].iter().all(|t| *t == 0));
    }

    #[test]
    fn test_current_sense() {
        let mut pu = PowerUnitModel::new();
        pu.aux_write(PuAuxRegister::IoExpanderPower0, 0x3);
        assert_eq!(pu.current_code(0), 579);
        pu.draw[1] = 0.5;
        assert_eq!(pu.current_code(1), 999);
        assert_eq!(pu.current_code(2), 0);
    }

    #[test]
    fn test_overcurrent_switches_off() {
        let mut pu = PowerUnitModel::new();
        pu.aux_write(PuAuxRegister::IoExpanderPower0, 0xFF);
        pu.thresholds[4] = 0;
        pu.check_overcurrent();
        assert_eq!(pu.power_enable, 0xEF);
    }

    #[test]
    fn test_open_rtd_reads_full_scale() {
        let mut pu = PowerUnitModel::new();
        pu.rtd[2] = 1000.0;
        assert_eq!(pu.temperature_code(RtdSensor::Ext2), 0x7FFF);
    }
}
