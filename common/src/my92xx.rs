//! Two-wire MY9291/MY9231 chain: DI carries data and latch pulses, DCKI
//! clocks two bits per cycle on both edges.

use crate::driver::{DriverFamily, DutySink};

/// Command byte with APDM scatter, no frequency divider, 16-bit duty,
/// fast reaction and one-shot disabled.
pub const MY92XX_COMMAND_DEFAULT: u8 = 0x00;
pub const MY92XX_BIT_WIDTH: u8 = 16;

/// Setup and hold gap required around every latch sequence.
const GAP_US: u32 = 12;
const CLEAR_PULSES_PER_CHIP: usize = 32;
const COMMAND_MODE_PULSES: usize = 12;
const COMMAND_LATCH_PULSES: usize = 16;
const DUTY_LATCH_PULSES: usize = 8;

/// Raw access to the DI and DCKI lines.
pub trait SerialPins: Send {
    fn set_di(&mut self, high: bool);
    fn set_dcki(&mut self, high: bool);
    fn delay_us(&mut self, us: u32);
}

pub struct My92xxChain<P> {
    pins: P,
    num_chips: usize,
    channels_per_chip: usize,
    duty: Vec<u16>,
}

impl<P: SerialPins> My92xxChain<P> {
    /// Clears the duty registers of every chip and programs the command byte.
    pub fn new(mut pins: P, family: DriverFamily, num_chips: usize) -> Self {
        let num_chips = num_chips.max(1);
        let channels_per_chip = family.channels_per_chip();

        pins.set_di(false);
        pins.set_dcki(false);
        pulse_dcki(&mut pins, CLEAR_PULSES_PER_CHIP * num_chips);

        let mut chain = Self {
            pins,
            num_chips,
            channels_per_chip,
            duty: vec![0; num_chips * channels_per_chip],
        };
        chain.send_command(MY92XX_COMMAND_DEFAULT);
        chain
    }

    fn send_command(&mut self, command: u8) {
        self.pins.delay_us(GAP_US);
        pulse_di(&mut self.pins, COMMAND_MODE_PULSES);
        self.pins.delay_us(GAP_US);
        for _ in 0..self.num_chips {
            write_bits(&mut self.pins, u16::from(command), 8);
        }
        self.pins.delay_us(GAP_US);
        pulse_di(&mut self.pins, COMMAND_LATCH_PULSES);
        self.pins.delay_us(GAP_US);
    }

    #[cfg(test)]
    fn pins(&self) -> &P {
        &self.pins
    }
}

impl<P: SerialPins> DutySink for My92xxChain<P> {
    fn set_channel(&mut self, chip: usize, channel: usize, duty: u16) {
        if channel >= self.channels_per_chip {
            return;
        }
        if let Some(slot) = self.duty.get_mut(chip * self.channels_per_chip + channel) {
            *slot = duty;
        }
    }

    fn update(&mut self) {
        self.pins.delay_us(GAP_US);
        for value in &self.duty {
            write_bits(&mut self.pins, *value, MY92XX_BIT_WIDTH);
        }
        self.pins.delay_us(GAP_US);
        pulse_di(&mut self.pins, DUTY_LATCH_PULSES);
        self.pins.delay_us(GAP_US);
    }
}

fn pulse_di<P: SerialPins>(pins: &mut P, times: usize) {
    for _ in 0..times {
        pins.set_di(true);
        pins.set_di(false);
    }
}

fn pulse_dcki<P: SerialPins>(pins: &mut P, times: usize) {
    for _ in 0..times {
        pins.set_dcki(true);
        pins.set_dcki(false);
    }
}

/// MSB first, one bit latched on the rising and one on the falling clock edge.
fn write_bits<P: SerialPins>(pins: &mut P, data: u16, width: u8) {
    let mut data = data;
    let mask = 1_u16 << (width - 1);
    for _ in 0..width / 2 {
        pins.set_dcki(false);
        pins.set_di(data & mask != 0);
        pins.set_dcki(true);
        data <<= 1;
        pins.set_di(data & mask != 0);
        pins.set_dcki(false);
        pins.set_di(false);
        data <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Line {
        Di(bool),
        Dcki(bool),
        Delay(u32),
    }

    #[derive(Default)]
    struct Trace(Vec<Line>);

    impl SerialPins for Trace {
        fn set_di(&mut self, high: bool) {
            self.0.push(Line::Di(high));
        }

        fn set_dcki(&mut self, high: bool) {
            self.0.push(Line::Dcki(high));
        }

        fn delay_us(&mut self, us: u32) {
            self.0.push(Line::Delay(us));
        }
    }

    impl Trace {
        fn di_pulses(&self) -> usize {
            self.0
                .windows(2)
                .filter(|pair| **pair == [Line::Di(true), Line::Di(false)])
                .count()
        }

        /// Bits sampled on each DCKI edge, in order.
        fn clocked_bits(&self) -> Vec<bool> {
            let mut di = false;
            let mut bits = Vec::new();
            let mut clock = false;
            for line in &self.0 {
                match *line {
                    Line::Di(level) => di = level,
                    Line::Dcki(level) => {
                        if level != clock {
                            bits.push(di);
                        }
                        clock = level;
                    }
                    Line::Delay(_) => {}
                }
            }
            bits
        }
    }

    fn to_bits(value: u16, width: u8) -> Vec<bool> {
        (0..width).rev().map(|bit| value >> bit & 1 == 1).collect()
    }

    #[test]
    fn init_clears_then_programs_every_chip() {
        let chain = My92xxChain::new(Trace::default(), DriverFamily::My9231, 2);
        let trace = chain.pins();

        let clear = trace
            .0
            .iter()
            .take_while(|line| !matches!(line, Line::Delay(_)))
            .filter(|line| **line == Line::Dcki(true))
            .count();
        assert_eq!(clear, CLEAR_PULSES_PER_CHIP * 2);
        assert_eq!(trace.di_pulses(), COMMAND_MODE_PULSES + COMMAND_LATCH_PULSES);
    }

    #[test]
    fn update_shifts_every_channel_msb_first_then_latches() {
        let mut chain = My92xxChain::new(Trace::default(), DriverFamily::My9291, 1);
        let setup_len = chain.pins().0.len();

        chain.set_channel(0, 0, 0x8001);
        chain.set_channel(0, 3, 0x00ff);
        chain.set_channel(0, 4, 0xffff);
        chain.update();

        let mut sent = Trace(chain.pins().0[setup_len..].to_vec());
        let mut expected = to_bits(0x8001, 16);
        expected.extend(to_bits(0, 16));
        expected.extend(to_bits(0, 16));
        expected.extend(to_bits(0x00ff, 16));
        assert_eq!(sent.clocked_bits(), expected);

        sent.0.retain(|line| matches!(line, Line::Di(_)));
        assert_eq!(
            &sent.0[sent.0.len() - 2 * DUTY_LATCH_PULSES..],
            [Line::Di(true), Line::Di(false)].repeat(DUTY_LATCH_PULSES).as_slice()
        );
    }
}
