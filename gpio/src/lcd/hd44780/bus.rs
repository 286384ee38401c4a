//! 4-bit bus framing: nibbles latched with E pulses.

use crate::clock::Clock;
use crate::lcd::hd44780::wiring::DisplayWiring;
use crate::GpioLines;
use log::trace;

/// Full E period of a write, split evenly between the high and the low phase.
pub const WRITE_PULSE_PERIOD_NS: u64 = 1000;
/// Full E period of a read, split evenly between the high and the low phase.
pub const READ_PULSE_PERIOD_NS: u64 = 1000;
/// Bit 7 of a status read.
pub const BUSY_FLAG: u8 = 0b10000000;

/// Splits a byte into its high and low nibble.
pub fn split_nibbles(byte: u8) -> (u8, u8) {
    (byte >> 4, byte & 0x0F)
}

/// Joins a high and a low nibble, ignoring anything above bit 3 of either.
pub fn join_nibbles(high: u8, low: u8) -> u8 {
    ((high & 0x0F) << 4) | (low & 0x0F)
}

/// Bit-level access to one display. Borrowed per transfer from the session.
///
/// The data lines are only driven while a nibble is being written and are left floating
/// otherwise, since the display drives them during reads.
pub struct Hd44780Bus<'a> {
    wiring: &'a mut DisplayWiring,
    gpio: &'a dyn GpioLines,
    clock: &'a dyn Clock,
}

impl<'a> Hd44780Bus<'a> {
    pub fn new(
        wiring: &'a mut DisplayWiring,
        gpio: &'a dyn GpioLines,
        clock: &'a dyn Clock,
    ) -> Self {
        Hd44780Bus { wiring, gpio, clock }
    }

    /// Sets RS (low for commands/status, high for data) and R/W.
    pub fn select(&mut self, is_command: bool, read: bool) {
        self.wiring.rs.drive(self.gpio, !is_command);
        self.wiring.rw.drive(self.gpio, read);
    }

    fn pulse_e(&mut self, period_ns: u64) {
        self.wiring.en.drive(self.gpio, true);
        self.clock.sleep_ns(period_ns / 2);
        self.wiring.en.drive(self.gpio, false);
        self.clock.sleep_ns(period_ns / 2);
    }

    fn write_data_lines(&mut self, nibble: u8) {
        for bit in (DisplayWiring::DATA_LOW_BIT..8).rev() {
            let value = (nibble >> (bit - DisplayWiring::DATA_LOW_BIT)) & 1 == 1;
            self.wiring.data[bit].drive(self.gpio, value);
        }
    }

    fn read_data_lines(&mut self) -> u8 {
        let mut nibble = 0u8;
        for bit in (DisplayWiring::DATA_LOW_BIT..8).rev() {
            if self.wiring.data[bit].sense(self.gpio) {
                nibble |= 1 << (bit - DisplayWiring::DATA_LOW_BIT);
            }
        }
        nibble
    }

    /// Releases DB4..DB7.
    pub fn float_data(&mut self) {
        for chain in &mut self.wiring.data[DisplayWiring::DATA_LOW_BIT..] {
            chain.float(self.gpio);
        }
    }

    /// Latches a single nibble with whatever RS/RW are currently selected.
    pub fn send_nibble(&mut self, nibble: u8) {
        trace!("Writing nibble: {:04b}", nibble & 0x0F);
        self.write_data_lines(nibble);
        self.pulse_e(WRITE_PULSE_PERIOD_NS);
        self.float_data();
    }

    /// Writes a full byte, high nibble first.
    pub fn send_byte(&mut self, is_command: bool, byte: u8) {
        trace!("Sending byte: {:08b}, command: {}", byte, is_command);
        self.select(is_command, false);
        let (high, low) = split_nibbles(byte);
        self.send_nibble(high);
        self.send_nibble(low);
    }

    /// Reads a full byte, sampling the high nibble on the first E pulse and the low nibble on the
    /// second one. A command read returns the busy flag and the address counter.
    pub fn recv_byte(&mut self, is_command: bool) -> u8 {
        self.float_data();
        self.select(is_command, true);

        self.wiring.en.drive(self.gpio, true);
        self.clock.sleep_ns(READ_PULSE_PERIOD_NS / 2);
        let high = self.read_data_lines();
        self.wiring.en.drive(self.gpio, false);
        self.clock.sleep_ns(READ_PULSE_PERIOD_NS / 2);

        self.wiring.en.drive(self.gpio, true);
        self.clock.sleep_ns(READ_PULSE_PERIOD_NS / 2);
        let low = self.read_data_lines();
        self.wiring.en.drive(self.gpio, false);
        self.clock.sleep_ns(READ_PULSE_PERIOD_NS / 2);

        // Back to write so neither side drives the data lines
        self.wiring.rw.drive(self.gpio, false);
        self.float_data();

        let byte = join_nibbles(high, low);
        trace!("Read byte: {:08b}, command: {}", byte, is_command);
        byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, SimClock, SimEvent, SimGpio};
    use crate::GpioDirection;

    fn setup() -> (SimGpio, SimClock, DisplayWiring, usize) {
        let gpio = SimGpio::new();
        let clock = SimClock::new();
        let mut wiring = sim::wiring_at(0);
        wiring.request(&gpio);
        let display = gpio.attach_display(&wiring);
        gpio.set_four_bit(display, true);
        (gpio, clock, wiring, display)
    }

    #[test]
    fn nibbles_round_trip() {
        for byte in 0..=u8::MAX {
            let (high, low) = split_nibbles(byte);
            assert!(high <= 0x0F && low <= 0x0F);
            assert_eq!(join_nibbles(high, low), byte);
        }
    }

    #[test]
    fn send_byte_goes_high_nibble_first() {
        let (gpio, clock, mut wiring, display) = setup();
        let mut bus = Hd44780Bus::new(&mut wiring, &gpio, &clock);

        bus.send_byte(false, b'A');
        bus.send_byte(true, 0x80);

        assert_eq!(
            gpio.events(display),
            vec![
                SimEvent::Byte { command: false, value: b'A' },
                SimEvent::Byte { command: true, value: 0x80 },
            ]
        );
    }

    #[test]
    fn send_nibble_in_8bit_mode_is_one_transfer() {
        let (gpio, clock, mut wiring, display) = setup();
        gpio.set_four_bit(display, false);
        let mut bus = Hd44780Bus::new(&mut wiring, &gpio, &clock);

        bus.select(true, false);
        bus.send_nibble(0x3);

        assert_eq!(gpio.events(display), vec![SimEvent::Nibble { command: true, value: 0x3 }]);
    }

    #[test]
    fn data_lines_float_after_every_transfer() {
        let (gpio, clock, mut wiring, _) = setup();
        let mut bus = Hd44780Bus::new(&mut wiring, &gpio, &clock);

        bus.send_byte(false, 0xFF);
        for line in 3..7 {
            assert_eq!(gpio.direction(line), Some(GpioDirection::Input));
        }

        bus.recv_byte(true);
        for line in 3..7 {
            assert_eq!(gpio.direction(line), Some(GpioDirection::Input));
        }
        // R/W is back to write
        assert_eq!(gpio.level(2), Some(false));
    }

    #[test]
    fn recv_byte_reads_status() {
        let (gpio, clock, mut wiring, display) = setup();
        let mut bus = Hd44780Bus::new(&mut wiring, &gpio, &clock);

        bus.send_byte(true, 0x80 | 0x45);
        assert_eq!(bus.recv_byte(true), 0x45);

        gpio.set_stuck_busy(display, true);
        assert_eq!(bus.recv_byte(true), BUSY_FLAG | 0x45);
        assert_eq!(gpio.contentions(display), 0);
    }

    #[test]
    fn recv_byte_reads_ddram() {
        let (gpio, clock, mut wiring, _) = setup();
        let mut bus = Hd44780Bus::new(&mut wiring, &gpio, &clock);

        bus.send_byte(false, b'x');
        bus.send_byte(true, 0x80);
        assert_eq!(bus.recv_byte(false), b'x');
    }

    #[test]
    fn pulses_hold_half_period_per_phase() {
        let (gpio, clock, mut wiring, _) = setup();
        let mut bus = Hd44780Bus::new(&mut wiring, &gpio, &clock);

        let before = clock.now_ns();
        bus.send_byte(false, b'A');
        assert_eq!(clock.now_ns() - before, 2 * WRITE_PULSE_PERIOD_NS);
    }
}
