use crate::lcd::hd44780::pin::{LogicalPin, PinChain};
use crate::lcd::hd44780::{LcdError, LcdResult};
use crate::{GpioDirection, GpioLines};

/// How one display is wired: E, RS and R/W chains plus the data chains DB0..DB7.
///
/// Only DB4..DB7 are used, the driver always talks to the display in 4-bit mode. DB0..DB3 stay
/// empty (or hold placeholders) so that indices match the datasheet.
#[derive(Clone, Debug, Default)]
pub struct DisplayWiring {
    pub(crate) en: PinChain,
    pub(crate) rs: PinChain,
    pub(crate) rw: PinChain,
    pub(crate) data: [PinChain; 8],
}

impl DisplayWiring {
    /// First data bit on the wire in 4-bit mode.
    pub const DATA_LOW_BIT: usize = 4;

    pub fn new(en: PinChain, rs: PinChain, rw: PinChain, data: [PinChain; 8]) -> Self {
        DisplayWiring { en, rs, rw, data }
    }

    /// Creates the wiring of a display in 4-bit mode.
    ///
    /// `data` lists DB4, DB5, DB6, DB7 in that order.
    pub fn new_4bit(en: PinChain, rs: PinChain, rw: PinChain, data: [LogicalPin; 4]) -> Self {
        let mut wiring = DisplayWiring {
            en,
            rs,
            rw,
            data: Default::default(),
        };
        for (offset, pin) in data.into_iter().enumerate() {
            wiring.data[Self::DATA_LOW_BIT + offset] = PinChain::single(pin);
        }
        wiring
    }

    pub fn en(&self) -> &PinChain {
        &self.en
    }

    pub fn rs(&self) -> &PinChain {
        &self.rs
    }

    pub fn rw(&self) -> &PinChain {
        &self.rw
    }

    /// The chain wired to data bit `bit` (0..8).
    pub fn data(&self, bit: usize) -> &PinChain {
        &self.data[bit]
    }

    /// Checks the shape of the wiring. Lines that turn out to be unusable later are fine,
    /// missing chains are not.
    pub fn validate(&self) -> LcdResult<()> {
        for (name, chain) in [("EN", &self.en), ("RS", &self.rs), ("RW", &self.rw)] {
            if chain.is_empty() {
                return Err(LcdError::InvalidWiring(format!("{} has no pins", name)));
            }
        }

        for bit in Self::DATA_LOW_BIT..8 {
            let pins = self.data[bit].len();
            if pins != 1 {
                return Err(LcdError::InvalidWiring(format!(
                    "DB{} needs exactly one pin, got {}",
                    bit, pins
                )));
            }
        }

        Ok(())
    }

    /// Claims every line: control lines as inactive outputs, data lines floating.
    pub fn request(&mut self, gpio: &dyn GpioLines) {
        self.rw.request(gpio, GpioDirection::Output);
        self.rs.request(gpio, GpioDirection::Output);
        self.en.request(gpio, GpioDirection::Output);
        for chain in &mut self.data[Self::DATA_LOW_BIT..] {
            chain.request(gpio, GpioDirection::Input);
        }
    }

    pub fn free(&mut self, gpio: &dyn GpioLines) {
        self.en.free(gpio);
        self.rs.free(gpio);
        self.rw.free(gpio);
        for chain in &mut self.data[Self::DATA_LOW_BIT..] {
            chain.free(gpio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{self, SimGpio};

    #[test]
    fn new_4bit_places_data_on_high_bits() {
        let wiring = sim::wiring_at(10);
        for bit in 0..4 {
            assert!(wiring.data(bit).is_empty());
        }
        for bit in 4..8 {
            assert_eq!(wiring.data(bit).pins()[0].line(), Some(10 + bit as u32 - 1));
        }
        assert!(wiring.validate().is_ok());
    }

    #[test]
    fn rejects_missing_control_chain() {
        let mut wiring = sim::wiring_at(0);
        wiring.rw = PinChain::default();
        assert_eq!(
            wiring.validate(),
            Err(LcdError::InvalidWiring("RW has no pins".into()))
        );
    }

    #[test]
    fn rejects_chained_data_pins() {
        let mut wiring = sim::wiring_at(0);
        wiring.data[6] =
            PinChain::new(vec![LogicalPin::new(20, "DB6"), LogicalPin::new(21, "DB6'")]);
        assert!(matches!(wiring.validate(), Err(LcdError::InvalidWiring(_))));
    }

    #[test]
    fn request_leaves_data_floating() {
        let gpio = SimGpio::new();
        let mut wiring = sim::wiring_at(0);
        wiring.request(&gpio);

        assert_eq!(gpio.direction(0), Some(GpioDirection::Output));
        assert_eq!(gpio.direction(1), Some(GpioDirection::Output));
        assert_eq!(gpio.direction(2), Some(GpioDirection::Output));
        for line in 3..7 {
            assert_eq!(gpio.direction(line), Some(GpioDirection::Input));
        }

        wiring.free(&gpio);
        assert!(!gpio.is_requested(0));
    }
}
