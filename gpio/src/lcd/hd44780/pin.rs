use crate::{GpioActiveLevel, GpioDirection, GpioError, GpioLines};
use log::{trace, warn};
use serde::Deserialize;
use std::fmt::{Debug, Formatter};

/// One physical line taking part in a logical signal.
///
/// A pin whose line failed once (request, direction change, read or write) loses its line and is
/// skipped from then on, but stays in its chain.
#[derive(Clone, Deserialize)]
pub struct LogicalPin {
    line: Option<u32>,
    #[serde(default)]
    active_level: GpioActiveLevel,
    #[serde(default)]
    label: String,
    #[serde(skip)]
    direction: Option<GpioDirection>,
}

impl LogicalPin {
    pub fn new(line: u32, label: impl Into<String>) -> Self {
        LogicalPin {
            line: Some(line),
            active_level: GpioActiveLevel::High,
            label: label.into(),
            direction: None,
        }
    }

    /// A placeholder pin that is never driven.
    pub fn unavailable(label: impl Into<String>) -> Self {
        LogicalPin {
            line: None,
            ..Self::new(0, label)
        }
    }

    pub fn with_active_level(mut self, level: GpioActiveLevel) -> Self {
        self.active_level = level;
        self
    }

    pub fn active_low(self) -> Self {
        self.with_active_level(GpioActiveLevel::Low)
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn active_level(&self) -> GpioActiveLevel {
        self.active_level
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_available(&self) -> bool {
        self.line.is_some()
    }

    fn disable(&mut self, what: &str, err: GpioError) {
        if let Some(line) = self.line.take() {
            warn!(
                "{} of gpio {}({}) failed, skipping it from now on: {}",
                what, self.label, line, err
            );
        }
        self.direction = None;
    }

    /// Claims the line and puts it in its idle state: outputs at the inactive level, inputs
    /// floating.
    pub fn request(&mut self, gpio: &dyn GpioLines, direction: GpioDirection) {
        let Some(line) = self.line else { return };

        if let Err(err) = gpio.request_line(line, &self.label) {
            self.disable("Request", err);
            return;
        }

        match direction {
            GpioDirection::Output => self.drive(gpio, false),
            GpioDirection::Input => self.float(gpio),
        }
    }

    pub fn free(&mut self, gpio: &dyn GpioLines) {
        if let Some(line) = self.line {
            gpio.free_line(line);
        }
        self.direction = None;
    }

    /// `level` is the physical level an output starts at.
    fn set_direction(
        &mut self,
        gpio: &dyn GpioLines,
        direction: GpioDirection,
        level: bool,
    ) -> Option<u32> {
        let line = self.line?;
        if self.direction == Some(direction) {
            return Some(line);
        }

        let result = match direction {
            GpioDirection::Input => gpio.set_input(line),
            GpioDirection::Output => gpio.set_output(line, level),
        };
        match result {
            Ok(()) => {
                self.direction = Some(direction);
                Some(line)
            }
            Err(err) => {
                self.disable("Direction change", err);
                None
            }
        }
    }

    /// Drives the logical `value`, i.e. the physical level `value ^ active_low`.
    pub fn drive(&mut self, gpio: &dyn GpioLines, value: bool) {
        let level = self.active_level.get_state(value);
        let Some(line) = self.set_direction(gpio, GpioDirection::Output, level) else { return };

        if let Err(err) = gpio.write_line(line, level) {
            self.disable("Write", err);
        }
    }

    /// Releases the line so another party may drive it.
    pub fn float(&mut self, gpio: &dyn GpioLines) {
        self.set_direction(gpio, GpioDirection::Input, false);
    }

    /// Samples the line and returns its logical value. Unavailable pins read as inactive.
    pub fn sense(&mut self, gpio: &dyn GpioLines) -> bool {
        let Some(line) = self.line else { return false };

        match gpio.read_line(line) {
            Ok(level) => self.active_level.get_state(level),
            Err(err) => {
                self.disable("Read", err);
                false
            }
        }
    }
}

impl Debug for LogicalPin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inverted = if self.active_level == GpioActiveLevel::Low { "!" } else { "" };
        match self.line {
            Some(line) => write!(f, "{}{}({})", inverted, self.label, line),
            None => write!(f, "{}{}(-)", inverted, self.label),
        }
    }
}

/// Ordered set of pins toggled together to realize one logical signal, e.g. one E signal fanned
/// out to two displays.
#[derive(Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct PinChain {
    pins: Vec<LogicalPin>,
}

impl PinChain {
    pub fn new(pins: Vec<LogicalPin>) -> Self {
        PinChain { pins }
    }

    pub fn single(pin: LogicalPin) -> Self {
        PinChain { pins: vec![pin] }
    }

    pub fn pins(&self) -> &[LogicalPin] {
        &self.pins
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Number of pins still backed by a line.
    pub fn available(&self) -> usize {
        self.pins.iter().filter(|pin| pin.is_available()).count()
    }

    pub fn request(&mut self, gpio: &dyn GpioLines, direction: GpioDirection) {
        for pin in &mut self.pins {
            pin.request(gpio, direction);
        }
    }

    pub fn free(&mut self, gpio: &dyn GpioLines) {
        for pin in &mut self.pins {
            pin.free(gpio);
        }
    }

    pub fn drive(&mut self, gpio: &dyn GpioLines, value: bool) {
        for pin in &mut self.pins {
            pin.drive(gpio, value);
        }
    }

    pub fn float(&mut self, gpio: &dyn GpioLines) {
        for pin in &mut self.pins {
            pin.float(gpio);
        }
    }

    /// Samples a one-pin chain. An empty chain reads as inactive.
    pub fn sense(&mut self, gpio: &dyn GpioLines) -> bool {
        debug_assert!(self.pins.len() <= 1, "sensing a chain of {} pins", self.pins.len());
        let value = self.pins.first_mut().is_some_and(|pin| pin.sense(gpio));
        trace!("Sensed {:?}: {}", self, value);
        value
    }
}

impl Debug for PinChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.pins).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimGpio, SimOp};

    #[test]
    fn drive_applies_active_level() {
        let gpio = SimGpio::new();
        let mut chain = PinChain::new(vec![
            LogicalPin::new(1, "EN1"),
            LogicalPin::new(2, "EN2").active_low(),
        ]);
        chain.request(&gpio, GpioDirection::Output);

        chain.drive(&gpio, true);
        assert_eq!(gpio.level(1), Some(true));
        assert_eq!(gpio.level(2), Some(false));

        chain.drive(&gpio, false);
        assert_eq!(gpio.level(1), Some(false));
        assert_eq!(gpio.level(2), Some(true));
    }

    #[test]
    fn request_parks_outputs_inactive() {
        let gpio = SimGpio::new();
        let mut pin = LogicalPin::new(4, "^EN").active_low();
        pin.request(&gpio, GpioDirection::Output);
        assert_eq!(gpio.direction(4), Some(GpioDirection::Output));
        assert_eq!(gpio.level(4), Some(true));
    }

    #[test]
    fn denied_line_is_skipped_and_never_touched() {
        let gpio = SimGpio::new();
        gpio.deny_line(7);
        let mut chain = PinChain::new(vec![LogicalPin::new(6, "A"), LogicalPin::new(7, "B")]);

        chain.request(&gpio, GpioDirection::Output);
        chain.drive(&gpio, true);
        chain.float(&gpio);
        chain.drive(&gpio, false);

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.available(), 1);
        assert_eq!(gpio.ops_on(7), vec![SimOp::Request(7)]);
        assert!(!gpio.ops_on(6).is_empty());
    }

    #[test]
    fn failing_write_degrades_in_place() {
        let gpio = SimGpio::new();
        let mut chain = PinChain::new(vec![LogicalPin::new(1, "A"), LogicalPin::new(2, "B")]);
        chain.request(&gpio, GpioDirection::Output);
        gpio.break_line(2);

        chain.drive(&gpio, true);
        let after_break = gpio.ops_on(2).len();
        chain.drive(&gpio, false);
        chain.float(&gpio);

        assert_eq!(chain.available(), 1);
        assert_eq!(gpio.ops_on(2).len(), after_break);
        assert_eq!(gpio.direction(1), Some(GpioDirection::Input));
    }

    #[test]
    fn unavailable_placeholder_is_inert() {
        let gpio = SimGpio::new();
        let mut chain = PinChain::single(LogicalPin::unavailable("DB0"));
        chain.request(&gpio, GpioDirection::Input);
        chain.drive(&gpio, true);
        assert!(!chain.sense(&gpio));
        assert!(gpio.ops().is_empty());
    }

    #[test]
    fn sense_reads_through_active_level() {
        let gpio = SimGpio::new();
        let mut chain = PinChain::single(LogicalPin::new(3, "DB7").active_low());
        chain.request(&gpio, GpioDirection::Input);

        gpio.set_external_level(3, false);
        assert!(chain.sense(&gpio));
        gpio.set_external_level(3, true);
        assert!(!chain.sense(&gpio));
    }

    #[test]
    fn direction_changes_only_when_needed() {
        let gpio = SimGpio::new();
        let mut pin = LogicalPin::new(5, "RS");
        pin.request(&gpio, GpioDirection::Output);
        pin.drive(&gpio, true);
        pin.drive(&gpio, false);

        let direction_changes = gpio
            .ops_on(5)
            .into_iter()
            .filter(|op| matches!(op, SimOp::Direction(..)))
            .count();
        assert_eq!(direction_changes, 1);
    }

    #[test]
    fn deserializes_from_config() {
        let chain: PinChain = serde_json::from_str(
            r#"[
                { "line": 34, "active_level": "low", "label": "^EN" },
                { "line": null, "label": "EN2" }
            ]"#,
        )
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.pins()[0].line(), Some(34));
        assert_eq!(chain.pins()[0].active_level(), GpioActiveLevel::Low);
        assert!(!chain.pins()[1].is_available());
    }
}
