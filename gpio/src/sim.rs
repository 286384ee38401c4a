//! In-process stand-ins for the GPIO chip and the clock.
//!
//! [SimGpio] keeps the state of every line and can emulate HD44780 controllers hanging off
//! them: nibbles are latched on falling E edges, the 8-bit/4-bit interface mode is tracked, and
//! status/data reads are answered from the busy flag, address counter and DDRAM. [SimClock] is a
//! virtual clock that only moves when something sleeps or yields.
//!
//! Used by the tests and by dry runs of the front end.

use crate::clock::Clock;
use crate::lcd::hd44780::bus::BUSY_FLAG;
use crate::lcd::hd44780::pin::{LogicalPin, PinChain};
use crate::lcd::hd44780::wiring::DisplayWiring;
use crate::{GpioActiveLevel, GpioDirection, GpioError, GpioLines, GpioResult};
use log::trace;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Wiring used throughout the tests: `^EN` (active low) on `base`, RS on `base + 1`, R/W on
/// `base + 2` and DB4..DB7 on `base + 3..base + 7`.
pub fn wiring_at(base: u32) -> DisplayWiring {
    DisplayWiring::new_4bit(
        PinChain::single(LogicalPin::new(base, "^EN").active_low()),
        PinChain::single(LogicalPin::new(base + 1, "RS")),
        PinChain::single(LogicalPin::new(base + 2, "RW")),
        [
            LogicalPin::new(base + 3, "DB4"),
            LogicalPin::new(base + 4, "DB5"),
            LogicalPin::new(base + 5, "DB6"),
            LogicalPin::new(base + 6, "DB7"),
        ],
    )
}

/// A call made on [SimGpio], recorded even when it fails.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimOp {
    Request(u32),
    Direction(u32, GpioDirection),
    Write(u32, bool),
    Read(u32),
    Free(u32),
}

impl SimOp {
    pub fn line(&self) -> u32 {
        match *self {
            SimOp::Request(line)
            | SimOp::Direction(line, _)
            | SimOp::Write(line, _)
            | SimOp::Read(line)
            | SimOp::Free(line) => line,
        }
    }
}

/// What an emulated controller saw on its bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimEvent {
    /// A nibble latched while the controller was in 8-bit mode.
    Nibble { command: bool, value: u8 },
    /// A full byte latched in 4-bit mode.
    Byte { command: bool, value: u8 },
    /// A completed two-pulse read, status when `command` is set.
    Read { command: bool, value: u8 },
}

#[derive(Debug, Default)]
struct SimLine {
    requested: bool,
    direction: Option<GpioDirection>,
    level: bool,
    external: bool,
}

impl SimLine {
    fn physical(&self) -> bool {
        match self.direction {
            Some(GpioDirection::Output) => self.level,
            _ => self.external,
        }
    }
}

type Tap = (u32, GpioActiveLevel);

#[derive(Debug)]
struct SimDisplay {
    en: Option<Tap>,
    rs: Option<Tap>,
    rw: Option<Tap>,
    data: [Option<Tap>; 4],

    en_level: bool,
    four_bit: bool,
    pending: Option<u8>,
    read_phase: u8,
    read_value: u8,
    read_command: bool,
    output: Option<u8>,

    ddram: [u8; 128],
    address: u8,
    stuck_busy: bool,
    busy_reads: u32,
    busy_remaining: u32,
    busy_after_writes: Option<u32>,

    record: bool,
    events: Vec<SimEvent>,
    contentions: usize,
}

fn first_tap(chain: &PinChain) -> Option<Tap> {
    chain
        .pins()
        .iter()
        .find_map(|pin| pin.line().map(|line| (line, pin.active_level())))
}

impl SimDisplay {
    fn new(wiring: &DisplayWiring, record: bool) -> Self {
        SimDisplay {
            en: first_tap(wiring.en()),
            rs: first_tap(wiring.rs()),
            rw: first_tap(wiring.rw()),
            data: std::array::from_fn(|i| first_tap(wiring.data(DisplayWiring::DATA_LOW_BIT + i))),
            en_level: false,
            four_bit: false,
            pending: None,
            read_phase: 0,
            read_value: 0,
            read_command: false,
            output: None,
            ddram: [b' '; 128],
            address: 0,
            stuck_busy: false,
            busy_reads: 0,
            busy_remaining: 0,
            busy_after_writes: None,
            record,
            events: Vec::new(),
            contentions: 0,
        }
    }

    /// Logical level of a control signal. Lines the host does not drive read as inactive.
    fn control(tap: Option<Tap>, lines: &HashMap<u32, SimLine>) -> bool {
        let Some((line, active_level)) = tap else { return false };
        match lines.get(&line) {
            Some(state) if state.requested && state.direction == Some(GpioDirection::Output) => {
                active_level.get_state(state.level)
            }
            _ => false,
        }
    }

    fn data_nibble(&self, lines: &HashMap<u32, SimLine>) -> u8 {
        let mut nibble = 0;
        for (bit, tap) in self.data.iter().enumerate() {
            if let Some((line, active_level)) = tap {
                let physical = lines.get(line).is_some_and(SimLine::physical);
                if active_level.get_state(physical) {
                    nibble |= 1 << bit;
                }
            }
        }
        nibble
    }

    fn drives_data(&self, lines: &HashMap<u32, SimLine>) -> bool {
        self.data.iter().flatten().any(|(line, _)| {
            lines
                .get(line)
                .is_some_and(|state| state.direction == Some(GpioDirection::Output))
        })
    }

    fn is_busy(&self) -> bool {
        self.stuck_busy || self.busy_remaining > 0
    }

    /// Physical level the controller puts on `line`, if it is driving it.
    fn output_level(&self, line: u32) -> Option<bool> {
        let nibble = self.output?;
        self.data.iter().enumerate().find_map(|(bit, tap)| match tap {
            Some((tap_line, active_level)) if *tap_line == line => {
                Some(active_level.get_state((nibble >> bit) & 1 == 1))
            }
            _ => None,
        })
    }

    fn update(&mut self, lines: &HashMap<u32, SimLine>) {
        let en = Self::control(self.en, lines);
        if en == self.en_level {
            return;
        }
        self.en_level = en;

        let rs = Self::control(self.rs, lines);
        let rw = Self::control(self.rw, lines);

        match (en, rw) {
            (true, true) => self.start_read_pulse(!rs, lines),
            (false, _) if self.output.is_some() => self.end_read_pulse(),
            (false, false) => {
                let nibble = self.data_nibble(lines);
                self.latch(!rs, nibble);
            }
            _ => {}
        }
    }

    fn start_read_pulse(&mut self, command: bool, lines: &HashMap<u32, SimLine>) {
        if self.read_phase == 0 {
            self.read_command = command;
            self.read_value = if command {
                let busy = if self.is_busy() { BUSY_FLAG } else { 0 };
                busy | self.address
            } else {
                self.ddram[self.address as usize]
            };
        }

        self.output = Some(if self.read_phase == 0 {
            self.read_value >> 4
        } else {
            self.read_value & 0x0F
        });

        if self.drives_data(lines) {
            self.contentions += 1;
        }
    }

    fn end_read_pulse(&mut self) {
        self.output = None;
        self.read_phase += 1;
        if self.read_phase < 2 {
            return;
        }

        self.read_phase = 0;
        self.push(SimEvent::Read {
            command: self.read_command,
            value: self.read_value,
        });
        if self.read_command {
            self.busy_remaining = self.busy_remaining.saturating_sub(1);
        } else {
            self.address = (self.address + 1) & 0x7F;
        }
    }

    fn push(&mut self, event: SimEvent) {
        if self.record {
            self.events.push(event);
        }
    }

    fn latch(&mut self, command: bool, nibble: u8) {
        trace!("Simulated display latched {:04b}, command: {}", nibble, command);
        self.read_phase = 0;

        if !self.four_bit {
            self.push(SimEvent::Nibble { command, value: nibble });
            if command {
                self.execute(nibble << 4);
            } else {
                self.write_ddram(nibble << 4);
            }
        } else if let Some(high) = self.pending.take() {
            let value = (high << 4) | nibble;
            self.push(SimEvent::Byte { command, value });
            if command {
                self.execute(value);
            } else {
                self.write_ddram(value);
            }
        } else {
            self.pending = Some(nibble);
            return;
        }

        self.busy_remaining = self.busy_reads;
    }

    fn execute(&mut self, command: u8) {
        match command {
            0x01 => {
                self.ddram = [b' '; 128];
                self.address = 0;
            }
            0x02..=0x03 => self.address = 0,
            0x20..=0x3F => {
                self.four_bit = command & 0x10 == 0;
                self.pending = None;
            }
            0x80..=0xFF => self.address = command & 0x7F,
            _ => {}
        }
    }

    fn write_ddram(&mut self, value: u8) {
        self.ddram[self.address as usize] = value;
        self.address = (self.address + 1) & 0x7F;

        if let Some(left) = self.busy_after_writes.as_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                self.busy_after_writes = None;
                self.stuck_busy = true;
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    quiet: bool,
    lines: HashMap<u32, SimLine>,
    denied: HashSet<u32>,
    broken: HashSet<u32>,
    ops: Vec<SimOp>,
    displays: Vec<SimDisplay>,
}

impl SimState {
    fn line(&mut self, line: u32) -> GpioResult<&mut SimLine> {
        if self.broken.contains(&line) {
            return Err(GpioError::Io(std::io::ErrorKind::BrokenPipe));
        }
        match self.lines.get_mut(&line) {
            Some(state) if state.requested => Ok(state),
            _ => Err(GpioError::NotRequested(line)),
        }
    }

    fn record(&mut self, op: SimOp) {
        if !self.quiet {
            self.ops.push(op);
        }
    }

    fn check_contention(&mut self, line: u32) {
        for display in &mut self.displays {
            if display.output_level(line).is_some() {
                display.contentions += 1;
            }
        }
    }

    fn update_displays(&mut self) {
        let SimState { lines, displays, .. } = self;
        for display in displays {
            display.update(lines);
        }
    }
}

/// Simulated GPIO chip, optionally with HD44780 controllers attached.
#[derive(Debug, Default)]
pub struct SimGpio {
    state: Mutex<SimState>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chip that keeps no history: [SimGpio::ops] and [SimGpio::events] stay empty.
    ///
    /// For long-running sessions, where the history would only grow.
    pub fn quiet() -> Self {
        let gpio = Self::default();
        gpio.state().quiet = true;
        gpio
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes requests of `line` fail, as if someone else owned it.
    pub fn deny_line(&self, line: u32) {
        self.state().denied.insert(line);
    }

    /// Makes every later direction change, read and write of `line` fail.
    pub fn break_line(&self, line: u32) {
        self.state().broken.insert(line);
    }

    /// Level seen on `line` while nobody drives it.
    pub fn set_external_level(&self, line: u32, level: bool) {
        self.state().lines.entry(line).or_default().external = level;
    }

    pub fn ops(&self) -> Vec<SimOp> {
        self.state().ops.clone()
    }

    pub fn ops_on(&self, line: u32) -> Vec<SimOp> {
        self.state()
            .ops
            .iter()
            .copied()
            .filter(|op| op.line() == line)
            .collect()
    }

    pub fn is_requested(&self, line: u32) -> bool {
        self.state().lines.get(&line).is_some_and(|state| state.requested)
    }

    pub fn direction(&self, line: u32) -> Option<GpioDirection> {
        self.state().lines.get(&line).and_then(|state| state.direction)
    }

    /// Last level written to `line`, if it was ever requested.
    pub fn level(&self, line: u32) -> Option<bool> {
        self.state()
            .lines
            .get(&line)
            .filter(|state| state.requested)
            .map(|state| state.level)
    }

    /// Emulates a controller on the lines of `wiring` and returns its index. The controller
    /// starts in 8-bit mode, as after power-up.
    pub fn attach_display(&self, wiring: &DisplayWiring) -> usize {
        let mut state = self.state();
        let mut display = SimDisplay::new(wiring, !state.quiet);
        display.en_level = SimDisplay::control(display.en, &state.lines);
        state.displays.push(display);
        state.displays.len() - 1
    }

    pub fn display_count(&self) -> usize {
        self.state().displays.len()
    }

    fn with_display<R>(&self, display: usize, f: impl FnOnce(&mut SimDisplay) -> R) -> R {
        f(&mut self.state().displays[display])
    }

    pub fn events(&self, display: usize) -> Vec<SimEvent> {
        self.with_display(display, |d| d.events.clone())
    }

    pub fn clear_events(&self, display: usize) {
        self.with_display(display, |d| d.events.clear());
    }

    pub fn is_four_bit(&self, display: usize) -> bool {
        self.with_display(display, |d| d.four_bit)
    }

    pub fn set_four_bit(&self, display: usize, four_bit: bool) {
        self.with_display(display, |d| {
            d.four_bit = four_bit;
            d.pending = None;
        });
    }

    /// Keeps the busy flag set until cleared again.
    pub fn set_stuck_busy(&self, display: usize, busy: bool) {
        self.with_display(display, |d| d.stuck_busy = busy);
    }

    /// Sets the busy flag for good once `writes` more data bytes have been latched.
    pub fn set_busy_after_writes(&self, display: usize, writes: u32) {
        self.with_display(display, |d| d.busy_after_writes = Some(writes));
    }

    /// Number of status reads that report busy after each completed write.
    pub fn set_busy_reads(&self, display: usize, reads: u32) {
        self.with_display(display, |d| d.busy_reads = reads);
    }

    /// Times the host drove a data line while the controller was driving it too.
    pub fn contentions(&self, display: usize) -> usize {
        self.with_display(display, |d| d.contentions)
    }

    /// Text of display row `row` (0 or 1), without trailing blanks.
    pub fn ddram_line(&self, display: usize, row: usize) -> String {
        self.with_display(display, |d| {
            let start = row * 0x40;
            String::from_utf8_lossy(&d.ddram[start..start + 40])
                .trim_end()
                .to_string()
        })
    }
}

impl GpioLines for SimGpio {
    fn request_line(&self, line: u32, _label: &str) -> GpioResult<()> {
        let mut state = self.state();
        state.record(SimOp::Request(line));
        if state.denied.contains(&line) {
            return Err(GpioError::AlreadyInUse);
        }

        let entry = state.lines.entry(line).or_default();
        if entry.requested {
            return Err(GpioError::AlreadyInUse);
        }
        entry.requested = true;
        Ok(())
    }

    fn set_input(&self, line: u32) -> GpioResult<()> {
        let mut state = self.state();
        state.record(SimOp::Direction(line, GpioDirection::Input));
        state.line(line)?.direction = Some(GpioDirection::Input);
        state.update_displays();
        Ok(())
    }

    fn set_output(&self, line: u32, level: bool) -> GpioResult<()> {
        let mut state = self.state();
        state.record(SimOp::Direction(line, GpioDirection::Output));
        let entry = state.line(line)?;
        entry.direction = Some(GpioDirection::Output);
        entry.level = level;
        state.check_contention(line);
        state.update_displays();
        Ok(())
    }

    fn write_line(&self, line: u32, value: bool) -> GpioResult<()> {
        let mut state = self.state();
        state.record(SimOp::Write(line, value));
        let entry = state.line(line)?;
        if entry.direction != Some(GpioDirection::Output) {
            return Err(GpioError::InvalidArgument);
        }
        entry.level = value;
        state.update_displays();
        Ok(())
    }

    fn read_line(&self, line: u32) -> GpioResult<bool> {
        let mut state = self.state();
        state.record(SimOp::Read(line));
        let level = state.line(line)?.physical();
        let driven = state
            .displays
            .iter()
            .find_map(|display| display.output_level(line));
        Ok(driven.unwrap_or(level))
    }

    fn free_line(&self, line: u32) {
        let mut state = self.state();
        state.record(SimOp::Free(line));
        if let Some(entry) = state.lines.get_mut(&line) {
            entry.requested = false;
            entry.direction = None;
        }
        state.update_displays();
    }
}

#[derive(Debug)]
struct SimClockState {
    now: Duration,
    yield_step: Duration,
    short_sleeps: usize,
    long_sleeps: usize,
    yields: usize,
}

/// Virtual [Clock]: sleeping advances it by exactly the requested time, yielding by a fixed step.
#[derive(Debug)]
pub struct SimClock {
    state: Mutex<SimClockState>,
}

impl SimClock {
    pub const DEFAULT_YIELD_STEP: Duration = Duration::from_micros(20);

    pub fn new() -> Self {
        Self::with_yield_step(Self::DEFAULT_YIELD_STEP)
    }

    pub fn with_yield_step(yield_step: Duration) -> Self {
        SimClock {
            state: Mutex::new(SimClockState {
                now: Duration::ZERO,
                yield_step,
                short_sleeps: 0,
                long_sleeps: 0,
                yields: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now_ns(&self) -> u64 {
        self.state().now.as_nanos() as u64
    }

    /// Sleeps shorter than a millisecond (pulse holds, settle delays).
    pub fn short_sleeps(&self) -> usize {
        self.state().short_sleeps
    }

    /// Sleeps of a millisecond or more.
    pub fn long_sleeps(&self) -> usize {
        self.state().long_sleeps
    }

    pub fn yields(&self) -> usize {
        self.state().yields
    }

    pub fn reset_counters(&self) {
        let mut state = self.state();
        state.short_sleeps = 0;
        state.long_sleeps = 0;
        state.yields = 0;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        self.state().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state();
        state.now += duration;
        if duration >= Duration::from_millis(1) {
            state.long_sleeps += 1;
        } else {
            state.short_sleeps += 1;
        }
    }

    fn yield_now(&self) {
        let mut state = self.state();
        let step = state.yield_step;
        state.now += step;
        state.yields += 1;
    }
}
