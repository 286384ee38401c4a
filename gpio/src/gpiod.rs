//! [GpioLines] backed by a Linux GPIO character device, using the gpiod library.
//!
//! The character device API has no direction switch on a held request, so changing the
//! direction of a line drops its request and makes a new one with the new direction.
use crate::{GpioError, GpioLines, GpioResult};
use bitvec::vec::BitVec;
use log::{debug, trace};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::Path;
use std::sync::atomic::AtomicU8;
use std::sync::{Mutex, MutexGuard, PoisonError};

enum Handle {
    /// Claimed, but not requested from the kernel until a direction is set.
    Reserved,
    Input(gpiod::Lines<gpiod::Input>),
    Output(gpiod::Lines<gpiod::Output>),
}

struct LineState {
    label: String,
    handle: Handle,
}

/// One GPIO chip, e.g. `/dev/gpiochip0`.
pub struct GpiodLines {
    chip: gpiod::Chip,
    used_lines: BitVec<AtomicU8>,
    lines: Mutex<HashMap<u32, LineState>>,
}

impl GpiodLines {
    pub fn new(chip: gpiod::Chip) -> Self {
        let n = chip.num_lines() as usize;
        let bits = BitVec::repeat(false, n);
        Self {
            chip,
            used_lines: bits,
            lines: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> GpioResult<Self> {
        let chip = gpiod::Chip::new(path.as_ref())?;
        debug!("Opened GPIO chip {} with {} lines", chip.name(), chip.num_lines());
        Ok(Self::new(chip))
    }

    pub fn count(&self) -> usize {
        self.chip.num_lines() as usize
    }

    fn lines(&self) -> MutexGuard<'_, HashMap<u32, LineState>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Debug for GpiodLines {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GpiodLines({})", self.chip.name())
    }
}

impl GpioLines for GpiodLines {
    fn request_line(&self, line: u32, label: &str) -> GpioResult<()> {
        let index = line as usize;
        if index >= self.count() {
            return Err(GpioError::InvalidArgument);
        }

        if self.used_lines[index] {
            return Err(GpioError::AlreadyInUse);
        }

        let label = if label.is_empty() { env!("CARGO_PKG_NAME") } else { label };
        self.used_lines.set_aliased(index, true);
        self.lines().insert(
            line,
            LineState {
                label: label.to_string(),
                handle: Handle::Reserved,
            },
        );
        trace!("Reserved line {} as {}", line, label);
        Ok(())
    }

    fn set_input(&self, line: u32) -> GpioResult<()> {
        let mut lines = self.lines();
        let state = lines.get_mut(&line).ok_or(GpioError::NotRequested(line))?;
        if let Handle::Input(_) = state.handle {
            return Ok(());
        }

        // The old request has to go before the kernel hands out a new one
        state.handle = Handle::Reserved;
        let input = self
            .chip
            .request_lines(gpiod::Options::input([line]).consumer(state.label.as_str()))?;
        state.handle = Handle::Input(input);
        Ok(())
    }

    fn set_output(&self, line: u32, level: bool) -> GpioResult<()> {
        let mut lines = self.lines();
        let state = lines.get_mut(&line).ok_or(GpioError::NotRequested(line))?;
        if let Handle::Output(output) = &state.handle {
            output.set_values([level])?;
            return Ok(());
        }

        state.handle = Handle::Reserved;
        let output = self.chip.request_lines(
            gpiod::Options::output([line])
                .values([level])
                .consumer(state.label.as_str()),
        )?;
        state.handle = Handle::Output(output);
        Ok(())
    }

    fn write_line(&self, line: u32, value: bool) -> GpioResult<()> {
        let lines = self.lines();
        let state = lines.get(&line).ok_or(GpioError::NotRequested(line))?;
        let Handle::Output(output) = &state.handle else {
            return Err(GpioError::InvalidArgument);
        };
        output.set_values([value])?;
        Ok(())
    }

    fn read_line(&self, line: u32) -> GpioResult<bool> {
        let lines = self.lines();
        let state = lines.get(&line).ok_or(GpioError::NotRequested(line))?;
        match &state.handle {
            Handle::Input(input) => Ok(input.get_values([false])?[0]),
            Handle::Output(output) => Ok(output.get_values([false])?[0]),
            Handle::Reserved => Err(GpioError::InvalidArgument),
        }
    }

    fn free_line(&self, line: u32) {
        if self.lines().remove(&line).is_some() {
            self.used_lines.set_aliased(line as usize, false);
            trace!("Freed line {}", line);
        }
    }
}
