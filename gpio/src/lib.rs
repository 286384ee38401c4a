pub mod clock;
pub mod gpiod;
pub mod lcd;
pub mod sim;

use serde::Deserialize;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum GpioError {
    #[error("line already in use")]
    AlreadyInUse,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("line {0} was not requested")]
    NotRequested(u32),
    #[error("IO error: {0}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for GpioError {
    fn from(err: std::io::Error) -> Self {
        GpioError::Io(err.kind())
    }
}

pub type GpioResult<T> = Result<T, GpioError>;

/// Specifies the active level of a logical signal.
///
/// By default, the active level is high.
///
/// Software-implemented: the physical level written to the line is the logical value run
/// through [GpioActiveLevel::get_state].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioActiveLevel {
    #[default] High,
    Low,
}

impl GpioActiveLevel {
    /// Gets the real state that will be outputted on the GPIO pin based on the active level and
    /// the value.
    ///
    /// The mapping is its own inverse, so it also converts a sampled physical level back to the
    /// logical value.
    pub fn get_state(&self, value: bool) -> bool {
        match self {
            GpioActiveLevel::High => value,
            GpioActiveLevel::Low => !value,
        }
    }
}

/// Direction of a single GPIO line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GpioDirection {
    /// The line is released (high impedance) and can be sampled.
    Input,
    /// The line is driven by us.
    Output,
}

/// Line-level GPIO capability consumed by the LCD driver.
///
/// Lines are addressed by their offset on the chip. Every operation may fail; callers in this
/// crate treat a failure as "this line is gone" rather than as a fatal error.
///
/// Implementations must be shareable between threads, since one chip usually backs several
/// displays that are driven from different callers.
pub trait GpioLines: Debug + Send + Sync {
    /// Claims the line for exclusive use, tagging it with a human readable label.
    fn request_line(&self, line: u32, label: &str) -> GpioResult<()>;

    /// Releases a requested line so it can be sampled.
    fn set_input(&self, line: u32) -> GpioResult<()>;

    /// Turns a requested line into an output, driving `level` from the first moment on.
    fn set_output(&self, line: u32, level: bool) -> GpioResult<()>;

    /// Writes the physical level of an output line.
    fn write_line(&self, line: u32, value: bool) -> GpioResult<()>;

    /// Reads the physical level of a line.
    fn read_line(&self, line: u32) -> GpioResult<bool>;

    /// Gives a previously requested line back.
    fn free_line(&self, _line: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_level_inverts_only_when_low() {
        assert!(GpioActiveLevel::High.get_state(true));
        assert!(!GpioActiveLevel::High.get_state(false));
        assert!(!GpioActiveLevel::Low.get_state(true));
        assert!(GpioActiveLevel::Low.get_state(false));
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err: GpioError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert_eq!(err, GpioError::Io(std::io::ErrorKind::PermissionDenied));
    }
}
