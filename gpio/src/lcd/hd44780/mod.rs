//! HD44780 LCD module.
//!
//! Drives HD44780-compatible character displays through plain GPIO lines, using the 4-bit
//! interface (DB4..DB7) plus the E, RS and R/W control lines. R/W must be wired, since every
//! transfer waits for the busy flag instead of relying on worst-case delays.
//!
//! The layers, from the wire up:
//! - [pin]: logical pins and pin chains (several physical lines acting as one signal),
//! - [wiring]: the full set of chains of one display,
//! - [bus]: nibble framing with E pulses,
//! - [session]: busy-flag polling, timeouts and the reset/init sequence,
//! - [registry]: the table of bound displays and the byte-stream/command interface.

pub mod bus;
pub mod driver;
pub mod pin;
pub mod registry;
pub mod session;
pub mod wiring;

pub use pin::{LogicalPin, PinChain};
pub use registry::{ControlOp, DisplayRegistry, Greeting};
pub use session::DisplaySession;
pub use wiring::DisplayWiring;

use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum LcdError {
    /// The busy flag never cleared, nothing was written.
    #[error("busy flag not responding")]
    Stalled,
    #[error("display is busy")]
    Busy,
    #[error("no free display slot")]
    NoCapacity,
    #[error("no display registered with id {0}")]
    InvalidId(usize),
    #[error("display {0} not found")]
    NotFound(usize),
    #[error("display {0} is not open")]
    NotOpen(usize),
    #[error("unsupported control op {0}")]
    InvalidCommand(u32),
    #[error("invalid argument: {0:#x}")]
    InvalidArgument(u32),
    #[error("invalid wiring: {0}")]
    InvalidWiring(String),
}

pub type LcdResult<T> = Result<T, LcdError>;
