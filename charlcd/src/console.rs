//! Line-oriented control of one display from a text stream.
//!
//! Each line is either text, which is written at the cursor and followed by a jump to the second
//! row, or a directive:
//! - `\cmd N` sends the raw command `N` (decimal or `0x` hex),
//! - `\status` prints the busy flag and address counter,
//! - `\reset` runs the init sequence again.
//!
//! A leading `\\` writes the rest of the line as text, starting with a single backslash.

use charlcd_gpio::lcd::hd44780::driver::SECOND_LINE_ADDRESS;
use charlcd_gpio::lcd::hd44780::{ControlOp, DisplayRegistry};
use log::{debug, warn};
use std::io::{BufRead, Write};
use thiserror::Error;

const SET_DDRAM_ADDRESS: u8 = 0b10000000;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConsoleError {
    #[error("unknown directive \\{0}")]
    UnknownDirective(String),
    #[error("not a byte: {0:?}")]
    InvalidNumber(String),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ConsoleInput<'a> {
    Text(&'a str),
    Command(u8),
    Status,
    Reset,
}

fn parse_byte(s: &str) -> Result<u8, ConsoleError> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| ConsoleError::InvalidNumber(s.to_string()))
}

pub fn parse(line: &str) -> Result<ConsoleInput<'_>, ConsoleError> {
    if let Some(text) = line.strip_prefix("\\\\") {
        // Keep one of the two backslashes
        return Ok(ConsoleInput::Text(&line[line.len() - text.len() - 1..]));
    }
    let Some(directive) = line.strip_prefix('\\') else {
        return Ok(ConsoleInput::Text(line));
    };

    let (name, arg) = directive.split_once(' ').unwrap_or((directive, ""));
    match name {
        "cmd" => Ok(ConsoleInput::Command(parse_byte(arg)?)),
        "status" => Ok(ConsoleInput::Status),
        "reset" => Ok(ConsoleInput::Reset),
        _ => Err(ConsoleError::UnknownDirective(name.to_string())),
    }
}

/// Feeds `input` to display `id` until EOF. The display must be open.
///
/// Bad lines and a stalled display are reported and skipped, I/O errors end the loop.
pub fn run(
    registry: &DisplayRegistry,
    id: usize,
    input: impl BufRead,
    mut output: impl Write,
) -> eyre::Result<()> {
    for line in input.lines() {
        let line = line?;
        let parsed = match parse(&line) {
            Ok(parsed) => parsed,
            Err(err) => {
                writeln!(output, "{}", err)?;
                continue;
            }
        };
        debug!("Console input: {:?}", parsed);

        let result = match parsed {
            ConsoleInput::Text(text) => registry.write(id, text.as_bytes()).and_then(|written| {
                if written < text.len() {
                    warn!("Only {} of {} bytes reached display {}", written, text.len(), id);
                }
                registry.send_command(id, SET_DDRAM_ADDRESS | SECOND_LINE_ADDRESS)
            }),
            ConsoleInput::Command(command) => registry.send_command(id, command),
            ConsoleInput::Status => match registry.control(id, ControlOp::ReadStatus as u32, 0) {
                Ok(status) => {
                    let busy = status & 0x80 != 0;
                    writeln!(output, "busy: {}, address: {:#04x}", busy, status & 0x7F)?;
                    Ok(())
                }
                Err(err) => Err(err),
            },
            ConsoleInput::Reset => registry.reset(id),
        };

        if let Err(err) = result {
            writeln!(output, "display {}: {}", id, err)?;
        }
    }

    Ok(())
}
