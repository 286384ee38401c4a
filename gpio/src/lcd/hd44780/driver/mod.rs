use crate::lcd::hd44780::{LcdError, LcdResult};
use log::warn;
use std::fmt::Debug;

/// DDRAM address of the first character of the second line.
pub const SECOND_LINE_ADDRESS: u8 = 0x40;

pub trait HD44780Driver: Debug {
    /// Runs the reset and initialization sequence, leaving the display cleared, on, with the
    /// cursor hidden and incrementing.
    fn init(&mut self) -> LcdResult<()>;

    /// Clears the display and sets the cursor to the home position.
    fn clear_display(&mut self) -> LcdResult<()> {
        self.send_command(0b00000001)
    }

    /// Sets the cursor to the home position.
    fn return_home(&mut self) -> LcdResult<()> {
        self.send_command(0b00000010)
    }

    /// Sets the display to the specified entry mode.
    fn set_entry_mode(&mut self, cursor_direction: CursorDirection, shift: bool) -> LcdResult<()> {
        let mut command = 0b00000100;
        if cursor_direction == CursorDirection::Right {
            command |= 0b00000010;
        }
        if shift {
            command |= 0b00000001;
        }
        self.send_command(command)
    }

    /// Sets the display on/off, cursor on/off, and blinking on/off.
    fn set_display_control(
        &mut self,
        display_on: bool,
        cursor_on: bool,
        blink_on: bool,
    ) -> LcdResult<()> {
        let mut command = 0b00001000;
        if display_on {
            command |= 0b00000100;
        }
        if cursor_on {
            command |= 0b00000010;
        }
        if blink_on {
            command |= 0b00000001;
        }
        self.send_command(command)
    }

    /// Moves the cursor or shifts the display.
    fn cursor_shift(&mut self, display_shift: bool, direction: CursorDirection) -> LcdResult<()> {
        let mut command = 0b00010000;
        if display_shift {
            command |= 0b00001000;
        }
        if direction == CursorDirection::Right {
            command |= 0b00000100;
        }
        self.send_command(command)
    }

    /// Sets the function set. The data length bit is never set, the bus stays 4 bits wide.
    fn function_set(&mut self, two_lines: bool, large_font: bool) -> LcdResult<()> {
        let mut command = 0b00100000;
        if two_lines {
            command |= 0b00001000;
        }
        if large_font {
            command |= 0b00000100;
        }
        self.send_command(command)
    }

    /// Sets the CGRAM address.
    fn set_cgram_address(&mut self, address: u8) -> LcdResult<()> {
        if address > 0b00111111 {
            return Err(LcdError::InvalidArgument(address as u32));
        }
        let command = 0b01000000 | address;
        self.send_command(command)
    }

    /// Sets the DDRAM address.
    fn set_ddram_address(&mut self, address: u8) -> LcdResult<()> {
        if address > 0b01111111 {
            return Err(LcdError::InvalidArgument(address as u32));
        }
        let command = 0b10000000 | address;
        self.send_command(command)
    }

    /// Reads the busy flag and address counter.
    fn get_busy_flag_and_address(&mut self) -> LcdResult<(bool, u8)> {
        let command = self.read_command()?;
        let busy_flag = command & 0b10000000 != 0;
        let address = command & 0b01111111;
        Ok((busy_flag, address))
    }

    /// Writes ASCII text at the cursor. Anything else is replaced by `?`.
    fn print(&mut self, text: &str) -> LcdResult<()> {
        for c in text.chars() {
            if c.is_ascii() {
                self.send_data(c as u8)?;
            } else {
                warn!("Non-ASCII character: {}", c);
                self.send_data(b'?')?;
            }
        }
        Ok(())
    }

    // Low-level commands
    // These are implemented by the driver and used by the high-level functions above.

    /// Sends a command to the HD44780 controller once it is ready.
    /// Sets the RS pin to 0 (command).
    fn send_command(&mut self, command: u8) -> LcdResult<()>;

    /// Sends data to the HD44780 controller once it is ready.
    /// Sets the RS pin to 1 (data).
    fn send_data(&mut self, data: u8) -> LcdResult<()>;

    /// Reads the busy flag and address counter, without waiting.
    /// Sets the RS pin to 0 (command).
    ///
    /// Returns both in a single u8, for easier usage use [Self::get_busy_flag_and_address], which
    /// uses this function internally.
    fn read_command(&mut self) -> LcdResult<u8>;

    /// Reads data at the address counter once the controller is ready.
    /// Sets the RS pin to 1 (data).
    fn read_data(&mut self) -> LcdResult<u8>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CursorDirection {
    /// Moves the cursor to the left after writing/reading data.
    Left,
    /// Moves the cursor to the right after writing/reading data.
    Right,
}
