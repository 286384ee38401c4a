use crate::clock::Clock;
use crate::lcd::hd44780::bus::{BUSY_FLAG, Hd44780Bus};
use crate::lcd::hd44780::driver::{CursorDirection, HD44780Driver};
use crate::lcd::hd44780::wiring::DisplayWiring;
use crate::lcd::hd44780::{LcdError, LcdResult};
use crate::GpioLines;
use log::{debug, error};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// How long the busy flag may stay set before a transfer is given up.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(50);
/// Polls within this window only yield, later ones sleep a full millisecond.
pub const FAST_POLL_WINDOW: Duration = Duration::from_millis(1);
/// The slowest command (clear/home) is done after this long.
pub const COMMAND_SETTLE: Duration = Duration::from_millis(5);
/// Data writes are done after this long.
///
/// The datasheet figure is around 40 us and older notes said 200 us; 1 ms is what the driver has
/// always used.
pub const DATA_SETTLE: Duration = Duration::from_millis(1);
/// 4-bit interface, 2 lines, 5x8 font.
pub const FUNCTION_SET_4BIT_2LINE: u8 = 0x28;

// Resync delays: datasheet minimum plus 50%
const SYNC_FIRST_SETTLE_US: u64 = 7_500;
const SYNC_SETTLE_US: u64 = 300;

/// One display bound to its wiring.
///
/// All transfers except [DisplaySession::recv_only] first wait for the busy flag to clear, which
/// may block the calling thread for up to [BUSY_TIMEOUT].
pub struct DisplaySession {
    wiring: DisplayWiring,
    gpio: Arc<dyn GpioLines>,
    clock: Arc<dyn Clock>,
    init_cmd: u8,
    busy_until: Duration,
    stalled: bool,
    attached: bool,
}

impl DisplaySession {
    /// Validates the wiring and claims its lines. The display itself is not touched.
    pub fn attach(
        mut wiring: DisplayWiring,
        gpio: Arc<dyn GpioLines>,
        clock: Arc<dyn Clock>,
    ) -> LcdResult<Self> {
        wiring.validate()?;
        wiring.request(&*gpio);
        debug!("Attached display {:?}", wiring);

        Ok(DisplaySession {
            wiring,
            gpio,
            clock,
            init_cmd: FUNCTION_SET_4BIT_2LINE,
            busy_until: Duration::ZERO,
            stalled: false,
            attached: true,
        })
    }

    /// Hands every line back.
    pub fn detach(&mut self) {
        self.wiring.free(&*self.gpio);
        self.attached = false;
        debug!("Detached display {:?}", self.wiring);
    }

    fn bus(&mut self) -> Hd44780Bus<'_> {
        Hd44780Bus::new(&mut self.wiring, &*self.gpio, &*self.clock)
    }

    /// False once [DisplaySession::detach] gave the lines back.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn wiring(&self) -> &DisplayWiring {
        &self.wiring
    }

    /// The function set command the last init used.
    pub fn init_command(&self) -> u8 {
        self.init_cmd
    }

    /// Clock time after which the last transfer is guaranteed done.
    ///
    /// Recorded for callers that want to skip polling; [DisplaySession::send] always polls.
    pub fn busy_until(&self) -> Duration {
        self.busy_until
    }

    /// Whether the last busy wait timed out.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    fn wait_busy(&mut self) -> LcdResult<()> {
        let start = self.clock.now();

        loop {
            let elapsed = self.clock.now().saturating_sub(start);
            let status = self.bus().recv_byte(true);
            if status & BUSY_FLAG == 0 {
                return Ok(());
            }

            if elapsed >= BUSY_TIMEOUT {
                error!("Busy flag not responding after {:?}", elapsed);
                self.stalled = true;
                return Err(LcdError::Stalled);
            }

            if elapsed >= FAST_POLL_WINDOW {
                self.clock.sleep_ms(1);
            } else {
                self.clock.yield_now();
            }
        }
    }

    /// Waits for the controller, then writes one command or data byte.
    pub fn send(&mut self, is_command: bool, data: u8) -> LcdResult<()> {
        self.wait_busy()?;
        self.stalled = false;

        self.bus().send_byte(is_command, data);

        let settle = if is_command { COMMAND_SETTLE } else { DATA_SETTLE };
        self.busy_until = self.clock.now() + settle;
        Ok(())
    }

    /// Reads the busy flag and address counter right away.
    pub fn recv_only(&mut self) -> u8 {
        self.bus().recv_byte(true)
    }

    /// Forces the controller into 4-bit mode whatever state it is in, then applies the function
    /// set. The busy flag cannot be trusted until this is done.
    pub fn sync(&mut self) -> LcdResult<()> {
        debug!("Synchronizing display");
        let clock = self.clock.clone();
        let mut bus = self.bus();

        bus.select(true, false);
        bus.send_nibble(0x3);
        clock.sleep_us(SYNC_FIRST_SETTLE_US);
        bus.send_nibble(0x3);
        clock.sleep_us(SYNC_SETTLE_US);
        bus.send_nibble(0x3);
        clock.sleep_us(SYNC_SETTLE_US);

        bus.send_nibble(0x2);
        clock.sleep_us(SYNC_SETTLE_US);

        let init_cmd = self.init_cmd;
        self.send(true, init_cmd)
    }
}

impl HD44780Driver for DisplaySession {
    fn init(&mut self) -> LcdResult<()> {
        self.init_cmd = FUNCTION_SET_4BIT_2LINE;
        self.sync()?;
        self.clear_display()?;
        self.set_display_control(false, false, false)?;
        self.set_entry_mode(CursorDirection::Right, false)?;
        self.set_display_control(true, false, false)?;
        Ok(())
    }

    fn send_command(&mut self, command: u8) -> LcdResult<()> {
        self.send(true, command)
    }

    fn send_data(&mut self, data: u8) -> LcdResult<()> {
        self.send(false, data)
    }

    fn read_command(&mut self) -> LcdResult<u8> {
        Ok(self.recv_only())
    }

    fn read_data(&mut self) -> LcdResult<u8> {
        self.wait_busy()?;
        Ok(self.bus().recv_byte(false))
    }
}

impl Debug for DisplaySession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplaySession")
            .field("wiring", &self.wiring)
            .field("init_cmd", &format_args!("{:#04x}", self.init_cmd))
            .field("busy_until", &self.busy_until)
            .field("stalled", &self.stalled)
            .field("attached", &self.attached)
            .finish()
    }
}
