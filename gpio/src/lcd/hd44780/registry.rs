//! Table of bound displays and the byte-stream/command interface on top of it.
//!
//! Displays are addressed by the index of their slot. The platform side binds and unbinds them
//! with [DisplayRegistry::register] and [DisplayRegistry::deregister]; users go through
//! [DisplayRegistry::open], the stream operations and [DisplayRegistry::release].

use crate::clock::Clock;
use crate::lcd::hd44780::driver::{HD44780Driver, SECOND_LINE_ADDRESS};
use crate::lcd::hd44780::session::DisplaySession;
use crate::lcd::hd44780::wiring::DisplayWiring;
use crate::lcd::hd44780::{LcdError, LcdResult};
use crate::GpioLines;
use log::{debug, info, warn};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// Default number of slots.
pub const MAX_DISPLAYS: usize = 16;
/// At most this many bytes go out per [DisplayRegistry::write] call.
pub const MAX_WRITE: usize = 256;

/// Text shown while a display is bound but nobody has it open.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Greeting {
    pub line1: String,
    pub line2: String,
}

impl Default for Greeting {
    fn default() -> Self {
        Greeting {
            line1: "Linux".to_string(),
            line2: String::new(),
        }
    }
}

/// Raw operations of [DisplayRegistry::control].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControlOp {
    /// Send the parameter as a command byte.
    SendCommand = 1,
    /// Return the busy flag and address counter.
    ReadStatus = 2,
    /// Run the init sequence again.
    Reset = 3,
}

impl TryFrom<u32> for ControlOp {
    type Error = LcdError;

    fn try_from(op: u32) -> LcdResult<Self> {
        match op {
            1 => Ok(ControlOp::SendCommand),
            2 => Ok(ControlOp::ReadStatus),
            3 => Ok(ControlOp::Reset),
            _ => Err(LcdError::InvalidCommand(op)),
        }
    }
}

/// Maps a raw `0x3X` command to `0x2X`.
///
/// With DL set, a function set would switch the controller to 8-bit mode and the 4-bit bus would
/// lose sync, so raw commands never get to set it.
pub fn mask_reset_nibble(command: u8) -> u8 {
    if command & 0xF0 == 0x30 {
        0x20 | (command & 0x0F)
    } else {
        command
    }
}

fn stalled_as_busy(err: LcdError) -> LcdError {
    match err {
        LcdError::Stalled => LcdError::Busy,
        err => err,
    }
}

struct DisplaySlot {
    in_use: AtomicBool,
    session: Mutex<DisplaySession>,
}

impl DisplaySlot {
    fn new(session: DisplaySession) -> Self {
        DisplaySlot {
            in_use: AtomicBool::new(false),
            session: Mutex::new(session),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DisplaySession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the session of display `id`, unless it was deregistered in the meantime.
    fn session(&self, id: usize) -> LcdResult<MutexGuard<'_, DisplaySession>> {
        let session = self.lock();
        if !session.is_attached() {
            return Err(LcdError::NotFound(id));
        }
        Ok(session)
    }

    fn acquire(&self) -> LcdResult<()> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| LcdError::Busy)
    }

    fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

enum SlotEntry {
    Free,
    /// Held by a register or deregister that is still talking to the display.
    Reserved,
    Bound(Arc<DisplaySlot>),
}

/// Fixed-capacity table of displays.
///
/// Every slot carries an in-use flag taken with a compare-and-swap, so at most one owner has a
/// display open at a time. The session itself is additionally behind a mutex, which keeps two
/// transfers from ever interleaving on the wire.
///
/// The table lock is only held to look up or change entries, never while a display is being
/// talked to, so a slow or dead display does not hold up the others.
pub struct DisplayRegistry {
    gpio: Arc<dyn GpioLines>,
    clock: Arc<dyn Clock>,
    greeting: Greeting,
    slots: RwLock<Vec<SlotEntry>>,
}

impl DisplayRegistry {
    pub fn new(gpio: Arc<dyn GpioLines>, clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(gpio, clock, MAX_DISPLAYS)
    }

    pub fn with_capacity(
        gpio: Arc<dyn GpioLines>,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> Self {
        DisplayRegistry {
            gpio,
            clock,
            greeting: Greeting::default(),
            slots: RwLock::new((0..capacity).map(|_| SlotEntry::Free).collect()),
        }
    }

    pub fn with_greeting(mut self, greeting: Greeting) -> Self {
        self.greeting = greeting;
        self
    }

    fn slots(&self) -> RwLockReadGuard<'_, Vec<SlotEntry>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, Vec<SlotEntry>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    /// Ids of all bound displays, in order.
    pub fn ids(&self) -> Vec<usize> {
        self.slots()
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| matches!(slot, SlotEntry::Bound(_)).then_some(id))
            .collect()
    }

    fn slot(&self, id: usize) -> LcdResult<Arc<DisplaySlot>> {
        match self.slots().get(id) {
            Some(SlotEntry::Bound(slot)) => Ok(slot.clone()),
            _ => Err(LcdError::NotFound(id)),
        }
    }

    fn open_slot(&self, id: usize) -> LcdResult<Arc<DisplaySlot>> {
        let slot = self.slot(id)?;
        if !slot.is_open() {
            return Err(LcdError::NotOpen(id));
        }
        Ok(slot)
    }

    fn show_greeting(&self, session: &mut DisplaySession) -> LcdResult<()> {
        session.print(&self.greeting.line1)?;
        session.set_ddram_address(SECOND_LINE_ADDRESS)?;
        session.print(&self.greeting.line2)
    }

    /// Marks the first free slot as taken and returns its id.
    fn reserve(&self) -> LcdResult<usize> {
        let mut slots = self.slots_mut();
        let id = slots
            .iter()
            .position(|slot| matches!(slot, SlotEntry::Free))
            .ok_or(LcdError::NoCapacity)?;
        slots[id] = SlotEntry::Reserved;
        Ok(id)
    }

    /// Binds a display to the first free slot, initializes it and shows the greeting.
    ///
    /// A display that does not respond is still bound (marked stalled) so that a later
    /// [DisplayRegistry::open] can bring it back.
    pub fn register(&self, wiring: DisplayWiring) -> LcdResult<usize> {
        let id = self.reserve()?;

        let attached = DisplaySession::attach(wiring, self.gpio.clone(), self.clock.clone());
        let mut session = match attached {
            Ok(session) => session,
            Err(err) => {
                self.slots_mut()[id] = SlotEntry::Free;
                return Err(err);
            }
        };
        if let Err(err) = session.init().and_then(|_| self.show_greeting(&mut session)) {
            warn!("Display {} did not initialize: {}", id, err);
        }

        self.slots_mut()[id] = SlotEntry::Bound(Arc::new(DisplaySlot::new(session)));
        info!("Registered display {}", id);
        Ok(id)
    }

    /// Unbinds a display, leaving it reinitialized with the greeting on, and frees its slot.
    ///
    /// Handles to the display still held by in-flight calls see it as gone from then on.
    pub fn deregister(&self, id: usize) -> LcdResult<()> {
        let slot = {
            let mut slots = self.slots_mut();
            let slot = match slots.get(id) {
                Some(SlotEntry::Bound(slot)) => slot.clone(),
                _ => return Err(LcdError::InvalidId(id)),
            };
            slots[id] = SlotEntry::Reserved;
            slot
        };

        {
            let mut session = slot.lock();
            if let Err(err) = session.init().and_then(|_| self.show_greeting(&mut session)) {
                warn!("Display {} did not reinitialize: {}", id, err);
            }
            session.detach();
        }

        self.slots_mut()[id] = SlotEntry::Free;
        info!("Deregistered display {}", id);
        Ok(())
    }

    /// Takes exclusive ownership of a display.
    pub fn acquire(&self, id: usize) -> LcdResult<()> {
        self.slot(id)?.acquire()
    }

    /// Gives ownership back. Releasing a display nobody owns is fine.
    pub fn release(&self, id: usize) -> LcdResult<()> {
        self.slot(id)?.release();
        debug!("Released display {}", id);
        Ok(())
    }

    pub fn is_open(&self, id: usize) -> LcdResult<bool> {
        Ok(self.slot(id)?.is_open())
    }

    /// Acquires a display and brings it to a known state.
    ///
    /// If the display does not respond, ownership is given back and [LcdError::Busy] returned.
    pub fn open(&self, id: usize) -> LcdResult<()> {
        let slot = self.slot(id)?;
        slot.acquire()?;

        let result = slot.session(id).and_then(|mut session| session.init());
        if let Err(err) = result {
            slot.release();
            warn!("Display {} did not initialize on open: {}", id, err);
            return Err(stalled_as_busy(err));
        }

        debug!("Opened display {}", id);
        Ok(())
    }

    /// Writes text at the cursor, returning how many bytes went out.
    ///
    /// If the display stops responding midway, the count written so far is returned; if it does
    /// not take even the first byte, [LcdError::Busy].
    pub fn write(&self, id: usize, bytes: &[u8]) -> LcdResult<usize> {
        let slot = self.open_slot(id)?;
        let mut session = slot.session(id)?;
        let len = bytes.len().min(MAX_WRITE);

        for (written, &byte) in bytes[..len].iter().enumerate() {
            if let Err(err) = session.send_data(byte) {
                if written == 0 {
                    return Err(stalled_as_busy(err));
                }
                warn!("Display {} stalled after {} of {} bytes", id, written, len);
                return Ok(written);
            }
        }

        Ok(len)
    }

    /// Sends a raw command byte.
    pub fn send_command(&self, id: usize, command: u8) -> LcdResult<()> {
        let slot = self.open_slot(id)?;
        let command = mask_reset_nibble(command);
        let result = slot.session(id)?.send_command(command);
        result.map_err(stalled_as_busy)
    }

    /// Reads the busy flag and address counter without waiting.
    pub fn read_status(&self, id: usize) -> LcdResult<u8> {
        let slot = self.open_slot(id)?;
        let status = slot.session(id)?.recv_only();
        Ok(status)
    }

    /// Runs the init sequence again, the way to recover a stalled display.
    pub fn reset(&self, id: usize) -> LcdResult<()> {
        let slot = self.open_slot(id)?;
        let result = slot.session(id)?.init();
        result.map_err(stalled_as_busy)
    }

    /// Raw operation entry point, numbered like [ControlOp].
    pub fn control(&self, id: usize, op: u32, param: u32) -> LcdResult<u32> {
        match ControlOp::try_from(op)? {
            ControlOp::SendCommand => {
                let command = u8::try_from(param).map_err(|_| LcdError::InvalidArgument(param))?;
                self.send_command(id, command)?;
                Ok(0)
            }
            ControlOp::ReadStatus => Ok(self.read_status(id)? as u32),
            ControlOp::Reset => {
                self.reset(id)?;
                Ok(0)
            }
        }
    }

    /// Runs `f` on the session of a bound display, whether or not it is open.
    pub fn with_session<R>(
        &self,
        id: usize,
        f: impl FnOnce(&mut DisplaySession) -> R,
    ) -> LcdResult<R> {
        let slot = self.slot(id)?;
        let mut session = slot.session(id)?;
        Ok(f(&mut session))
    }
}

impl Debug for DisplayRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DisplayRegistry({:?}, {:?}, {:?})", self.gpio, self.ids(), self.greeting)
    }
}
