use charlcd_gpio::clock::Clock;
use charlcd_gpio::lcd::hd44780::{ControlOp, DisplayRegistry, Greeting, LcdError};
use charlcd_gpio::sim::{self, SimClock, SimEvent, SimGpio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, mpsc};
use std::thread;
use std::time::Duration;

fn registry(gpio: &Arc<SimGpio>) -> DisplayRegistry {
    DisplayRegistry::new(gpio.clone(), Arc::new(SimClock::new()))
}

fn writes(gpio: &SimGpio, display: usize) -> Vec<SimEvent> {
    gpio.events(display)
        .into_iter()
        .filter(|event| !matches!(event, SimEvent::Read { .. }))
        .collect()
}

#[test]
fn open_write_status_release_deregister() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(4);
    let display = gpio.attach_display(&wiring);

    let id = registry.register(wiring).unwrap();
    registry.open(id).unwrap();
    assert_eq!(registry.write(id, b"AB"), Ok(2));
    assert_eq!(gpio.ddram_line(display, 0), "AB");

    let status = registry.read_status(id).unwrap();
    assert_eq!(status & 0x80, 0);
    assert_eq!(status & 0x7F, 2);

    registry.release(id).unwrap();
    registry.deregister(id).unwrap();

    assert!(registry.ids().is_empty());
    assert_eq!(gpio.ddram_line(display, 0), "Linux");
    for line in 4..11 {
        assert!(!gpio.is_requested(line));
    }
}

#[test]
fn register_runs_init_sequence_first() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(0);
    let display = gpio.attach_display(&wiring);

    registry.register(wiring).unwrap();

    let events = writes(&gpio, display);
    assert_eq!(
        events[..9],
        [
            SimEvent::Nibble { command: true, value: 0x3 },
            SimEvent::Nibble { command: true, value: 0x3 },
            SimEvent::Nibble { command: true, value: 0x3 },
            SimEvent::Nibble { command: true, value: 0x2 },
            SimEvent::Byte { command: true, value: 0x28 },
            SimEvent::Byte { command: true, value: 0x01 },
            SimEvent::Byte { command: true, value: 0x08 },
            SimEvent::Byte { command: true, value: 0x06 },
            SimEvent::Byte { command: true, value: 0x0C },
        ]
    );
    // Then the greeting
    assert_eq!(events[9], SimEvent::Byte { command: false, value: b'L' });
    assert_eq!(gpio.contentions(display), 0);
}

#[test]
fn raw_reset_nibble_is_masked() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(0);
    let display = gpio.attach_display(&wiring);
    let id = registry.register(wiring).unwrap();
    registry.open(id).unwrap();
    gpio.clear_events(display);

    registry.send_command(id, 0x31).unwrap();

    assert_eq!(writes(&gpio, display), vec![SimEvent::Byte { command: true, value: 0x21 }]);
    assert!(gpio.is_four_bit(display));
}

#[test]
fn slots_fill_up_and_get_reused() {
    let gpio = Arc::new(SimGpio::new());
    let registry = DisplayRegistry::with_capacity(gpio.clone(), Arc::new(SimClock::new()), 3);

    let ids: Vec<_> = (0..3)
        .map(|i| registry.register(sim::wiring_at(i * 10)).unwrap())
        .collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(registry.register(sim::wiring_at(30)), Err(LcdError::NoCapacity));

    registry.deregister(1).unwrap();
    assert_eq!(registry.register(sim::wiring_at(40)), Ok(1));
    assert_eq!(registry.ids(), vec![0, 1, 2]);
}

#[test]
fn only_one_concurrent_open_wins() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(0);
    gpio.attach_display(&wiring);
    let id = registry.register(wiring).unwrap();

    const THREADS: usize = 8;
    let barrier = Barrier::new(THREADS);
    let wins = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    registry.open(id)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(Result::is_ok)
            .count()
    });

    assert_eq!(wins, 1);
    assert!(registry.is_open(id).unwrap());
}

#[test]
fn concurrent_writers_never_interleave_on_the_wire() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(0);
    let display = gpio.attach_display(&wiring);
    let id = registry.register(wiring).unwrap();
    registry.open(id).unwrap();
    gpio.clear_events(display);

    thread::scope(|s| {
        for text in [b"aaaa", b"bbbb"] {
            let registry = &registry;
            s.spawn(move || {
                for _ in 0..5 {
                    registry.write(id, text).unwrap();
                }
            });
        }
    });

    // Every latched write is a whole byte from one of the writers
    let events = writes(&gpio, display);
    assert_eq!(events.len(), 40);
    assert!(events.iter().all(|event| matches!(
        event,
        SimEvent::Byte { command: false, value: b'a' | b'b' }
    )));
    assert_eq!(gpio.contentions(display), 0);
}

#[test]
fn stall_midway_reports_partial_write() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(0);
    let display = gpio.attach_display(&wiring);
    let id = registry.register(wiring).unwrap();
    registry.open(id).unwrap();

    gpio.set_busy_after_writes(display, 2);
    assert_eq!(registry.write(id, b"abcd"), Ok(2));
    assert_eq!(gpio.ddram_line(display, 0), "ab");
    assert_eq!(registry.write(id, b"more"), Err(LcdError::Busy));

    gpio.set_stuck_busy(display, false);
    assert_eq!(registry.control(id, ControlOp::Reset as u32, 0), Ok(0));
    assert_eq!(registry.write(id, b"back"), Ok(4));
    assert_eq!(gpio.ddram_line(display, 0), "back");
}

#[test]
fn control_rejects_unknown_ops() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio);
    let wiring = sim::wiring_at(0);
    gpio.attach_display(&wiring);
    let id = registry.register(wiring).unwrap();
    registry.open(id).unwrap();

    assert_eq!(registry.control(id, 0, 0), Err(LcdError::InvalidCommand(0)));
    assert_eq!(registry.control(id, 4, 0), Err(LcdError::InvalidCommand(4)));
    assert_eq!(registry.control(id, ControlOp::ReadStatus as u32, 0), Ok(0));
}

#[test]
fn degraded_pin_does_not_block_registration() {
    let gpio = Arc::new(SimGpio::new());
    let registry = registry(&gpio).with_greeting(Greeting {
        line1: "hello".into(),
        line2: String::new(),
    });
    let wiring = sim::wiring_at(0);
    let display = gpio.attach_display(&wiring);
    gpio.deny_line(1);

    // RS is gone, so every transfer looks like a command to the controller
    let id = registry.register(wiring).unwrap();
    assert_eq!(registry.ids(), vec![id]);
    assert!(!gpio.is_requested(1));
    assert_eq!(gpio.ddram_line(display, 0), "");
}

/// Virtual clock that, once armed, parks the next long sleep until the test lets it go.
#[derive(Debug)]
struct GatedClock {
    inner: SimClock,
    armed: AtomicBool,
    entered: Barrier,
    resume: Barrier,
}

impl GatedClock {
    fn new() -> Self {
        GatedClock {
            inner: SimClock::new(),
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            resume: Barrier::new(2),
        }
    }
}

impl Clock for GatedClock {
    fn now(&self) -> Duration {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) {
        if duration >= Duration::from_millis(5) && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.resume.wait();
        }
        self.inner.sleep(duration);
    }

    fn yield_now(&self) {
        self.inner.yield_now();
    }
}

#[test]
fn registering_does_not_hold_up_other_displays() {
    let gpio = Arc::new(SimGpio::new());
    let clock = Arc::new(GatedClock::new());
    let registry = DisplayRegistry::new(gpio.clone(), clock.clone());
    let wiring = sim::wiring_at(0);
    let display = gpio.attach_display(&wiring);
    let first = registry.register(wiring).unwrap();
    registry.open(first).unwrap();
    let second = sim::wiring_at(10);
    gpio.attach_display(&second);

    clock.armed.store(true, Ordering::SeqCst);
    thread::scope(|s| {
        let registering = s.spawn(|| registry.register(second));
        // The second display is now parked in the middle of its resync
        clock.entered.wait();

        let (tx, rx) = mpsc::channel();
        let registry = &registry;
        s.spawn(move || tx.send(registry.write(first, b"x")));
        let written = rx.recv_timeout(Duration::from_secs(5));
        clock.resume.wait();

        assert_eq!(written, Ok(Ok(1)));
        assert_eq!(registering.join().unwrap(), Ok(1));
    });

    assert_eq!(gpio.ddram_line(display, 0), "x");
    assert_eq!(registry.ids(), vec![0, 1]);
}
