//! Millisecond tick, down-counting timers and the LED blink machine.
//!
//! A 1 ms periodic source calls [`SysTick::tick`]; on hardware that source is
//! the systick interrupt, in the simulator it is a ticker thread. Everything
//! the interpreter does with time goes through this small bank of timers, so
//! a test can stand in for the tick source and make every deadline
//! deterministic (see [`SysTick::self_clocked`]).

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::board::{Board, Led};

/// Number of timers in the bank.
pub const NTIMERS: usize = 4;

/// Reload value of the blink timer; the LED toggles twice per 100 ms period.
const LED_BLINK_RELOAD_MS: u32 = 50;

/// The logical timers used by the bootloader.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timer {
    /// Inactivity timeout armed at session entry.
    BlWait = 0,
    /// Per-read deadline of the byte-input primitive.
    Cin = 1,
    /// Blocking sleep used after the BOOT reply.
    Delay = 2,
    /// Blink period of the bootloader LED.
    Led = 3,
}

/// State of the bootloader LED.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LedState {
    Off = 0,
    On = 1,
    Blink = 2,
}

/// The timer bank shared between the tick source and the interpreter.
///
/// The tick source only ever decrements and the interpreter only ever arms,
/// so plain atomic loads and stores are enough; there is no locking.
pub struct SysTick {
    timers: [AtomicU32; NTIMERS],
    led_state: AtomicU8,
    self_clocked: bool,
}

impl SysTick {
    /// Creates a timer bank expecting an external 1 ms tick source.
    pub fn new() -> SysTick {
        SysTick {
            timers: Default::default(),
            led_state: AtomicU8::new(LedState::Off as u8),
            self_clocked: false,
        }
    }

    /// Creates a self-clocked timer bank for tests: every expiry poll counts
    /// as one elapsed millisecond, so deadlines become countable in loop
    /// iterations instead of wall-clock time.
    pub fn self_clocked() -> SysTick {
        SysTick {
            self_clocked: true,
            ..SysTick::new()
        }
    }

    /// Arms `timer` to expire in `ms` milliseconds. Zero expires immediately.
    pub fn set(&self, timer: Timer, ms: u32) {
        self.timers[timer as usize].store(ms, Ordering::SeqCst);
    }

    /// Remaining milliseconds of `timer`.
    pub fn get(&self, timer: Timer) -> u32 {
        self.timers[timer as usize].load(Ordering::SeqCst)
    }

    /// Returns true once `timer` has counted down to zero.
    pub fn expired(&self, timer: Timer) -> bool {
        if self.self_clocked {
            self.advance();
        }

        self.get(timer) == 0
    }

    /// One millisecond has passed: count every armed timer down and run the
    /// blink machine.
    pub fn tick<B: Board>(&self, board: &B) {
        self.advance();

        if self.led_state() == LedState::Blink && self.get(Timer::Led) == 0 {
            board.led_toggle(Led::Bootloader);
            self.set(Timer::Led, LED_BLINK_RELOAD_MS);
        }
    }

    fn advance(&self) {
        for timer in &self.timers {
            let _ = timer.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        }
    }

    /// Moves the bootloader LED to `state`.
    pub fn led_set<B: Board>(&self, state: LedState, board: &B) {
        self.led_state.store(state as u8, Ordering::SeqCst);

        match state {
            LedState::Off => board.led_off(Led::Bootloader),
            LedState::On => board.led_on(Led::Bootloader),
            // Restart the blink machine on the next tick.
            LedState::Blink => self.set(Timer::Led, 0),
        }
    }

    /// Current state of the bootloader LED.
    pub fn led_state(&self) -> LedState {
        match self.led_state.load(Ordering::SeqCst) {
            1 => LedState::On,
            2 => LedState::Blink,
            _ => LedState::Off,
        }
    }

    /// Busy-waits for `ms` milliseconds on the [`Timer::Delay`] timer.
    pub fn delay(&self, ms: u32) {
        self.set(Timer::Delay, ms);

        while !self.expired(Timer::Delay) {
            std::hint::spin_loop();
        }
    }
}

impl Default for SysTick {
    fn default() -> SysTick {
        SysTick::new()
    }
}
