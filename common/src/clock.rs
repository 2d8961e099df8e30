use std::{cell::Cell, rc::Rc, time::Instant};

/// Free-running millisecond counter, as exposed by the device's `millis()`.
///
/// The counter is 32 bits wide and wraps roughly every 49.7 days; consumers
/// must only ever look at wrapping differences between two readings.
pub trait MonotonicClock {
    fn now_ms(&self) -> u32;
}

impl<C: MonotonicClock + ?Sized> MonotonicClock for &C {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// Host clock: milliseconds since construction, truncated to 32 bits.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}

/// Hand-driven counter for simulations. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self {
            millis: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn set(&self, millis: u32) {
        self.millis.set(millis);
    }

    pub fn advance(&self, millis: u32) {
        self.millis.set(self.millis.get().wrapping_add(millis));
    }
}

impl MonotonicClock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.millis.get()
    }
}
