use std::time::{Duration, Instant};

/// Monotonic millisecond time source and delay provider.
///
/// The reader driver uses it for polling loops and reset timing, the router
/// for route aging. Tests substitute an emulated clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_us(&self, us: u64);
    fn sleep_ms(&self, ms: u64);
}

/// Wall-clock implementation backed by `std::time::Instant`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep_us(&self, us: u64) {
        std::thread::sleep(Duration::from_micros(us));
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
