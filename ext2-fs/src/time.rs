use core::sync::atomic::{AtomicU32, Ordering};

/// Wall-clock source for inode timestamps, in seconds since the epoch.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> u32;
}

/// A clock that only moves when told to. Kernels without an RTC and the
/// tests use it.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicU32,
}

impl ManualClock {
    pub const fn new(seconds: u32) -> Self {
        Self {
            seconds: AtomicU32::new(seconds),
        }
    }

    pub fn set(&self, seconds: u32) {
        self.seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: u32) {
        self.seconds.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> u32 {
        self.seconds.load(Ordering::Relaxed)
    }
}
