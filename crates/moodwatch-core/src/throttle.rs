//! Write throttling for detection persistence.

/// Default persistence period, in processed frames.
pub const DEFAULT_PERSIST_EVERY_N: u64 = 15;

/// True when `frame_index` falls on the persistence period.
///
/// Frame 0 is always eligible (`0 mod n == 0`). A period of 0 disables
/// persistence entirely.
pub fn should_persist(frame_index: u64, persist_every_n: u64) -> bool {
    persist_every_n != 0 && frame_index % persist_every_n == 0
}

/// Fixed-period throttle. The frame counter is owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionThrottle {
    every_n: u64,
}

impl Default for DetectionThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PERSIST_EVERY_N)
    }
}

impl DetectionThrottle {
    pub fn new(every_n: u64) -> Self {
        Self { every_n }
    }

    pub fn every_n(&self) -> u64 {
        self.every_n
    }

    pub fn should_persist(&self, frame_index: u64) -> bool {
        should_persist(frame_index, self.every_n)
    }
}
