//! Busy-wait budgets and the deadline type every poll loop runs against.

use std::time::{Duration, Instant};

/// A point in monotonic time after which a wait has failed.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Start a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline { start: Instant::now(), timeout }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Timeout policy for busy polling.
///
/// The defaults reproduce empirically tuned values for W25Q parts. Denser
/// dies (at or above `large_chip_threshold` bytes) get every budget doubled.
#[derive(Copy, Clone, Debug)]
pub struct Timeouts {
    /// Used by WaitReady when no explicit timeout is given.
    pub default: Duration,
    /// Base sector erase budget.
    pub sector_erase_base: Duration,
    /// Extra budget per sector index on large chips.
    pub sector_erase_per_sector: Duration,
    /// Upper bound for the scaled sector erase budget, before doubling.
    pub sector_erase_max: Duration,
    pub chip_erase: Duration,
    pub large_chip_threshold: u32,
    /// Sleep between two status register polls.
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            default: Duration::from_millis(1000),
            sector_erase_base: Duration::from_millis(100),
            sector_erase_per_sector: Duration::from_millis(2),
            sector_erase_max: Duration::from_millis(200),
            chip_erase: Duration::from_secs(30),
            large_chip_threshold: 16 * 1024 * 1024,
            poll_interval: Duration::from_micros(100),
        }
    }
}

impl Timeouts {
    pub fn is_large(&self, capacity: u32) -> bool {
        capacity >= self.large_chip_threshold
    }

    /// Final WaitReady budget: `timeout` (or the default), doubled on large chips.
    pub fn wait_budget(&self, capacity: u32, timeout: Option<Duration>) -> Duration {
        let base = timeout.unwrap_or(self.default);
        if self.is_large(capacity) {
            base * 2
        } else {
            base
        }
    }

    /// Budget passed to WaitReady after a sector erase at `sector_index`.
    pub fn sector_erase(&self, capacity: u32, sector_index: u32) -> Duration {
        if self.is_large(capacity) {
            let scaled = self.sector_erase_base + self.sector_erase_per_sector * sector_index;
            scaled.min(self.sector_erase_max)
        } else {
            self.sector_erase_base
        }
    }

    /// Budget passed to WaitReady after a chip erase.
    pub fn chip_erase(&self, capacity: u32) -> Duration {
        if self.is_large(capacity) {
            self.chip_erase * 2
        } else {
            self.chip_erase
        }
    }
}
