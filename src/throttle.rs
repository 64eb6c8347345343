//! Rate limiting for repeatable non-fatal log lines.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lets the first `burst` occurrences through, then one in every `every`.
#[derive(Debug)]
pub struct LogThrottle {
    seen: AtomicU64,
    burst: u64,
    every: u64,
}

impl LogThrottle {
    #[must_use]
    pub const fn new(burst: u64, every: u64) -> Self {
        Self {
            seen: AtomicU64::new(0),
            burst,
            every: if every == 0 { 1 } else { every },
        }
    }

    /// Records an occurrence and reports whether it should be logged.
    pub fn should_log(&self) -> bool {
        let n = self.seen.fetch_add(1, Ordering::Relaxed);
        n < self.burst || (n - self.burst) % self.every == 0
    }

    /// Occurrences recorded so far, logged or not.
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl Default for LogThrottle {
    fn default() -> Self {
        Self::new(10, 1000)
    }
}
