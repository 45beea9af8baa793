//! Heartbeat and missed-beat detection
//!
//! Supervised tasks call [`Heartbeat::beat`] once per cycle. The watchdog
//! task runs on its own interval and compares beat counts, so a stalled
//! supervised task cannot also stall its own supervision.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic beat counter shared between a supervised task and the watchdog
#[derive(Debug, Default)]
pub struct Heartbeat {
    beats: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        self.beats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

/// Result of one watchdog check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// At least one beat since the previous check
    Fresh,
    /// No beat; consecutive miss count below the limit
    Missed(u32),
    /// Consecutive misses just reached the limit
    Tripped,
}

/// Missed-beat counter
#[derive(Debug)]
pub struct Watchdog {
    missed_limit: u32,
    seen: u64,
    missed: u32,
}

impl Watchdog {
    pub fn new(missed_limit: u32) -> Self {
        Self {
            missed_limit: missed_limit.max(1),
            seen: 0,
            missed: 0,
        }
    }

    /// Start counting from the heartbeat's current value
    pub fn resync(&mut self, heartbeat: &Heartbeat) {
        self.seen = heartbeat.beats();
        self.missed = 0;
    }

    pub fn check(&mut self, heartbeat: &Heartbeat) -> WatchdogVerdict {
        let beats = heartbeat.beats();
        if beats != self.seen {
            self.seen = beats;
            self.missed = 0;
            return WatchdogVerdict::Fresh;
        }
        self.missed = self.missed.saturating_add(1);
        if self.missed == self.missed_limit {
            WatchdogVerdict::Tripped
        } else {
            WatchdogVerdict::Missed(self.missed)
        }
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_once_at_limit() {
        let heartbeat = Heartbeat::new();
        let mut watchdog = Watchdog::new(3);
        watchdog.resync(&heartbeat);

        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Missed(1));
        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Missed(2));
        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Tripped);
        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Missed(4));
    }

    #[test]
    fn test_beat_resets_streak() {
        let heartbeat = Heartbeat::new();
        let mut watchdog = Watchdog::new(2);
        watchdog.resync(&heartbeat);

        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Missed(1));
        heartbeat.beat();
        heartbeat.beat();
        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Fresh);
        assert_eq!(watchdog.missed(), 0);
        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Missed(1));
        assert_eq!(watchdog.check(&heartbeat), WatchdogVerdict::Tripped);
    }
}
