//! # Activity Clock
//!
//! Tracks the moment of last use of the service. Touched on every request
//! that counts as activity; read by the status endpoint and used as the
//! anchor for idle-eviction scheduling.

use std::sync::RwLock;
use std::time::Instant;

pub struct ActivityClock {
    last: RwLock<ActivityStamp>,
}

#[derive(Debug, Clone, Copy)]
struct ActivityStamp {
    instant: Instant,
    unix_secs: i64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            last: RwLock::new(ActivityStamp {
                instant: Instant::now(),
                unix_secs: chrono::Utc::now().timestamp(),
            }),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let mut last = self.last.write().unwrap_or_else(|e| e.into_inner());
        last.instant = Instant::now();
        last.unix_secs = chrono::Utc::now().timestamp();
    }

    /// Seconds elapsed since the last recorded activity.
    pub fn idle_secs(&self) -> u64 {
        let last = self.last.read().unwrap_or_else(|e| e.into_inner());
        last.instant.elapsed().as_secs()
    }

    /// Unix timestamp of the last recorded activity, for status reporting.
    pub fn last_activity_unix(&self) -> i64 {
        let last = self.last.read().unwrap_or_else(|e| e.into_inner());
        last.unix_secs
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_resets_idle_time() {
        let clock = ActivityClock::new();
        std::thread::sleep(std::time::Duration::from_millis(20));
        clock.touch();
        assert_eq!(clock.idle_secs(), 0);
    }

    #[test]
    fn test_last_activity_is_plausible() {
        let clock = ActivityClock::new();
        let now = chrono::Utc::now().timestamp();
        assert!((clock.last_activity_unix() - now).abs() <= 1);
    }
}
