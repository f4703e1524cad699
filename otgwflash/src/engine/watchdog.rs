//! One-shot response watchdog.
//!
//! The engine never sleeps: the watchdog only stores a deadline, and the
//! caller reports the passage of time through [`Watchdog::expired`].

use std::time::{Duration, Instant};

/// Single pending timeout. Arming again replaces the previous deadline.
#[derive(Debug, Clone)]
pub struct Watchdog {
    period: Duration,
    deadline: Option<Instant>,
}

impl Watchdog {
    /// Create a disarmed watchdog firing `period` after each arm.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    /// Round-trip budget.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// (Re)start the countdown from `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    /// Drop any pending timeout.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Pending deadline, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a timeout is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Report and consume an expired timeout.
    pub fn expired(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_after_period() {
        let start = Instant::now();
        let mut wd = Watchdog::new(Duration::from_millis(1000));
        assert!(!wd.expired(start + Duration::from_secs(5)));

        wd.arm(start);
        assert!(!wd.expired(start + Duration::from_millis(999)));
        assert!(wd.expired(start + Duration::from_millis(1000)));
        assert!(!wd.is_armed());
        assert!(!wd.expired(start + Duration::from_secs(5)));
    }

    #[test]
    fn test_rearm_replaces_deadline() {
        let start = Instant::now();
        let mut wd = Watchdog::new(Duration::from_millis(100));
        wd.arm(start);
        wd.arm(start + Duration::from_millis(80));
        assert!(!wd.expired(start + Duration::from_millis(120)));
        assert!(wd.expired(start + Duration::from_millis(180)));
    }

    #[test]
    fn test_cancel() {
        let start = Instant::now();
        let mut wd = Watchdog::new(Duration::from_millis(100));
        wd.arm(start);
        wd.cancel();
        assert_eq!(wd.deadline(), None);
        assert!(!wd.expired(start + Duration::from_secs(1)));
    }
}
