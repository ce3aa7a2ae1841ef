use std::time::{Duration, Instant};

use tracing::debug;

/// Paces reconnect attempts to one peer address. Each consecutive failure
///  doubles the wait before the next attempt is allowed, from `initial` up
///  to `max`; a success resets the backoff.
///
/// An (0, 0) configuration disables throttling entirely.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectThrottleSettings {
    pub initial: Duration,
    pub max: Duration,
}

impl ConnectThrottleSettings {
    pub fn disabled() -> ConnectThrottleSettings {
        ConnectThrottleSettings {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn is_disabled(&self) -> bool {
        self.initial.is_zero() && self.max.is_zero()
    }
}

pub struct ConnectThrottle {
    settings: ConnectThrottleSettings,
    current_delay: Duration,
    down_until: Option<Instant>,
}

impl ConnectThrottle {
    pub fn new(settings: ConnectThrottleSettings) -> ConnectThrottle {
        ConnectThrottle {
            settings,
            current_delay: settings.initial,
            down_until: None,
        }
    }

    pub fn may_connect(&self) -> bool {
        self.may_connect_at(Instant::now())
    }

    pub fn on_success(&mut self) {
        self.current_delay = self.settings.initial;
        self.down_until = None;
    }

    pub fn on_failure(&mut self) {
        self.on_failure_at(Instant::now());
    }

    fn may_connect_at(&self, now: Instant) -> bool {
        if self.settings.is_disabled() {
            return true;
        }
        match self.down_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    fn on_failure_at(&mut self, now: Instant) {
        if self.settings.is_disabled() {
            return;
        }

        debug!("connect attempt failed, backing off for {:?}", self.current_delay);
        self.down_until = Some(now + self.current_delay);
        self.current_delay = (self.current_delay * 2).min(self.settings.max);
        if self.current_delay.is_zero() {
            // initial == 0 with a nonzero max: make the doubling take hold
            self.current_delay = Duration::from_millis(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn throttle(initial_ms: u64, max_ms: u64) -> ConnectThrottle {
        ConnectThrottle::new(ConnectThrottleSettings {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms),
        })
    }

    #[test]
    fn test_allows_first_attempt() {
        assert!(throttle(100, 1000).may_connect());
    }

    #[test]
    fn test_zero_zero_disables() {
        let mut t = throttle(0, 0);
        let now = Instant::now();
        for _ in 0..10 {
            t.on_failure_at(now);
            assert!(t.may_connect_at(now));
        }
    }

    #[rstest]
    #[case::first_failure(1, 100)]
    #[case::second_failure(2, 200)]
    #[case::doubling_capped(5, 1000)]
    #[case::stays_capped(8, 1000)]
    fn test_backoff_progression(#[case] failures: usize, #[case] expected_block_ms: u64) {
        let mut t = throttle(100, 1000);
        let now = Instant::now();
        let mut last_failure = now;
        for i in 0..failures {
            last_failure = now + Duration::from_millis(10 * i as u64);
            t.on_failure_at(last_failure);
        }

        let blocked = last_failure + Duration::from_millis(expected_block_ms - 1);
        let open = last_failure + Duration::from_millis(expected_block_ms);
        assert!(!t.may_connect_at(blocked));
        assert!(t.may_connect_at(open));
    }

    #[test]
    fn test_success_resets() {
        let mut t = throttle(100, 1000);
        let now = Instant::now();
        for _ in 0..5 {
            t.on_failure_at(now);
        }
        assert!(!t.may_connect_at(now));

        t.on_success();
        assert!(t.may_connect_at(now));

        // and the delay is back at `initial`
        t.on_failure_at(now);
        assert!(!t.may_connect_at(now + Duration::from_millis(99)));
        assert!(t.may_connect_at(now + Duration::from_millis(100)));
    }
}
