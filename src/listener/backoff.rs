use std::time::Duration;

/// Next reconnect delay: double, but never above `ceiling`
pub fn next_delay(current: Duration, ceiling: Duration) -> Duration {
    current.saturating_mul(2).min(ceiling)
}

/// Exponential reconnect backoff with unbounded retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// Delay to wait before the next attempt
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the delay for the attempt being scheduled now and grow it for
    /// the one after
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_delay(self.current, self.ceiling);
        delay
    }

    /// Back to the floor (successful connect, manual reconnect)
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: Duration = Duration::from_secs(1);
    const CEILING: Duration = Duration::from_secs(30);

    #[test]
    fn test_next_delay_doubles_and_caps() {
        assert_eq!(next_delay(FLOOR, CEILING), Duration::from_secs(2));
        assert_eq!(next_delay(Duration::from_secs(16), CEILING), CEILING);
        assert_eq!(next_delay(CEILING, CEILING), CEILING);
    }

    #[test]
    fn test_delay_after_n_failures() {
        for n in 0..10u32 {
            let mut backoff = Backoff::new(FLOOR, CEILING);
            for _ in 0..n {
                backoff.next();
            }
            let expected = (FLOOR * 2u32.pow(n)).min(CEILING);
            assert_eq!(backoff.current(), expected, "after {} failures", n);
        }
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = Backoff::new(FLOOR, CEILING);
        assert_eq!(backoff.next(), FLOOR);
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        backoff.reset();
        assert_eq!(backoff.current(), FLOOR);
    }

    #[test]
    fn test_never_overflows() {
        let mut backoff = Backoff::new(FLOOR, Duration::MAX);
        for _ in 0..200 {
            backoff.next();
        }
        assert_eq!(backoff.current(), Duration::MAX);
    }
}
