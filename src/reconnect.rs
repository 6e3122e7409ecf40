
//! Backoff schedule for reconnecting to the broker.

use std::time::Duration;

/// Produces the delays between reconnect attempts.
///
/// Delays start at the configured initial value and strictly double with
/// no upper bound: the service is long-lived and expected to eventually
/// regain connectivity, so the schedule never gives up. Growth saturates
/// only at the `Duration` limit.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    next_delay: Duration,
}

impl ReconnectSchedule {
    /// Creates a schedule starting at `initial_delay`.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            next_delay: initial_delay,
        }
    }

    /// Returns the delay to wait before the next attempt and advances
    /// the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next_delay;
        self.next_delay = delay.saturating_mul(2);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_strictly_double_from_the_initial_value() {
        let mut schedule = ReconnectSchedule::new(Duration::from_millis(5000));
        assert_eq!(schedule.next_delay(), Duration::from_millis(5000));
        assert_eq!(schedule.next_delay(), Duration::from_millis(10000));
        assert_eq!(schedule.next_delay(), Duration::from_millis(20000));
        assert_eq!(schedule.next_delay(), Duration::from_millis(40000));
    }

    #[test]
    fn test_no_ceiling_within_practical_outages() {
        let mut schedule = ReconnectSchedule::new(Duration::from_secs(5));
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = schedule.next_delay();
            assert!(delay > last, "delay {delay:?} did not grow past {last:?}");
            last = delay;
        }
        // 5s doubled 19 times is far beyond any configured cap.
        assert!(last > Duration::from_secs(86_400));
    }

    #[test]
    fn test_growth_saturates_instead_of_overflowing() {
        let mut schedule = ReconnectSchedule::new(Duration::MAX);
        assert_eq!(schedule.next_delay(), Duration::MAX);
        assert_eq!(schedule.next_delay(), Duration::MAX);
    }
}
