//! Adaptive poll pacing.
//!
//! Sustained transient failure doubles the interval up to a ceiling, so the
//! watcher throttles itself before the portal's anti-abuse defenses do; one
//! healthy authenticated poll snaps it back to the base rate. A ±20% jitter
//! keeps the request cadence from looking machine-regular.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PollPacer {
    base: Duration,
    ceiling: Duration,
    failures: u32,
}

impl PollPacer {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            failures: 0,
        }
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// `min(base * 2^failures, ceiling)`, exactly.
    pub fn current_interval(&self) -> Duration {
        // Past 2^20 the ceiling has long since won; capping the shift keeps
        // the multiply from overflowing.
        let factor = 1u32 << self.failures.min(20);
        self.base.saturating_mul(factor).min(self.ceiling)
    }

    /// The current interval with ±20% jitter, for actual sleeping.
    pub fn jittered_interval(&self) -> Duration {
        use rand::prelude::*;
        let interval = self.current_interval();
        let jitter_range = (interval.as_millis() as f64 * 0.2) as i64;
        if jitter_range == 0 {
            return interval;
        }
        let mut rng = rand::rng();
        let jitter = rng.random_range(-jitter_range..=jitter_range);
        let millis = (interval.as_millis() as i64 + jitter).max(0) as u64;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_doubles_per_failure_up_to_ceiling() {
        let base = Duration::from_secs(30);
        let ceiling = Duration::from_secs(300);
        let mut pacer = PollPacer::new(base, ceiling);

        assert_eq!(pacer.current_interval(), base);
        for expected_secs in [60, 120, 240, 300, 300] {
            pacer.record_failure();
            assert_eq!(
                pacer.current_interval(),
                Duration::from_secs(expected_secs),
                "after {} failures",
                pacer.failures()
            );
        }
    }

    #[test]
    fn success_resets_to_base() {
        let mut pacer = PollPacer::new(Duration::from_secs(30), Duration::from_secs(300));
        for _ in 0..4 {
            pacer.record_failure();
        }
        assert!(pacer.current_interval() > Duration::from_secs(30));
        pacer.record_success();
        assert_eq!(pacer.current_interval(), Duration::from_secs(30));
        assert_eq!(pacer.failures(), 0);
    }

    #[test]
    fn huge_failure_counts_never_overflow() {
        let mut pacer = PollPacer::new(Duration::from_secs(30), Duration::from_secs(3600));
        for _ in 0..1000 {
            pacer.record_failure();
        }
        assert_eq!(pacer.current_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let mut pacer = PollPacer::new(Duration::from_secs(100), Duration::from_secs(1000));
        pacer.record_failure(); // 200s
        let lo = Duration::from_secs(160);
        let hi = Duration::from_secs(240);
        for _ in 0..50 {
            let j = pacer.jittered_interval();
            assert!(j >= lo && j <= hi, "{j:?} outside ±20% of 200s");
        }
    }
}
