//! Multiplicative-decrease / additive-increase batch size controller.

use crate::config::QuotaConfig;

/// Self-tuning batch size bounded to `[min, max]`.
///
/// A run of `failure_threshold` failures halves the size (never below `min`);
/// a run of `success_threshold` successes grows it by one (never above `max`).
/// Any opposite signal resets the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveBatch {
    current: usize,
    min: usize,
    max: usize,
    failure_threshold: u32,
    success_threshold: u32,
    failure_run: u32,
    success_run: u32,
}

impl AdaptiveBatch {
    #[must_use]
    pub fn new(config: &QuotaConfig) -> Self {
        let min = config.min_batch_size.max(1);
        let max = config.max_batch_size.max(min);
        Self {
            current: config.default_batch_size.clamp(min, max),
            min,
            max,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            failure_run: 0,
            success_run: 0,
        }
    }

    #[must_use]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Record a failed or throttled call. Returns `true` if the size changed.
    pub fn on_failure(&mut self) -> bool {
        self.success_run = 0;
        self.failure_run += 1;
        if self.failure_run < self.failure_threshold {
            return false;
        }
        self.failure_run = 0;
        let next = (self.current / 2).max(self.min);
        let changed = next != self.current;
        self.current = next;
        changed
    }

    /// Record a successful call. Returns `true` if the size changed.
    pub fn on_success(&mut self) -> bool {
        self.failure_run = 0;
        self.success_run += 1;
        if self.success_run < self.success_threshold {
            return false;
        }
        self.success_run = 0;
        let next = (self.current + 1).min(self.max);
        let changed = next != self.current;
        self.current = next;
        changed
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn batch(min: usize, default: usize, max: usize, fail: u32, ok: u32) -> AdaptiveBatch {
        AdaptiveBatch::new(
            &QuotaConfig::default()
                .with_batch_bounds(min, default, max)
                .with_thresholds(fail, ok),
        )
    }

    #[test]
    fn starts_at_default() {
        assert_eq!(batch(1, 16, 64, 1, 5).current(), 16);
    }

    #[test]
    fn default_outside_bounds_is_clamped() {
        assert_eq!(batch(4, 100, 32, 1, 5).current(), 32);
        assert_eq!(batch(4, 1, 32, 1, 5).current(), 4);
    }

    #[test]
    fn failure_halves_down_to_floor() {
        let mut b = batch(1, 16, 64, 1, 5);
        assert!(b.on_failure());
        assert_eq!(b.current(), 8);
        b.on_failure();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.current(), 1);
        assert!(!b.on_failure());
        assert_eq!(b.current(), 1);
    }

    #[test]
    fn failure_threshold_requires_a_run() {
        let mut b = batch(1, 16, 64, 3, 5);
        b.on_failure();
        b.on_failure();
        assert_eq!(b.current(), 16);
        b.on_success();
        b.on_failure();
        b.on_failure();
        assert_eq!(b.current(), 16, "success must reset the failure run");
        b.on_failure();
        assert_eq!(b.current(), 8);
    }

    #[test]
    fn sustained_success_grows_by_one() {
        let mut b = batch(1, 4, 6, 1, 2);
        b.on_success();
        assert_eq!(b.current(), 4);
        assert!(b.on_success());
        assert_eq!(b.current(), 5);
        for _ in 0..10 {
            b.on_success();
        }
        assert_eq!(b.current(), 6);
    }

    #[test]
    fn zero_min_is_treated_as_one() {
        let mut b = batch(0, 2, 8, 1, 1);
        b.on_failure();
        b.on_failure();
        assert_eq!(b.current(), 1);
    }

    proptest! {
        #[test]
        fn size_always_within_bounds(
            min in 1usize..8,
            span in 0usize..64,
            default in 0usize..128,
            signals in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let max = min + span;
            let mut b = batch(min, default, max, 2, 3);
            for ok in signals {
                if ok { b.on_success(); } else { b.on_failure(); }
                prop_assert!(b.current() >= min);
                prop_assert!(b.current() <= max);
            }
        }
    }
}
