//! Exponential backoff delays for retrying uploads.

use {rand::Rng, std::time::Duration};

const DEFAULT_FACTOR: f64 = 2.0;
const DEFAULT_JITTER: f64 = 1.0;

/// A finite sequence of `count` growing delays.
///
/// The first delay is `start`, every next one is the previous multiplied by
/// `factor` and capped at `stop`. With a non-zero `jitter`, each yielded
/// delay is shortened by a random share of up to `jitter` of itself; the
/// growth is computed from the un-jittered values.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    stop: Duration,
    remaining: usize,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(start: Duration, stop: Duration, count: usize) -> Self {
        Self {
            current: start,
            stop: stop.max(start),
            remaining: count,
            factor: DEFAULT_FACTOR,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Growth multiplier, at least 1.
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_finite() {
            factor.max(1.0)
        } else {
            DEFAULT_FACTOR
        };
        self
    }

    /// Share of each delay that may be randomly taken off, within `0..=1`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }

        let cut = self.jitter * rand::thread_rng().gen::<f64>();
        delay.mul_f64(1.0 - cut)
    }

    fn advance(&mut self) {
        if self.current.is_zero() {
            self.current = Duration::from_secs(1);
        } else if self.current < self.stop {
            self.current = self.current.mul_f64(self.factor);
        }

        self.current = self.current.min(self.stop);
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;
        let delay = self.jittered(self.current);
        self.advance();

        Some(delay)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Backoff {}

#[cfg(test)]
mod tests {
    use {super::*, proptest::prelude::*};

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn doubles_until_capped() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 6)
            .jitter(0.0)
            .collect();

        assert_eq!(delays, secs(&[1, 2, 4, 8, 10, 10]));
    }

    #[test]
    fn custom_factor() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(1), Duration::from_secs(100), 4)
            .factor(3.0)
            .jitter(0.0)
            .collect();

        assert_eq!(delays, secs(&[1, 3, 9, 27]));
    }

    #[test]
    fn zero_start_grows_to_one_second() {
        let delays: Vec<_> = Backoff::new(Duration::ZERO, Duration::from_secs(5), 4)
            .jitter(0.0)
            .collect();

        assert_eq!(delays, secs(&[0, 1, 2, 4]));
    }

    #[test]
    fn zero_start_respects_small_cap() {
        let delays: Vec<_> = Backoff::new(Duration::ZERO, Duration::from_millis(300), 3)
            .jitter(0.0)
            .collect();

        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(300),
                Duration::from_millis(300)
            ]
        );
    }

    #[test]
    fn stop_below_start_is_raised_to_start() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 3)
            .jitter(0.0)
            .collect();

        assert_eq!(delays, secs(&[5, 5, 5]));
    }

    #[test]
    fn zero_count_is_empty() {
        assert_eq!(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(2), 0).count(),
            0
        );
    }

    #[test]
    fn out_of_range_settings_are_clamped() {
        let delays: Vec<_> = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 3)
            .factor(0.5)
            .jitter(-1.0)
            .collect();

        assert_eq!(delays, secs(&[2, 2, 2]));
    }

    proptest! {
        #[test]
        fn sequence_without_jitter(
            start_ms in 1u64..10_000,
            extra_ms in 0u64..100_000,
            count in 0usize..40,
            factor in 1.5f64..4.0,
        ) {
            let start = Duration::from_millis(start_ms);
            let stop = start + Duration::from_millis(extra_ms);
            let delays: Vec<_> = Backoff::new(start, stop, count)
                .factor(factor)
                .jitter(0.0)
                .collect();

            prop_assert_eq!(delays.len(), count);

            if let Some(first) = delays.first() {
                prop_assert_eq!(*first, start);
            }

            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
                prop_assert_eq!(pair[1], pair[0].mul_f64(factor).min(stop));
            }

            prop_assert!(delays.iter().all(|delay| *delay <= stop));
        }

        #[test]
        fn jitter_only_shortens(
            start_ms in 1u64..10_000,
            count in 1usize..20,
            jitter in 0.0f64..=1.0,
        ) {
            let start = Duration::from_millis(start_ms);
            let stop = start * 50;
            let plain: Vec<_> = Backoff::new(start, stop, count).jitter(0.0).collect();
            let jittered: Vec<_> = Backoff::new(start, stop, count).jitter(jitter).collect();

            prop_assert_eq!(plain.len(), jittered.len());

            for (plain, jittered) in plain.iter().zip(&jittered) {
                prop_assert!(jittered <= plain);
                prop_assert!(*jittered >= plain.mul_f64(1.0 - jitter));
            }
        }
    }
}
