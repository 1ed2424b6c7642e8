//! Idle-poll backoff with additive jitter.

use std::time::Duration;

use rand::Rng;

/// `base * factor^attempt`, plus up to the same amount again of jitter, capped at `max`.
///
/// `jitter` is a uniform sample from `[0, 1)`; the result never drops below the unjittered
/// delay, so workers that start together drift apart instead of synchronising.
pub fn backoff_delay(
    base: Duration,
    factor: f64,
    attempt: u32,
    jitter: f64,
    max: Duration,
) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay_ms = base.as_millis() as f64 * factor.max(1.0).powi(exponent);
    let jittered_ms = delay_ms + jitter.clamp(0.0, 1.0) * delay_ms;
    let capped_ms = jittered_ms.min(max.as_millis() as f64);
    Duration::from_millis(capped_ms.max(0.0) as u64)
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self {
            base,
            factor,
            max,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the current idle streak; advances the streak.
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        let delay = backoff_delay(self.base, self.factor, self.attempt, jitter, self.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Duration = Duration::from_secs(3600);

    #[test]
    fn delay_grows_geometrically_with_additive_jitter() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 2.0, 0, 0.0, MAX), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2.0, 1, 0.5, MAX), Duration::from_secs(3));
        assert_eq!(backoff_delay(base, 2.0, 2, 1.0, MAX), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_capped() {
        let delay = backoff_delay(
            Duration::from_millis(1000),
            2.0,
            20,
            0.9,
            Duration::from_secs(30),
        );
        assert_eq!(delay, Duration::from_secs(30));
    }

    #[test]
    fn jitter_never_shortens_the_base_delay() {
        let mut backoff = Backoff::new(Duration::from_millis(100), 2.0, MAX);
        for attempt in 0..5u32 {
            let floor = Duration::from_millis(100 * 2u64.pow(attempt));
            let delay = backoff.next_delay();
            assert!(delay >= floor, "attempt {attempt}: {delay:?} < {floor:?}");
            assert!(delay <= floor * 2);
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
