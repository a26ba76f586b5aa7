//! Exponential backoff with deterministic jitter (spec.md §4.4):
//! `delay = min(retry_backoff * 2^(attempt-1), max_retry_backoff)`, jitter
//! of ±25% derived deterministically from the attempt number so retries
//! of the same attempt always compute the same delay. A `Retry-After`
//! response header, when present and parseable, overrides the computed
//! delay for that attempt only.

use std::time::Duration;

/// Deterministic pseudo-random value in `[-0.25, 0.25)`, keyed only by
/// `attempt` (splitmix64 finalizer — cheap, stable, no external RNG
/// dependency needed for this one-shot derivation).
fn jitter_fraction(attempt: i32) -> f64 {
    let mut x = (attempt as u64).wrapping_mul(0x9E3779B97F4A7C15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58476D1CE4E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D049BB133111EB);
    x ^= x >> 31;
    let unit = (x >> 11) as f64 / (1u64 << 53) as f64; // [0, 1)
    (unit * 0.5) - 0.25
}

pub fn compute_backoff(
    attempt: i32,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    if let Some(retry_after) = retry_after {
        return retry_after;
    }

    let exponent = attempt.max(1).saturating_sub(1).min(32) as u32;
    let base_millis = (retry_backoff.as_millis() as u64).saturating_mul(1u64 << exponent);
    let capped_millis = base_millis.min(max_retry_backoff.as_millis() as u64);

    let jittered = capped_millis as f64 * (1.0 + jitter_fraction(attempt));
    Duration::from_millis(jittered.max(0.0) as u64)
}

/// Parses an HTTP `Retry-After` header value, supporting only the
/// delay-seconds form (the only one agent/webhook receivers in this
/// system are expected to emit).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_waits_base_backoff() {
        let delay = compute_backoff(1, Duration::from_secs(10), Duration::from_secs(600), None);
        let expected = Duration::from_secs(10);
        let diff = delay.as_millis().abs_diff(expected.as_millis());
        assert!(diff <= expected.as_millis() / 4);
    }

    #[test]
    fn caps_at_max_backoff() {
        let delay = compute_backoff(10, Duration::from_secs(10), Duration::from_secs(60), None);
        assert!(delay <= Duration::from_millis(60_000 + 60_000 / 4));
    }

    #[test]
    fn is_deterministic_per_attempt() {
        let a = compute_backoff(3, Duration::from_secs(5), Duration::from_secs(300), None);
        let b = compute_backoff(3, Duration::from_secs(5), Duration::from_secs(300), None);
        assert_eq!(a, b);
    }

    #[test]
    fn retry_after_overrides_computed_delay() {
        let delay = compute_backoff(5, Duration::from_secs(5), Duration::from_secs(300), Some(Duration::from_secs(2)));
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn parses_delay_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("not-a-number"), None);
    }
}
