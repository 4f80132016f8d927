//! Retry backoff for records that failed to sync.
//!
//! `delay = min(30s, 1s * 2^attempts) + jitter`, jitter in `[0, 1000)` ms.
//! The jitter is seeded from the record id and attempt count so the same
//! record computes the same cooldown on every sweep, while records that
//! failed together (e.g. after an outage) spread their retries out.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const BASE_DELAY_MS: u64 = 1_000;
pub const MAX_DELAY_MS: u64 = 30_000;
pub const MAX_JITTER_MS: u64 = 1_000;

/// Exponential part of the delay, capped at `MAX_DELAY_MS`.
pub fn base_delay_ms(attempts: u32) -> u64 {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS)
}

fn jitter_ms(seed: i64, attempts: u32) -> u64 {
    let mixed = (seed as u64).rotate_left(32) ^ u64::from(attempts);
    StdRng::seed_from_u64(mixed).gen_range(0..MAX_JITTER_MS)
}

/// Wait before the next attempt of record `seed` after `attempts` failures.
pub fn backoff_ms(attempts: u32, seed: i64) -> u64 {
    base_delay_ms(attempts) + jitter_ms(seed, attempts)
}

/// Earliest instant a record may be retried.
pub fn next_eligible_at(last_attempt: DateTime<Utc>, attempts: u32, seed: i64) -> DateTime<Utc> {
    last_attempt + ChronoDuration::milliseconds(backoff_ms(attempts, seed) as i64)
}

/// A record with no prior attempt is always ready.
pub fn is_ready(
    last_attempt: Option<DateTime<Utc>>,
    attempts: u32,
    seed: i64,
    now: DateTime<Utc>,
) -> bool {
    match last_attempt {
        None => true,
        Some(_) if attempts == 0 => true,
        Some(at) => now >= next_eligible_at(at, attempts, seed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_until_cap() {
        assert_eq!(base_delay_ms(0), 1_000);
        assert_eq!(base_delay_ms(1), 2_000);
        assert_eq!(base_delay_ms(2), 4_000);
        assert_eq!(base_delay_ms(4), 16_000);
        assert_eq!(base_delay_ms(5), 30_000);
        assert_eq!(base_delay_ms(9), 30_000);
    }

    #[test]
    fn test_large_attempt_counts_saturate() {
        assert_eq!(base_delay_ms(63), MAX_DELAY_MS);
        assert_eq!(base_delay_ms(64), MAX_DELAY_MS);
        assert_eq!(base_delay_ms(u32::MAX), MAX_DELAY_MS);
    }

    #[test]
    fn test_jitter_is_bounded_and_stable() {
        for seed in [1_i64, 7, 42, 9_999, -3] {
            for attempts in 0..12 {
                let delay = backoff_ms(attempts, seed);
                let base = base_delay_ms(attempts);
                assert!(delay >= base, "delay {delay} below base {base}");
                assert!(delay < base + MAX_JITTER_MS, "delay {delay} too high");
                assert_eq!(delay, backoff_ms(attempts, seed));
            }
        }
    }

    #[test]
    fn test_is_ready_respects_cooldown() {
        let last = Utc::now();
        let seed = 12;

        assert!(is_ready(None, 3, seed, last));
        assert!(!is_ready(Some(last), 1, seed, last + ChronoDuration::milliseconds(1_500)));
        assert!(is_ready(Some(last), 1, seed, last + ChronoDuration::milliseconds(3_000)));
        assert!(!is_ready(Some(last), 8, seed, last + ChronoDuration::seconds(29)));
        assert!(is_ready(Some(last), 8, seed, last + ChronoDuration::seconds(31)));
    }
}
