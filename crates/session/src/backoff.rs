use std::time::Duration;

use rand::Rng;

/// `min(base * 2^attempt, cap)` in milliseconds, saturating.
pub fn capped_delay_ms(base_ms: u64, cap_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

/// Reconnection delay for `attempt` (0-based): the capped exponential delay
/// plus up to 10% of it as random jitter.
pub fn backoff_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let capped = capped_delay_ms(base_ms, cap_ms, attempt);
    let jitter_max = capped / 10;
    let jitter = if jitter_max == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_max)
    };
    Duration::from_millis(capped.saturating_add(jitter))
}
