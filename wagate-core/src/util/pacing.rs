//! Pure delay calculations shared by the engines. All randomness comes in
//! through the caller's `Rng` so tests can seed a `StdRng`.

use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff: `min(base * 2^(attempt-1), cap)`.
/// Attempts are 1-based; attempt 0 is treated as 1.
pub fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exp);
    delay.min(cap)
}

/// Multiplicative jitter in [-20%, +20%], clamped to [min_ms, max_ms].
pub fn jittered_delay_ms(base_ms: i64, min_ms: i64, max_ms: i64, rng: &mut impl Rng) -> i64 {
    let factor: f64 = rng.gen_range(0.8..=1.2);
    let jittered = (base_ms as f64 * factor).round() as i64;
    jittered.clamp(min_ms, max_ms)
}

/// Human-typing simulation: `max(1.5s, words * 200ms + U(-1s, +1s))`,
/// capped at 8s.
pub fn typing_delay(word_count: usize, rng: &mut impl Rng) -> Duration {
    let base_ms = word_count as i64 * 200;
    let noise_ms: i64 = rng.gen_range(-1000..=1000);
    let ms = (base_ms + noise_ms).max(1500).min(8000);
    Duration::from_millis(ms as u64)
}

/// Pause between "typing stopped" and the actual send: U(300, 800) ms.
pub fn settle_delay(rng: &mut impl Rng) -> Duration {
    Duration::from_millis(rng.gen_range(300..=800))
}

/// Read-mark delay derived from message length: U(0.5s, 2s) base plus
/// ~50ms per character, capped at 3s of length-derived delay.
pub fn read_mark_delay(content_len: usize, rng: &mut impl Rng) -> Duration {
    let base_ms: u64 = rng.gen_range(500..=2000);
    let length_ms = (content_len as u64 * 50).min(3000);
    Duration::from_millis(base_ms + length_ms)
}

/// Uniform delay in [min, max], used between scraped groups.
pub fn uniform_delay(min: Duration, max: Duration, rng: &mut impl Rng) -> Duration {
    if max <= min {
        return min;
    }
    Duration::from_millis(rng.gen_range(min.as_millis() as u64..=max.as_millis() as u64))
}
