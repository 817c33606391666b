//! Per-session send admission. Counters live in the `whatsapp_rate_limits`
//! row; the repository's single-statement updates serialize concurrent
//! senders on the row lock. Counters are approximate by design: they zero
//! on the first activity after a window lapses.

use std::env;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use tracing::debug;

use wagate_common::models::RateBucket;
use wagate_common::Error;

use crate::repositories::RateLimitRepository;
use crate::util::{pacing, Clock};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Reserved for a future rolling-window variant.
    pub messages_per_minute: i32,
    pub messages_per_hour: i32,
    pub messages_per_day: i32,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
    pub cooldown_after_messages: i32,
    pub cooldown_duration_ms: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            messages_per_minute: 10,
            messages_per_hour: 100,
            messages_per_day: 1000,
            min_delay_ms: 2000,
            max_delay_ms: 5000,
            cooldown_after_messages: 50,
            cooldown_duration_ms: 300_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            messages_per_minute: env_parse("WAGATE_MESSAGES_PER_MINUTE", d.messages_per_minute),
            messages_per_hour: env_parse("WAGATE_MESSAGES_PER_HOUR", d.messages_per_hour),
            messages_per_day: env_parse("WAGATE_MESSAGES_PER_DAY", d.messages_per_day),
            min_delay_ms: env_parse("WAGATE_MIN_DELAY_MS", d.min_delay_ms),
            max_delay_ms: env_parse("WAGATE_MAX_DELAY_MS", d.max_delay_ms),
            cooldown_after_messages: env_parse(
                "WAGATE_COOLDOWN_AFTER_MESSAGES",
                d.cooldown_after_messages,
            ),
            cooldown_duration_ms: env_parse("WAGATE_COOLDOWN_DURATION_MS", d.cooldown_duration_ms),
        }
    }
}

/// Outcome of an admission check. When `can_send` is false, `delay_ms` is
/// how long the caller should wait before retrying.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub can_send: bool,
    pub delay_ms: i64,
    pub reason: Option<String>,
}

impl RateDecision {
    fn denied(delay_ms: i64, reason: impl Into<String>) -> Self {
        Self {
            can_send: false,
            delay_ms,
            reason: Some(reason.into()),
        }
    }

    pub fn into_error(self) -> Error {
        Error::RateLimited {
            reason: self
                .reason
                .unwrap_or_else(|| "rate limit reached".to_string()),
            retry_after_ms: self.delay_ms,
        }
    }
}

pub struct RateLimiter {
    repo: Arc<dyn RateLimitRepository>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        repo: Arc<dyn RateLimitRepository>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        Self { repo, clock, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admission check. Refreshes the bucket windows, then applies, in
    /// order: cooldown, hourly ceiling, daily ceiling. When admitted, the
    /// returned delay scales with hourly usage plus jitter.
    pub async fn check(&self, session_id: &str) -> Result<RateDecision, Error> {
        let now = self.clock.now();
        let bucket = self.repo.refresh(session_id, now).await?;

        if let Some(until) = bucket.cooldown_until {
            if until > now {
                let remaining = (until - now).num_milliseconds().max(0);
                debug!(
                    session_id,
                    remaining_ms = remaining,
                    "send denied: cooldown active"
                );
                return Ok(RateDecision::denied(
                    remaining,
                    format!("cooldown active for another {}s", remaining / 1000),
                ));
            }
        }

        if bucket.messages_last_hour >= self.config.messages_per_hour {
            return Ok(RateDecision::denied(
                ChronoDuration::hours(1).num_milliseconds(),
                format!(
                    "hourly rate limit reached ({}/{})",
                    bucket.messages_last_hour, self.config.messages_per_hour
                ),
            ));
        }

        if bucket.messages_today >= self.config.messages_per_day {
            return Ok(RateDecision::denied(
                ChronoDuration::hours(24).num_milliseconds(),
                format!(
                    "daily rate limit reached ({}/{})",
                    bucket.messages_today, self.config.messages_per_day
                ),
            ));
        }

        Ok(RateDecision {
            can_send: true,
            delay_ms: self.adaptive_delay(&bucket),
            reason: None,
        })
    }

    /// Count one completed send. The repository arms the cooldown when the
    /// hour counter crosses the threshold.
    pub async fn record_sent(&self, session_id: &str) -> Result<(), Error> {
        let now = self.clock.now();
        let bucket = self
            .repo
            .record_sent(
                session_id,
                now,
                self.config.cooldown_after_messages,
                self.config.cooldown_duration_ms,
            )
            .await?;
        if bucket.in_cooldown(now) {
            debug!(
                session_id,
                hour_count = bucket.messages_last_hour,
                "cooldown armed after send burst"
            );
        }
        Ok(())
    }

    /// Base delay grows linearly with hourly usage inside the configured
    /// envelope, with +-20% jitter.
    fn adaptive_delay(&self, bucket: &RateBucket) -> i64 {
        let min = self.config.min_delay_ms;
        let max = self.config.max_delay_ms;
        let load = bucket.messages_last_hour as f64 / self.config.messages_per_hour.max(1) as f64;
        let base = min + ((max - min) as f64 * load).round() as i64;
        pacing::jittered_delay_ms(base, min, max, &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::postgres::rate_limits::MockRateLimitRepository;
    use crate::test_utils::ManualClock;
    use chrono::Duration as ChronoDuration;

    fn bucket(hour: i32, day: i32) -> RateBucket {
        let mut b = RateBucket::empty("s1");
        b.messages_last_hour = hour;
        b.messages_today = day;
        b
    }

    fn limiter(repo: MockRateLimitRepository, clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(Arc::new(repo), clock, RateLimitConfig::default())
    }

    #[tokio::test]
    async fn admits_under_all_ceilings() {
        let clock = Arc::new(ManualClock::epoch());
        let mut repo = MockRateLimitRepository::new();
        repo.expect_refresh().returning(|_, _| Ok(bucket(10, 50)));

        let decision = limiter(repo, clock).check("s1").await.unwrap();
        assert!(decision.can_send);
        assert!(decision.delay_ms >= 2000 && decision.delay_ms <= 5000);
        assert!(decision.reason.is_none());
    }

    #[tokio::test]
    async fn denies_during_cooldown_with_remaining_delay() {
        let clock = Arc::new(ManualClock::epoch());
        let until = clock.now() + ChronoDuration::minutes(4);
        let mut repo = MockRateLimitRepository::new();
        repo.expect_refresh().returning(move |_, _| {
            let mut b = bucket(55, 200);
            b.cooldown_until = Some(until);
            Ok(b)
        });

        let decision = limiter(repo, clock).check("s1").await.unwrap();
        assert!(!decision.can_send);
        assert_eq!(decision.delay_ms, ChronoDuration::minutes(4).num_milliseconds());
        assert!(decision.reason.unwrap().contains("cooldown"));
    }

    #[tokio::test]
    async fn denies_at_hourly_ceiling() {
        let clock = Arc::new(ManualClock::epoch());
        let mut repo = MockRateLimitRepository::new();
        repo.expect_refresh().returning(|_, _| Ok(bucket(100, 300)));

        let decision = limiter(repo, clock).check("s1").await.unwrap();
        assert!(!decision.can_send);
        assert_eq!(decision.delay_ms, 3_600_000);
        assert!(decision.reason.unwrap().contains("hourly rate limit"));
    }

    #[tokio::test]
    async fn denies_at_daily_ceiling() {
        let clock = Arc::new(ManualClock::epoch());
        let mut repo = MockRateLimitRepository::new();
        repo.expect_refresh().returning(|_, _| Ok(bucket(10, 1000)));

        let decision = limiter(repo, clock).check("s1").await.unwrap();
        assert!(!decision.can_send);
        assert_eq!(decision.delay_ms, 86_400_000);
        assert!(decision.reason.unwrap().contains("daily rate limit"));
    }

    #[tokio::test]
    async fn adaptive_delay_grows_with_hourly_load() {
        // With zero jitter impossible, compare band midpoints over many
        // samples: a loaded bucket must average a longer delay.
        let clock = Arc::new(ManualClock::epoch());
        let mut repo = MockRateLimitRepository::new();
        let mut toggle = false;
        repo.expect_refresh().returning(move |_, _| {
            toggle = !toggle;
            Ok(if toggle { bucket(0, 0) } else { bucket(90, 90) })
        });
        let limiter = limiter(repo, clock);

        let mut idle_total = 0i64;
        let mut loaded_total = 0i64;
        for _ in 0..50 {
            idle_total += limiter.check("s1").await.unwrap().delay_ms;
            loaded_total += limiter.check("s1").await.unwrap().delay_ms;
        }
        assert!(
            loaded_total > idle_total,
            "loaded delays ({}) should exceed idle delays ({})",
            loaded_total,
            idle_total
        );
    }

    #[tokio::test]
    async fn record_sent_passes_cooldown_config_through() {
        let clock = Arc::new(ManualClock::epoch());
        let mut repo = MockRateLimitRepository::new();
        repo.expect_record_sent()
            .withf(|sid, _, threshold, duration| {
                sid == "s1" && *threshold == 50 && *duration == 300_000
            })
            .returning(|_, now, _, _| {
                let mut b = bucket(50, 50);
                b.cooldown_until = Some(now + ChronoDuration::milliseconds(300_000));
                Ok(b)
            });

        limiter(repo, clock).record_sent("s1").await.unwrap();
    }
}
