//! Deterministic fakes shared by the engine unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::util::Clock;

/// Clock whose `sleep` returns immediately after advancing internal time,
/// so pacing-heavy paths run instantly and windows can be stepped exactly.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    pub slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            slept: Mutex::new(Vec::new()),
        }
    }

    pub fn epoch() -> Self {
        Self::at(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    pub fn advance(&self, dur: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(dur).unwrap();
    }

    pub fn total_slept(&self) -> Duration {
        self.slept.lock().unwrap().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, dur: Duration) {
        self.advance(dur);
        self.slept.lock().unwrap().push(dur);
    }
}
