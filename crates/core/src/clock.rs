//! Injectable wall clock.
//!
//! Every time computation in the cron jobs and the subscription service goes
//! through a [`Clock`] so tests can pin "now".

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Source of the current UTC instant.
#[derive(Clone)]
pub struct Clock {
    now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Clock {
    /// Wall clock (UTC).
    pub fn system() -> Self {
        Self {
            now: Arc::new(Utc::now),
        }
    }

    /// Clock frozen at `at`.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(move || at),
        }
    }

    pub fn from_fn(f: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self { now: Arc::new(f) }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.now)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}

/// Midnight (00:00:00 UTC) of the day containing `at`.
pub fn start_of_utc_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// `n` whole days as a chrono duration (`n * 24h`).
pub fn days(n: u32) -> Duration {
    Duration::hours(24 * i64::from(n))
}
