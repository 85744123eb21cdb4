//! Daily reset of API key usage.
//!
//! Provider quotas are per day, so counters go back to zero once a day at a fixed local time.

use super::QuotaStore;
use chrono::{DateTime, FixedOffset, NaiveTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// First instant strictly after `now` whose wall-clock time at `offset` is `at`.
pub fn next_reset_after(now: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local_now = now.naive_utc() + TimeDelta::seconds(i64::from(offset.local_minus_utc()));
    let mut candidate = local_now.date().and_time(at);
    if candidate <= local_now {
        candidate += TimeDelta::days(1);
    }
    DateTime::<Utc>::from_naive_utc_and_offset(candidate - TimeDelta::seconds(i64::from(offset.local_minus_utc())), Utc)
}

/// Background task that resets every key's usage once a day.
pub struct QuotaResetDaemon {
    store: Arc<dyn QuotaStore>,
    at: NaiveTime,
    offset: FixedOffset,
}

impl QuotaResetDaemon {
    pub fn new(store: Arc<dyn QuotaStore>, at: NaiveTime, offset: FixedOffset) -> Self {
        Self { store, at, offset }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let now = Utc::now();
            let next = next_reset_after(now, self.at, self.offset);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(
                next_reset = %next,
                "Next API key usage reset in {}",
                humantime::format_duration(Duration::from_secs(wait.as_secs()))
            );

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Quota reset daemon shutting down");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.reset_now().await;
        }
    }

    /// Reset immediately, logging the outcome.
    pub async fn reset_now(&self) {
        match self.store.reset_usage().await {
            Ok(keys) => info!(keys, "API key usage reset"),
            Err(e) => error!(error = %e, "Failed to reset API key usage"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::InMemoryQuotaStore;
    use chrono::TimeZone;

    fn seoul() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[test]
    fn next_reset_later_today() {
        // 2024-05-01 15:00 UTC is 2024-05-02 00:00 in UTC+9; 01:00 local is 16:00 UTC.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap();
        let next = next_reset_after(now, NaiveTime::from_hms_opt(1, 0, 0).unwrap(), seoul());
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap());
    }

    #[test]
    fn next_reset_rolls_over_to_tomorrow() {
        let at = NaiveTime::from_hms_opt(1, 0, 0).unwrap();
        let exactly_at = Utc.with_ymd_and_hms(2024, 5, 1, 16, 0, 0).unwrap();
        assert_eq!(
            next_reset_after(exactly_at, at, seoul()),
            Utc.with_ymd_and_hms(2024, 5, 2, 16, 0, 0).unwrap()
        );

        let after = Utc.with_ymd_and_hms(2024, 5, 1, 20, 30, 0).unwrap();
        assert_eq!(next_reset_after(after, at, seoul()), Utc.with_ymd_and_hms(2024, 5, 2, 16, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn daemon_stops_on_cancel() {
        let store = Arc::new(InMemoryQuotaStore::with_usage("CC004", "API_KEY", &[3]));
        let daemon = QuotaResetDaemon::new(store.clone(), NaiveTime::from_hms_opt(1, 0, 0).unwrap(), seoul());
        let token = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(store.usage_of("secret-1").await, Some(3));
    }

    #[tokio::test]
    async fn reset_now_clears_counters() {
        let store = Arc::new(InMemoryQuotaStore::with_usage("CC004", "API_KEY", &[3, 50]));
        let daemon = QuotaResetDaemon::new(store.clone(), NaiveTime::MIN, FixedOffset::east_opt(0).unwrap());
        daemon.reset_now().await;
        assert_eq!(store.usage_of("secret-2").await, Some(0));
    }
}
