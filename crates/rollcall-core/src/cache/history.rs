//! Range-keyed deduplication for attendance history requests.
//!
//! There is a single history resource per session, so the dedup state is one
//! global record rather than one per range. A request is dropped when the
//! same range is already in flight, or when the same range completed less
//! than the cooldown ago. Failures start the cooldown too.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::HistoryApi;
use crate::models::AttendanceDay;

use super::notify::{CacheEvent, ChangeNotifier};
use super::SessionContext;

/// Identical history requests within this window after completion are dropped.
pub const DEFAULT_HISTORY_COOLDOWN: Duration = Duration::from_millis(2000);

#[derive(Debug, Default)]
struct HistoryDedupState {
    last_range_key: Option<String>,
    last_completion: Option<Instant>,
    in_flight: bool,
}

/// What happened to a `fetch_range` call. Suppression is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryFetch {
    Fetched { days: usize },
    SuppressedInFlight,
    SuppressedCooldown,
    Failed(String),
}

/// The most recently loaded history range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: Vec<AttendanceDay>,
    pub fetched_at: DateTime<Utc>,
}

pub fn range_key(start: NaiveDate, end: NaiveDate) -> String {
    format!("{}:{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
}

pub struct HistoryDeduplicator {
    api: Arc<dyn HistoryApi>,
    session: SessionContext,
    notifier: Arc<ChangeNotifier>,
    cooldown: Duration,
    state: Mutex<HistoryDedupState>,
    latest: Mutex<Option<HistoryRange>>,
}

impl HistoryDeduplicator {
    pub fn new(
        api: Arc<dyn HistoryApi>,
        session: SessionContext,
        notifier: Arc<ChangeNotifier>,
        cooldown: Duration,
    ) -> Self {
        Self {
            api,
            session,
            notifier,
            cooldown,
            state: Mutex::new(HistoryDedupState::default()),
            latest: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, HistoryDedupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn latest(&self) -> Option<HistoryRange> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.state().in_flight
    }

    pub async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> HistoryFetch {
        let key = range_key(start, end);

        {
            let mut state = self.state();
            if state.last_range_key.as_deref() == Some(key.as_str()) {
                if state.in_flight {
                    debug!(range = %key, "History request already in flight");
                    return HistoryFetch::SuppressedInFlight;
                }
                if let Some(done) = state.last_completion {
                    if done.elapsed() < self.cooldown {
                        debug!(range = %key, "History request within cooldown");
                        return HistoryFetch::SuppressedCooldown;
                    }
                }
            }
            state.in_flight = true;
            state.last_range_key = Some(key.clone());
        }

        let result = self
            .api
            .fetch_history(&self.session.company, &self.session.employee, start, end)
            .await;

        let still_latest = {
            let mut state = self.state();
            state.in_flight = false;
            state.last_completion = Some(Instant::now());
            state.last_range_key.as_deref() == Some(key.as_str())
        };

        match result {
            Ok(days) => {
                let count = days.len();
                // A slower response for an older range must not replace a newer one
                if still_latest {
                    *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(HistoryRange {
                        start,
                        end,
                        days,
                        fetched_at: Utc::now(),
                    });
                    self.notifier.publish(CacheEvent::HistoryLoaded { range: key });
                }
                HistoryFetch::Fetched { days: count }
            }
            Err(e) => {
                warn!(range = %key, error = %e, "Failed to fetch attendance history");
                HistoryFetch::Failed(format!("{:#}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::ScriptedHistoryApi;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn dedup(api: Arc<ScriptedHistoryApi>) -> HistoryDeduplicator {
        HistoryDeduplicator::new(
            api,
            SessionContext::new("acme", "E-1001"),
            Arc::new(ChangeNotifier::new()),
            DEFAULT_HISTORY_COOLDOWN,
        )
    }

    #[test]
    fn test_range_key() {
        assert_eq!(range_key(date(2024, 1, 1), date(2024, 1, 31)), "2024-01-01:2024-01-31");
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_range_within_cooldown_is_suppressed() {
        let api = Arc::new(ScriptedHistoryApi::new());
        let history = dedup(api.clone());
        let (jan_start, jan_end) = (date(2024, 1, 1), date(2024, 1, 31));

        assert_eq!(history.fetch_range(jan_start, jan_end).await, HistoryFetch::Fetched { days: 1 });
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(history.fetch_range(jan_start, jan_end).await, HistoryFetch::SuppressedCooldown);
        assert_eq!(api.calls(), 1);

        // A different range always proceeds
        let feb = history.fetch_range(date(2024, 2, 1), date(2024, 2, 28)).await;
        assert_eq!(feb, HistoryFetch::Fetched { days: 1 });
        assert_eq!(api.calls(), 2);
        assert_eq!(history.latest().unwrap().start, date(2024, 2, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_range_after_cooldown_proceeds() {
        let api = Arc::new(ScriptedHistoryApi::new());
        let history = dedup(api.clone());
        let (start, end) = (date(2024, 1, 1), date(2024, 1, 31));

        history.fetch_range(start, end).await;
        tokio::time::advance(DEFAULT_HISTORY_COOLDOWN).await;
        assert_eq!(history.fetch_range(start, end).await, HistoryFetch::Fetched { days: 1 });
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_subject_to_cooldown() {
        let api = Arc::new(ScriptedHistoryApi::new());
        api.set_failing(true);
        let history = dedup(api.clone());
        let (start, end) = (date(2024, 1, 1), date(2024, 1, 31));

        assert!(matches!(history.fetch_range(start, end).await, HistoryFetch::Failed(_)));
        api.set_failing(false);
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(history.fetch_range(start, end).await, HistoryFetch::SuppressedCooldown);
        assert_eq!(api.calls(), 1);
        assert!(history.latest().is_none());
    }

    #[tokio::test]
    async fn test_same_range_in_flight_is_suppressed() {
        let api = Arc::new(ScriptedHistoryApi::new());
        let gate = api.hold();
        let history = Arc::new(dedup(api.clone()));
        let (start, end) = (date(2024, 1, 1), date(2024, 1, 31));

        let first = tokio::spawn({
            let history = history.clone();
            async move { history.fetch_range(start, end).await }
        });
        while api.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(history.is_in_flight());
        assert_eq!(history.fetch_range(start, end).await, HistoryFetch::SuppressedInFlight);

        gate.add_permits(1);
        assert_eq!(first.await.unwrap(), HistoryFetch::Fetched { days: 1 });
        assert!(!history.is_in_flight());
        assert_eq!(api.calls(), 1);
    }
}
