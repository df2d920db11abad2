//! Durable snapshot of the task cache.
//!
//! The whole persistable part of the cache lives in one JSON blob under
//! [`SNAPSHOT_KEY`]. Entries older than the TTL are dropped when the blob is
//! loaded; nothing expires in memory. Store failures are logged and swallowed:
//! they never fail the cache operation that triggered them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::TaskItem;

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::store::DurableStore;

/// Well-known store key for the snapshot blob
pub const SNAPSHOT_KEY: &str = "task_cache";

/// Persisted task lists are discarded at load once older than this.
pub const DEFAULT_TTL_DAYS: i64 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub items: Vec<TaskItem>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedSnapshot {
    pub entries: BTreeMap<CacheKey, PersistedEntry>,
}

impl PersistedSnapshot {
    /// Keep only settled, successful entries.
    pub fn from_entries<'a>(entries: impl Iterator<Item = (&'a CacheKey, &'a CacheEntry)>) -> Self {
        let entries = entries
            .filter(|(_, entry)| entry.is_persistable())
            .filter_map(|(key, entry)| {
                let items = entry.items.clone()?;
                Some((
                    key.clone(),
                    PersistedEntry {
                        items,
                        timestamp: entry.timestamp,
                    },
                ))
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries older than `ttl` as of `now`. An entry exactly `ttl` old
    /// is kept. Returns the number dropped.
    pub fn retain_fresh(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.timestamp <= ttl);
        before - self.entries.len()
    }
}

pub struct PersistenceSynchronizer {
    store: Arc<dyn DurableStore>,
    ttl: Duration,
    /// Serializes flushes so the snapshot written last is always the newest
    flush_lock: Mutex<()>,
}

impl PersistenceSynchronizer {
    pub fn new(store: Arc<dyn DurableStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn load(&self) -> PersistedSnapshot {
        self.load_at(Utc::now()).await
    }

    /// Read the blob and apply the TTL as of `now`. A missing, unreadable or
    /// unparsable blob yields an empty snapshot.
    pub async fn load_at(&self, now: DateTime<Utc>) -> PersistedSnapshot {
        let contents = match self.store.get(SNAPSHOT_KEY).await {
            Ok(Some(contents)) => contents,
            Ok(None) => {
                debug!("No persisted task cache");
                return PersistedSnapshot::default();
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted task cache");
                return PersistedSnapshot::default();
            }
        };

        let mut snapshot: PersistedSnapshot = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Discarding unparsable task cache");
                return PersistedSnapshot::default();
            }
        };

        let expired = snapshot.retain_fresh(now, self.ttl);
        info!(kept = snapshot.len(), expired = expired, "Loaded persisted task cache");
        snapshot
    }

    /// Write the snapshot produced by `snapshot` while holding the flush lock.
    /// The closure runs only once earlier flushes have landed, so it sees
    /// the latest cache state.
    pub async fn flush_with<F>(&self, snapshot: F)
    where
        F: FnOnce() -> PersistedSnapshot,
    {
        let _guard = self.flush_lock.lock().await;
        let snapshot = snapshot();
        self.write(&snapshot).await;
    }

    pub async fn save(&self, snapshot: &PersistedSnapshot) {
        let _guard = self.flush_lock.lock().await;
        self.write(snapshot).await;
    }

    /// Remove the blob entirely.
    pub async fn clear(&self) {
        let _guard = self.flush_lock.lock().await;
        if let Err(e) = self.store.remove(SNAPSHOT_KEY).await {
            warn!(error = %e, "Failed to remove persisted task cache");
        }
    }

    async fn write(&self, snapshot: &PersistedSnapshot) {
        if snapshot.is_empty() {
            if let Err(e) = self.store.remove(SNAPSHOT_KEY).await {
                warn!(error = %e, "Failed to remove empty task cache");
            }
            return;
        }

        let contents = match serde_json::to_string(snapshot) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "Failed to serialize task cache");
                return;
            }
        };
        match self.store.set(SNAPSHOT_KEY, &contents).await {
            Ok(()) => debug!(entries = snapshot.len(), "Persisted task cache"),
            Err(e) => warn!(error = %e, "Failed to persist task cache"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::models::TaskStatus;
    use chrono::NaiveDate;

    fn key(project: &str) -> CacheKey {
        CacheKey::new(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(), project).unwrap()
    }

    fn tasks() -> Vec<TaskItem> {
        vec![TaskItem::new("1", "Inspection", TaskStatus::Pending)]
    }

    fn snapshot_at(timestamp: DateTime<Utc>) -> PersistedSnapshot {
        let mut snapshot = PersistedSnapshot::default();
        snapshot.entries.insert(
            key("SiteA"),
            PersistedEntry {
                items: tasks(),
                timestamp,
            },
        );
        snapshot
    }

    #[test]
    fn test_ttl_boundary() {
        let ttl = Duration::days(DEFAULT_TTL_DAYS);
        let persisted_at = Utc::now();

        let mut exact = snapshot_at(persisted_at);
        assert_eq!(exact.retain_fresh(persisted_at + ttl, ttl), 0);
        assert_eq!(exact.len(), 1);

        let mut past = snapshot_at(persisted_at);
        let later = persisted_at + ttl + Duration::milliseconds(1);
        assert_eq!(past.retain_fresh(later, ttl), 1);
        assert!(past.is_empty());
    }

    #[test]
    fn test_from_entries_filters_unsettled() {
        let now = Utc::now();
        let loaded = CacheEntry::loaded(tasks(), now);
        let revalidating = loaded.begin_loading();
        let first_load = CacheEntry::loading(now);
        let failed = CacheEntry::failed("boom", now);
        let entries = [
            (key("Loaded"), loaded),
            (key("Revalidating"), revalidating),
            (key("FirstLoad"), first_load),
            (key("Failed"), failed),
        ];

        let snapshot = PersistedSnapshot::from_entries(entries.iter().map(|(k, e)| (k, e)));
        assert_eq!(snapshot.entries.keys().cloned().collect::<Vec<_>>(), vec![key("Loaded")]);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let timestamp = DateTime::parse_from_rfc3339("2024-01-05T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let json = serde_json::to_value(snapshot_at(timestamp)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "2024-01-05|SiteA": {
                    "items": [{"id": "1", "name": "Inspection", "status": "pending"}],
                    "timestamp": "2024-01-05T08:00:00Z"
                }
            })
        );
    }

    #[tokio::test]
    async fn test_load_applies_ttl() {
        let store = Arc::new(MemoryStore::new());
        let sync = PersistenceSynchronizer::new(store.clone(), Duration::days(DEFAULT_TTL_DAYS));
        let now = Utc::now();

        let mut snapshot = snapshot_at(now - Duration::days(1));
        snapshot.entries.insert(
            key("Old"),
            PersistedEntry {
                items: tasks(),
                timestamp: now - Duration::days(4),
            },
        );
        sync.save(&snapshot).await;

        let loaded = sync.load_at(now).await;
        assert_eq!(loaded.entries.keys().cloned().collect::<Vec<_>>(), vec![key("SiteA")]);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let store = Arc::new(MemoryStore::new());
        let sync = PersistenceSynchronizer::new(store.clone(), Duration::days(DEFAULT_TTL_DAYS));

        store.set_failing(true);
        sync.save(&snapshot_at(Utc::now())).await;
        assert!(sync.load().await.is_empty());
        sync.clear().await;
    }

    #[tokio::test]
    async fn test_unparsable_blob_loads_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(SNAPSHOT_KEY, "{not json").await.unwrap();
        let sync = PersistenceSynchronizer::new(store, Duration::days(DEFAULT_TTL_DAYS));
        assert!(sync.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_flush_removes_blob() {
        let store = Arc::new(MemoryStore::new());
        let sync = PersistenceSynchronizer::new(store.clone(), Duration::days(DEFAULT_TTL_DAYS));
        sync.save(&snapshot_at(Utc::now())).await;
        assert!(store.get(SNAPSHOT_KEY).await.unwrap().is_some());

        sync.flush_with(PersistedSnapshot::default).await;
        assert!(store.get(SNAPSHOT_KEY).await.unwrap().is_none());
    }
}
