//! The session's task cache: fetch coordination, optimistic status edits,
//! persistence and change notification behind one handle.
//!
//! A `CacheManager` is built at session start and dropped at logout. It is
//! cheap to clone; clones share the same cache. The in-memory map is only
//! locked for synchronous transitions, never across network or disk I/O.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, HistoryApi, TaskApi};
use crate::models::{TaskItem, TaskStatus};

use super::entry::CacheEntry;
use super::history::{HistoryDeduplicator, HistoryFetch, HistoryRange, DEFAULT_HISTORY_COOLDOWN};
use super::key::CacheKey;
use super::map::{CacheMap, PendingMutation};
use super::notify::{CacheEvent, ChangeNotifier, Topic};
use super::persist::{PersistenceSynchronizer, DEFAULT_TTL_DAYS};
use super::store::DurableStore;
use super::CacheError;

/// Who the cached data belongs to; passed on every remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub company: String,
    pub employee: String,
}

impl SessionContext {
    pub fn new(company: impl Into<String>, employee: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            employee: employee.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Maximum age of a persisted task list at load time
    pub ttl: chrono::Duration,
    pub history_cooldown: std::time::Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::days(DEFAULT_TTL_DAYS),
            history_cooldown: DEFAULT_HISTORY_COOLDOWN,
        }
    }
}

struct Shared {
    api: Arc<dyn TaskApi>,
    session: SessionContext,
    map: Mutex<CacheMap>,
    persistence: PersistenceSynchronizer,
    notifier: Arc<ChangeNotifier>,
    history: HistoryDeduplicator,
    commits: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct CacheManager {
    shared: Arc<Shared>,
}

impl CacheManager {
    pub fn new(
        task_api: Arc<dyn TaskApi>,
        history_api: Arc<dyn HistoryApi>,
        store: Arc<dyn DurableStore>,
        session: SessionContext,
        options: CacheOptions,
    ) -> Self {
        let notifier = Arc::new(ChangeNotifier::new());
        let history = HistoryDeduplicator::new(
            history_api,
            session.clone(),
            notifier.clone(),
            options.history_cooldown,
        );

        Self {
            shared: Arc::new(Shared {
                api: task_api,
                session,
                map: Mutex::new(CacheMap::new()),
                persistence: PersistenceSynchronizer::new(store, options.ttl),
                notifier,
                history,
                commits: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build a manager whose task and history remotes are the same client.
    pub fn with_client(
        client: ApiClient,
        store: Arc<dyn DurableStore>,
        session: SessionContext,
        options: CacheOptions,
    ) -> Self {
        let client = Arc::new(client);
        Self::new(client.clone(), client, store, session, options)
    }

    fn map(&self) -> MutexGuard<'_, CacheMap> {
        self.shared.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self, event: CacheEvent) {
        self.shared.notifier.bump();
        self.shared.notifier.publish(event);
    }

    async fn flush(&self) {
        self.shared
            .persistence
            .flush_with(|| self.map().persisted_snapshot())
            .await;
    }

    pub fn session(&self) -> &SessionContext {
        &self.shared.session
    }

    // ===== Startup =====

    /// Restore persisted task lists that are still within the TTL. Keys
    /// already populated this session keep their in-memory state.
    /// Returns how many entries were restored.
    pub async fn load(&self) -> usize {
        let snapshot = self.shared.persistence.load().await;
        let merged = self.map().merge_persisted(snapshot);
        for key in &merged {
            self.changed(CacheEvent::TasksChanged { key: key.clone() });
        }
        if !merged.is_empty() {
            info!(
                restored = merged.len(),
                ttl_days = self.shared.persistence.ttl().num_days(),
                "Restored task lists from disk"
            );
        }
        merged.len()
    }

    // ===== Reads =====

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.map().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.map().keys()
    }

    /// Status edits for `key` the server has not confirmed yet.
    pub fn unconfirmed(&self, key: &CacheKey) -> Vec<PendingMutation> {
        self.map().pending(key)
    }

    pub fn version(&self) -> u64 {
        self.shared.notifier.version()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.shared.notifier.subscribe()
    }

    pub fn subscribe_topic<F>(&self, topic: Topic, handler: F) -> JoinHandle<()>
    where
        F: Fn(CacheEvent) + Send + 'static,
    {
        self.shared.notifier.subscribe_topic(topic, handler)
    }

    // ===== Fetch coordination =====

    /// Return the task list for `key`, fetching it if needed.
    ///
    /// Without `force_refresh`, an entry that already has items, or whose
    /// fetch is still running, is answered from memory (the latter possibly
    /// with `None`). With `force_refresh` a fetch is always issued; if an
    /// even newer fetch for the key starts before this one completes, this
    /// one's result is discarded.
    pub async fn ensure(&self, key: &CacheKey, force_refresh: bool) -> Option<Vec<TaskItem>> {
        let seq = {
            let mut map = self.map();
            if !force_refresh {
                if let Some(entry) = map.get(key).filter(|e| e.can_serve()) {
                    debug!(key = %key, loading = entry.loading, "Task cache hit");
                    return entry.items.clone();
                }
            }
            map.begin_fetch(key, Utc::now())
        };
        self.changed(CacheEvent::TasksChanged { key: key.clone() });
        debug!(key = %key, seq = seq, force_refresh = force_refresh, "Fetching task list");

        let session = &self.shared.session;
        let outcome = self
            .shared
            .api
            .fetch_tasks(&session.company, key.project(), &session.employee)
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "Failed to fetch task list");
                format!("{:#}", e)
            });

        let applied = self.map().complete_fetch(key, seq, outcome, Utc::now());
        if applied {
            self.changed(CacheEvent::TasksChanged { key: key.clone() });
            self.flush().await;
        } else {
            debug!(key = %key, seq = seq, "Discarding superseded task fetch");
        }

        self.get(key).and_then(|entry| entry.items)
    }

    // ===== Optimistic status edits =====

    /// Change a task's status locally right away, then commit it to the
    /// server in the background. A failed commit is logged and the local
    /// edit stays in place until the next refresh.
    pub async fn update_status(
        &self,
        key: &CacheKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), CacheError> {
        let mutation_id = self.map().apply_status(key, task_id, status)?;
        self.changed(CacheEvent::TaskStatusChanged {
            key: key.clone(),
            task_id: task_id.to_string(),
        });
        info!(key = %key, task_id = task_id, status = %status, "Applied task status locally");

        self.spawn_commit(key.clone(), task_id.to_string(), status, mutation_id);
        self.flush().await;
        Ok(())
    }

    fn spawn_commit(&self, key: CacheKey, task_id: String, status: TaskStatus, mutation_id: u64) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let session = &manager.shared.session;
            let result = manager
                .shared
                .api
                .update_task_status(&session.company, &task_id, status)
                .await;
            manager.map().resolve_mutation(&key, mutation_id, result.is_ok());
            match result {
                Ok(()) => debug!(key = %key, task_id = %task_id, "Task status confirmed"),
                Err(e) => warn!(
                    key = %key,
                    task_id = %task_id,
                    error = %e,
                    "Task status commit failed; keeping local edit"
                ),
            }
        });

        let mut commits = self.shared.commits.lock().unwrap_or_else(PoisonError::into_inner);
        commits.retain(|h| !h.is_finished());
        commits.push(handle);
    }

    /// Wait for every status commit issued so far to finish.
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self.shared.commits.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                break;
            }
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Task status commit task aborted");
                }
            }
        }
    }

    // ===== Invalidation =====

    /// Drop every cached task list and the persisted snapshot.
    pub async fn clear_all(&self) {
        let removed = self.map().clear();
        self.changed(CacheEvent::Cleared);
        self.shared.persistence.clear().await;
        info!(entries = removed, "Cleared task cache");
    }

    // ===== Attendance history =====

    pub async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> HistoryFetch {
        let outcome = self.shared.history.fetch_range(start, end).await;
        if matches!(outcome, HistoryFetch::Fetched { .. }) {
            self.shared.notifier.bump();
        }
        outcome
    }

    pub fn history(&self) -> Option<HistoryRange> {
        self.shared.history.latest()
    }

    // ===== Teardown =====

    /// Finish outstanding commits and write the final snapshot.
    pub async fn close(&self) {
        self.settle().await;
        self.flush().await;
        debug!("Task cache closed");
    }
}
