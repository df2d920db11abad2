use thiserror::Error;

/// Failures the cache layer reports to its callers.
///
/// Fetch failures are not in here: they are recorded on the cache entry.
/// Persistence and commit failures are logged and never surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("No task list cached for {0}")]
    NotCached(String),

    #[error("Task {task_id} not found in {key}")]
    TaskNotFound { key: String, task_id: String },
}
