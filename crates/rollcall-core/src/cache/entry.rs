use chrono::{DateTime, Utc};

use crate::models::{TaskItem, TaskStatus};

/// What the UI currently sees for one key.
///
/// Entries are never edited in place: every transition below builds the
/// replacement entry from the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub loading: bool,
    pub items: Option<Vec<TaskItem>>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// A first fetch for a key that has never been seen.
    pub fn loading(now: DateTime<Utc>) -> Self {
        Self {
            loading: true,
            items: None,
            error: None,
            timestamp: now,
        }
    }

    pub fn loaded(items: Vec<TaskItem>, now: DateTime<Utc>) -> Self {
        Self {
            loading: false,
            items: Some(items),
            error: None,
            timestamp: now,
        }
    }

    /// Terminal failure: any previously shown items are dropped.
    pub fn failed(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            loading: false,
            items: None,
            error: Some(message.into()),
            timestamp: now,
        }
    }

    /// Start revalidating, keeping the stale items visible.
    pub fn begin_loading(&self) -> Self {
        Self {
            loading: true,
            items: self.items.clone(),
            error: None,
            timestamp: self.timestamp,
        }
    }

    /// Replace the status of one task, preserving order and every other item.
    /// Returns `None` when there are no items or no task with `task_id`.
    pub fn with_task_status(&self, task_id: &str, status: TaskStatus) -> Option<Self> {
        let items = self.items.as_ref()?;
        if !items.iter().any(|t| t.id == task_id) {
            return None;
        }
        let items = items
            .iter()
            .map(|t| if t.id == task_id { t.with_status(status) } else { t.clone() })
            .collect();
        Some(Self {
            items: Some(items),
            ..self.clone()
        })
    }

    /// A request for this entry can be answered without the network.
    pub fn can_serve(&self) -> bool {
        self.loading || self.items.is_some()
    }

    /// Only settled, successful entries go to durable storage.
    pub fn is_persistable(&self) -> bool {
        !self.loading && self.items.is_some() && self.error.is_none()
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.timestamp).num_minutes()
    }

    pub fn age_display(&self) -> String {
        format_age(self.age_minutes())
    }
}

/// Human-friendly age such as "just now", "5m ago", "2h ago" or "3d ago".
pub fn format_age(minutes: i64) -> String {
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}
