//! REST API client module for the attendance backend.
//!
//! This module provides the `ApiClient` for fetching project task lists,
//! committing task status edits, and reading attendance history. The cache
//! layer talks to the backend only through the `TaskApi` and `HistoryApi`
//! traits, so tests and offline builds can substitute their own remote.

pub mod client;
pub mod error;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{AttendanceDay, TaskItem, TaskStatus};

pub use client::ApiClient;
pub use error::ApiError;

/// Remote task endpoints.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Fetch the task list for one project (resource) of a company.
    async fn fetch_tasks(&self, company: &str, project: &str, employee: &str)
        -> Result<Vec<TaskItem>>;

    /// Commit a single task status change.
    async fn update_task_status(&self, company: &str, task_id: &str, status: TaskStatus)
        -> Result<()>;
}

/// Remote attendance history endpoint.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_history(
        &self,
        company: &str,
        employee: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AttendanceDay>>;
}
