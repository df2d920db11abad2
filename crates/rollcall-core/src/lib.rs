//! Rollcall core library.
//!
//! Shared by the command-line front end and the mobile bindings: the REST
//! client for the attendance backend, the task and attendance models, the
//! offline-first task cache, and configuration.

pub mod api;
pub mod cache;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use cache::{CacheError, CacheKey, CacheManager, CacheOptions, SessionContext};
pub use config::Config;
pub use models::{AttendanceDay, TaskItem, TaskStatus};
