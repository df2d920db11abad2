//! Data models for rollcall entities.
//!
//! This module contains the wire schemas the cache layer consumes:
//!
//! - `TaskItem`, `TaskStatus`: project tasks shown per site/day
//! - `AttendanceDay`: one day of attendance history (consumed, not interpreted)

pub mod attendance;
pub mod task;

pub use attendance::AttendanceDay;
pub use task::{ParseStatusError, TaskItem, TaskStatus};
