//! Client-side task cache and sync layer.
//!
//! Task lists are cached per (date, project) key. A read that misses starts
//! one fetch; concurrent readers share it, and a forced refresh keeps serving
//! the stale list until new data lands. Status edits apply locally at once and
//! commit to the server in the background. Settled lists are mirrored to a
//! durable store and restored at startup while younger than the TTL.

pub mod entry;
pub mod error;
pub mod history;
pub mod key;
pub mod manager;
pub mod map;
pub mod notify;
pub mod persist;
pub mod store;

#[cfg(test)]
mod test_support;

pub use entry::{format_age, CacheEntry};
pub use error::CacheError;
pub use history::{HistoryFetch, HistoryRange, DEFAULT_HISTORY_COOLDOWN};
pub use key::CacheKey;
pub use manager::{CacheManager, CacheOptions, SessionContext};
pub use map::{MutationState, PendingMutation};
pub use notify::{CacheEvent, ChangeNotifier, Topic};
pub use persist::{PersistedSnapshot, DEFAULT_TTL_DAYS, SNAPSHOT_KEY};
pub use store::{DurableStore, FileStore, MemoryStore};
