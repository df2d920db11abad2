//! In-memory cache map: the single source of truth for what the UI sees.
//!
//! Every entry change goes through [`CacheMap::set`]. Alongside each entry the
//! map tracks the sequence number of the latest fetch issued for the key and
//! the optimistic status edits the server has not confirmed yet.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{TaskItem, TaskStatus};

use super::entry::CacheEntry;
use super::key::CacheKey;
use super::persist::PersistedSnapshot;
use super::CacheError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Commit request still running
    InFlight,
    /// Commit request failed; the local edit stays until the next refresh
    Failed,
    /// Server acknowledged the edit. Fetches issued up to `at_seq` may still
    /// carry the old status, so the edit is laid over their results.
    Confirmed { at_seq: u64 },
}

/// An optimistic status edit, kept until a fetch is known to reflect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub id: u64,
    pub task_id: String,
    pub status: TaskStatus,
    pub state: MutationState,
}

#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    /// Sequence number of the latest fetch issued for this key
    seq: u64,
    pending: Vec<PendingMutation>,
}

impl Slot {
    fn new(entry: CacheEntry) -> Self {
        Self {
            entry,
            seq: 0,
            pending: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheMap {
    slots: HashMap<CacheKey, Slot>,
    next_seq: u64,
    next_mutation: u64,
}

impl CacheMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    /// Replace the entry for `key` with whatever `updater` builds from the
    /// current one (`None` if the key has never been seen).
    pub fn set<F>(&mut self, key: &CacheKey, updater: F) -> &CacheEntry
    where
        F: FnOnce(Option<&CacheEntry>) -> CacheEntry,
    {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let slot = occupied.into_mut();
                slot.entry = updater(Some(&slot.entry));
                &slot.entry
            }
            Entry::Vacant(vacant) => &vacant.insert(Slot::new(updater(None))).entry,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.slots.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entries(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry)> {
        self.slots.iter().map(|(key, slot)| (key, &slot.entry))
    }

    // ===== Fetch lifecycle =====

    /// Mark `key` as loading and return the sequence number the eventual
    /// completion must present.
    pub fn begin_fetch(&mut self, key: &CacheKey, now: DateTime<Utc>) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.set(key, |prev| match prev {
            Some(entry) => entry.begin_loading(),
            None => CacheEntry::loading(now),
        });
        if let Some(slot) = self.slots.get_mut(key) {
            slot.seq = seq;
        }
        seq
    }

    /// Apply a fetch outcome. Returns false, leaving the map untouched, when
    /// a newer fetch was issued for the key or the key was cleared meanwhile.
    pub fn complete_fetch(
        &mut self,
        key: &CacheKey,
        seq: u64,
        outcome: Result<Vec<TaskItem>, String>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.slots.get(key) {
            Some(slot) if slot.seq == seq => {}
            _ => return false,
        }

        let entry = match outcome {
            Ok(items) => CacheEntry::loaded(self.reconcile_pending(key, seq, items), now),
            Err(message) => CacheEntry::failed(message, now),
        };
        self.set(key, |_| entry);
        true
    }

    /// Server data replaces the local list, except that edits the fetch
    /// issued as `seq` cannot have seen are laid back on top: those still
    /// being committed, and confirmed ones acknowledged after it was issued.
    /// Failed edits are dropped here.
    fn reconcile_pending(&mut self, key: &CacheKey, seq: u64, items: Vec<TaskItem>) -> Vec<TaskItem> {
        let Some(slot) = self.slots.get_mut(key) else {
            return items;
        };
        slot.pending.retain(|m| match m.state {
            MutationState::InFlight => true,
            MutationState::Failed => false,
            MutationState::Confirmed { at_seq } => seq <= at_seq,
        });

        slot.pending.iter().fold(items, |items, mutation| {
            items
                .into_iter()
                .map(|t| {
                    if t.id == mutation.task_id {
                        t.with_status(mutation.status)
                    } else {
                        t
                    }
                })
                .collect()
        })
    }

    // ===== Optimistic status edits =====

    /// Apply a status edit locally and record it as unconfirmed.
    /// Returns the id used to resolve the mutation once the commit lands.
    pub fn apply_status(
        &mut self,
        key: &CacheKey,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<u64, CacheError> {
        let entry = self
            .get(key)
            .filter(|e| e.items.is_some())
            .ok_or_else(|| CacheError::NotCached(key.to_string()))?;
        let updated = entry
            .with_task_status(task_id, status)
            .ok_or_else(|| CacheError::TaskNotFound {
                key: key.to_string(),
                task_id: task_id.to_string(),
            })?;
        self.set(key, |_| updated);

        self.next_mutation += 1;
        let id = self.next_mutation;
        if let Some(slot) = self.slots.get_mut(key) {
            slot.pending.push(PendingMutation {
                id,
                task_id: task_id.to_string(),
                status,
                state: MutationState::InFlight,
            });
        }
        Ok(id)
    }

    /// Record the commit outcome. Confirmed edits are remembered against the
    /// latest fetch issued so far; failed ones are kept (and still shown)
    /// until the next successful refresh discards them.
    pub fn resolve_mutation(&mut self, key: &CacheKey, id: u64, confirmed: bool) {
        let at_seq = self.next_seq;
        let Some(mutation) = self
            .slots
            .get_mut(key)
            .and_then(|slot| slot.pending.iter_mut().find(|m| m.id == id))
        else {
            return;
        };
        mutation.state = if confirmed {
            MutationState::Confirmed { at_seq }
        } else {
            MutationState::Failed
        };
    }

    /// Edits the server has not acknowledged: in flight or failed.
    pub fn pending(&self, key: &CacheKey) -> Vec<PendingMutation> {
        self.slots
            .get(key)
            .map(|slot| {
                slot.pending
                    .iter()
                    .filter(|m| !matches!(m.state, MutationState::Confirmed { .. }))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    // ===== Persistence =====

    pub fn persisted_snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot::from_entries(self.entries())
    }

    /// Add persisted entries for keys this session has not touched yet.
    /// Returns the keys that were added.
    pub fn merge_persisted(&mut self, snapshot: PersistedSnapshot) -> Vec<CacheKey> {
        let mut merged = Vec::new();
        for (key, persisted) in snapshot.entries {
            if self.slots.contains_key(&key) {
                continue;
            }
            self.set(&key, |_| CacheEntry::loaded(persisted.items, persisted.timestamp));
            merged.push(key);
        }
        merged
    }

    /// Drop every entry. Sequence numbers keep counting so completions of
    /// fetches issued before the clear are still recognised as stale.
    pub fn clear(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }
}
