//! Scripted remotes shared by the cache tests.
//!
//! Responses can be queued ahead of time and completed from the test body,
//! which is how the tests control the order in which fetches finish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{oneshot, Semaphore};

use crate::api::{HistoryApi, TaskApi};
use crate::models::{AttendanceDay, TaskItem, TaskStatus};

type FetchReply = Result<Vec<TaskItem>, String>;

#[derive(Default)]
pub struct ScriptedTaskApi {
    fetch_calls: AtomicUsize,
    replies: Mutex<VecDeque<oneshot::Receiver<FetchReply>>>,
    default_tasks: Mutex<Vec<TaskItem>>,
    commits: Mutex<Vec<(String, TaskStatus)>>,
    fail_commits: AtomicBool,
    commit_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedTaskApi {
    /// Answers every unscripted fetch with `tasks`.
    pub fn returning(tasks: Vec<TaskItem>) -> Self {
        let api = Self::default();
        *api.default_tasks.lock().unwrap() = tasks;
        api
    }

    /// The next fetch waits until the returned sender is completed.
    pub fn defer(&self) -> oneshot::Sender<FetchReply> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().unwrap().push_back(rx);
        tx
    }

    pub fn fail_next_fetch(&self, message: &str) {
        let tx = self.defer();
        let _ = tx.send(Err(message.to_string()));
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> Vec<(String, TaskStatus)> {
        self.commits.lock().unwrap().clone()
    }

    pub fn set_commit_failing(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }

    /// Status commits block until permits are added to the returned gate.
    pub fn hold_commits(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.commit_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub async fn wait_for_fetches(&self, count: usize) {
        while self.fetch_calls() < count {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl TaskApi for ScriptedTaskApi {
    async fn fetch_tasks(&self, _company: &str, _project: &str, _employee: &str) -> Result<Vec<TaskItem>> {
        let reply = self.replies.lock().unwrap().pop_front();
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match reply {
            Some(rx) => rx
                .await
                .map_err(|_| anyhow!("scripted reply dropped"))?
                .map_err(|message| anyhow!(message)),
            None => Ok(self.default_tasks.lock().unwrap().clone()),
        }
    }

    async fn update_task_status(&self, _company: &str, task_id: &str, status: TaskStatus) -> Result<()> {
        let gate = self.commit_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        self.commits.lock().unwrap().push((task_id.to_string(), status));
        if self.fail_commits.load(Ordering::SeqCst) {
            bail!("Server error: commit rejected");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedHistoryApi {
    calls: AtomicUsize,
    failing: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl ScriptedHistoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fetches block until permits are added to the returned gate.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl HistoryApi for ScriptedHistoryApi {
    async fn fetch_history(
        &self,
        _company: &str,
        _employee: &str,
        start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<AttendanceDay>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("Server error: history unavailable");
        }
        Ok(vec![AttendanceDay {
            date: start,
            status: "present".to_string(),
            check_in: Some("09:00".to_string()),
            check_out: Some("17:00".to_string()),
            location: None,
            note: None,
        }])
    }
}
