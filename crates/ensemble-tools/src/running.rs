// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Registry of in-flight tool executions.
//!
//! Every dispatched tool gets an entry here for its lifetime.  A tool that
//! outlives its timeout budget keeps executing in the background; its
//! eventual terminal result is still recorded so `wait_for_running_tool`
//! can surface it to the agent.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Lifecycle state of a running tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningToolStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Aborted,
}

impl RunningToolStatus {
    /// True for states no further transition may leave, except that a
    /// `TimedOut` tool may still complete or fail in the background.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Snapshot of one tracked tool.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTool {
    pub id: String,
    pub name: String,
    pub agent_id: String,
    pub args: Value,
    pub start_time: DateTime<Utc>,
    pub status: RunningToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Entry {
    info: RunningTool,
    cancel: CancellationToken,
    done: Arc<Notify>,
    finished_at: Option<DateTime<Utc>>,
}

/// Error from [`RunningToolTracker::wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    NotFound,
    Cancelled,
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "running tool not found"),
            Self::Cancelled => write!(f, "wait cancelled"),
        }
    }
}

impl std::error::Error for WaitError {}

/// In-flight tool registry keyed by tool-run id.
#[derive(Default)]
pub struct RunningToolTracker {
    entries: Mutex<HashMap<String, Entry>>,
}

impl RunningToolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatched tool.  Returns the abort handle.
    ///
    /// A duplicate id is a programming error (ids are generated per
    /// dispatch) and panics in debug builds; in release it replaces the
    /// stale entry with a warning.
    pub fn add_running_tool(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        agent_id: impl Into<String>,
        args: Value,
    ) -> CancellationToken {
        let id = id.into();
        let cancel = CancellationToken::new();
        let entry = Entry {
            info: RunningTool {
                id: id.clone(),
                name: name.into(),
                agent_id: agent_id.into(),
                args,
                start_time: Utc::now(),
                status: RunningToolStatus::Running,
                result: None,
                error: None,
            },
            cancel: cancel.clone(),
            done: Arc::new(Notify::new()),
            finished_at: None,
        };
        let mut entries = self.entries.lock();
        debug_assert!(
            !entries.contains_key(&id),
            "duplicate running tool id: {id}"
        );
        if entries.insert(id.clone(), entry).is_some() {
            warn!(%id, "duplicate running tool id replaced stale entry");
        }
        cancel
    }

    /// Record a successful result.  Allowed from `Running` or `TimedOut`;
    /// a later call on an already-terminal entry is ignored.
    pub fn complete_running_tool(&self, id: &str, output: impl Into<String>) {
        self.finish(id, RunningToolStatus::Completed, Some(output.into()), None);
    }

    /// Record a failure.  Same transition rules as completion.
    pub fn fail_running_tool(&self, id: &str, error: impl Into<String>) {
        self.finish(id, RunningToolStatus::Failed, None, Some(error.into()));
    }

    /// Mark a tool as having exceeded its budget.  The tool keeps running;
    /// a later complete/fail still lands.
    pub fn mark_timed_out(&self, id: &str) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(id) {
            if e.info.status == RunningToolStatus::Running {
                e.info.status = RunningToolStatus::TimedOut;
            }
        }
    }

    /// Fire the abort handle and mark the tool aborted.
    pub fn abort(&self, id: &str) {
        let done = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(e) if !e.info.status.is_terminal() => {
                    e.cancel.cancel();
                    e.info.status = RunningToolStatus::Aborted;
                    e.finished_at = Some(Utc::now());
                    Some(Arc::clone(&e.done))
                }
                _ => None,
            }
        };
        if let Some(done) = done {
            done.notify_waiters();
        }
    }

    /// Abort every non-terminal tool belonging to one agent.
    pub fn abort_agent_tools(&self, agent_id: &str) {
        let ids: Vec<String> = {
            let entries = self.entries.lock();
            entries
                .values()
                .filter(|e| e.info.agent_id == agent_id && !e.info.status.is_terminal())
                .map(|e| e.info.id.clone())
                .collect()
        };
        for id in ids {
            self.abort(&id);
        }
    }

    fn finish(
        &self,
        id: &str,
        status: RunningToolStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        let done = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(e) if !e.info.status.is_terminal() => {
                    e.info.status = status;
                    e.info.result = result;
                    e.info.error = error;
                    e.finished_at = Some(Utc::now());
                    Some(Arc::clone(&e.done))
                }
                _ => None,
            }
        };
        if let Some(done) = done {
            done.notify_waiters();
        }
    }

    pub fn get_running_tool(&self, id: &str) -> Option<RunningTool> {
        self.entries.lock().get(id).map(|e| e.info.clone())
    }

    /// All tracked tools, optionally filtered by agent.
    pub fn list(&self, agent_id: Option<&str>) -> Vec<RunningTool> {
        let entries = self.entries.lock();
        let mut out: Vec<RunningTool> = entries
            .values()
            .filter(|e| agent_id.is_none_or(|a| e.info.agent_id == a))
            .map(|e| e.info.clone())
            .collect();
        out.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        out
    }

    /// Suspend until the tool reaches a terminal state, or `cancel` fires.
    pub async fn wait_for(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunningTool, WaitError> {
        loop {
            let (snapshot, done) = {
                let entries = self.entries.lock();
                match entries.get(id) {
                    Some(e) => (e.info.clone(), Arc::clone(&e.done)),
                    None => return Err(WaitError::NotFound),
                }
            };
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            // Enable the waiter before re-checking so a notify between the
            // check and the await is never lost.
            let notified = done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(e) = self.entries.lock().get(id) {
                if e.info.status.is_terminal() {
                    return Ok(e.info.clone());
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            }
        }
    }

    /// Remove entries that reached a terminal state longer than `grace`
    /// ago.  Returns how many were dropped.
    pub fn sweep(&self, grace: chrono::Duration) -> usize {
        let cutoff = Utc::now() - grace;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.info.status.is_terminal()
                && e.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn add_and_get() {
        let t = RunningToolTracker::new();
        t.add_running_tool("r1", "add", "agent", json!({"x": 1}));
        let info = t.get_running_tool("r1").unwrap();
        assert_eq!(info.name, "add");
        assert_eq!(info.status, RunningToolStatus::Running);
    }

    #[test]
    fn complete_sets_result_and_is_idempotent() {
        let t = RunningToolTracker::new();
        t.add_running_tool("r1", "add", "agent", json!({}));
        t.complete_running_tool("r1", "5");
        t.complete_running_tool("r1", "99"); // ignored
        let info = t.get_running_tool("r1").unwrap();
        assert_eq!(info.status, RunningToolStatus::Completed);
        assert_eq!(info.result.as_deref(), Some("5"));
    }

    #[test]
    fn fail_after_complete_is_ignored() {
        let t = RunningToolTracker::new();
        t.add_running_tool("r1", "add", "agent", json!({}));
        t.complete_running_tool("r1", "ok");
        t.fail_running_tool("r1", "boom");
        let info = t.get_running_tool("r1").unwrap();
        assert_eq!(info.status, RunningToolStatus::Completed);
        assert!(info.error.is_none());
    }

    #[test]
    fn timed_out_tool_can_still_complete() {
        let t = RunningToolTracker::new();
        t.add_running_tool("r1", "slow", "agent", json!({}));
        t.mark_timed_out("r1");
        assert_eq!(
            t.get_running_tool("r1").unwrap().status,
            RunningToolStatus::TimedOut
        );
        t.complete_running_tool("r1", "late result");
        let info = t.get_running_tool("r1").unwrap();
        assert_eq!(info.status, RunningToolStatus::Completed);
        assert_eq!(info.result.as_deref(), Some("late result"));
    }

    #[test]
    fn abort_fires_token_and_marks_aborted() {
        let t = RunningToolTracker::new();
        let token = t.add_running_tool("r1", "slow", "agent", json!({}));
        t.abort("r1");
        assert!(token.is_cancelled());
        assert_eq!(
            t.get_running_tool("r1").unwrap().status,
            RunningToolStatus::Aborted
        );
    }

    #[test]
    fn abort_agent_tools_only_touches_that_agent() {
        let t = RunningToolTracker::new();
        t.add_running_tool("r1", "a", "agent-1", json!({}));
        t.add_running_tool("r2", "b", "agent-2", json!({}));
        t.abort_agent_tools("agent-1");
        assert_eq!(
            t.get_running_tool("r1").unwrap().status,
            RunningToolStatus::Aborted
        );
        assert_eq!(
            t.get_running_tool("r2").unwrap().status,
            RunningToolStatus::Running
        );
    }

    #[test]
    fn list_filters_by_agent() {
        let t = RunningToolTracker::new();
        t.add_running_tool("r1", "a", "agent-1", json!({}));
        t.add_running_tool("r2", "b", "agent-2", json!({}));
        assert_eq!(t.list(Some("agent-1")).len(), 1);
        assert_eq!(t.list(None).len(), 2);
    }

    #[tokio::test]
    async fn wait_for_resolves_on_completion() {
        let t = Arc::new(RunningToolTracker::new());
        t.add_running_tool("r1", "slow", "agent", json!({}));
        let waiter = {
            let t = Arc::clone(&t);
            tokio::spawn(async move {
                t.wait_for("r1", &CancellationToken::new()).await
            })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        t.complete_running_tool("r1", "done");
        let info = waiter.await.unwrap().unwrap();
        assert_eq!(info.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn wait_for_unknown_id_errors() {
        let t = RunningToolTracker::new();
        let err = t
            .wait_for("nope", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::NotFound);
    }

    #[tokio::test]
    async fn wait_for_cancel_fires() {
        let t = Arc::new(RunningToolTracker::new());
        t.add_running_tool("r1", "slow", "agent", json!({}));
        let cancel = CancellationToken::new();
        let waiter = {
            let t = Arc::clone(&t);
            let cancel = cancel.clone();
            tokio::spawn(async move { t.wait_for("r1", &cancel).await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap().unwrap_err(), WaitError::Cancelled);
    }

    #[test]
    fn sweep_drops_only_old_terminal_entries() {
        let t = RunningToolTracker::new();
        t.add_running_tool("done", "a", "agent", json!({}));
        t.add_running_tool("live", "b", "agent", json!({}));
        t.complete_running_tool("done", "x");
        // Grace of zero: anything finished before "now" is eligible.
        let dropped = t.sweep(chrono::Duration::zero());
        assert_eq!(dropped, 1);
        assert!(t.get_running_tool("done").is_none());
        assert!(t.get_running_tool("live").is_some());
    }
}
