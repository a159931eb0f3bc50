// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-agent sequential execution lanes.
//!
//! Tools that must not interleave (sequential mode, control tools) are
//! funnelled through a FIFO lane keyed by agent id.  Admission is by
//! ticket: each enqueue takes the next ticket number and waits until the
//! lane's current counter reaches it.  Clearing a lane bumps its epoch,
//! rejecting every ticket issued before the clear.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Rejection from a sequential lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The lane was cleared while this item was pending.
    Cleared,
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cleared => write!(f, "queue_cleared"),
        }
    }
}

impl std::error::Error for QueueError {}

#[derive(Default)]
struct LaneState {
    next_ticket: u64,
    current: u64,
    epoch: u64,
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    notify: Notify,
}

/// Map of agent id → FIFO lane.
#[derive(Default)]
pub struct SequentialQueue {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl SequentialQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, agent_id: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock();
        Arc::clone(lanes.entry(agent_id.to_string()).or_default())
    }

    /// Run `fut` once every earlier item in this agent's lane has finished.
    /// Futures resolve in enqueue order.
    pub async fn run_sequential<F, T>(&self, agent_id: &str, fut: F) -> Result<T, QueueError>
    where
        F: Future<Output = T>,
    {
        let lane = self.lane(agent_id);
        let (ticket, epoch) = {
            let mut st = lane.state.lock();
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            (ticket, st.epoch)
        };

        // Wait for admission.  The notified future is enabled before the
        // state check so a release between check and await is never lost.
        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = lane.state.lock();
                if st.epoch != epoch {
                    return Err(QueueError::Cleared);
                }
                if st.current == ticket {
                    break;
                }
            }
            notified.await;
        }

        let out = fut.await;

        // Release the lane; a concurrent clear already advanced it.
        {
            let mut st = lane.state.lock();
            if st.epoch == epoch {
                st.current += 1;
            }
        }
        lane.notify.notify_waiters();
        Ok(out)
    }

    /// Reject every pending item in this agent's lane.
    pub fn clear(&self, agent_id: &str) {
        let lane = {
            let lanes = self.lanes.lock();
            lanes.get(agent_id).cloned()
        };
        if let Some(lane) = lane {
            {
                let mut st = lane.state.lock();
                st.epoch += 1;
                st.current = st.next_ticket;
            }
            lane.notify.notify_waiters();
        }
    }

    /// Number of lanes that have been touched.
    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
