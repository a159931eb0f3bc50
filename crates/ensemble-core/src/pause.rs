// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Global cooperative pause.
//!
//! The orchestrator checks the pause gate at round boundaries only — never
//! mid-stream — so a pause appears atomic to callers: a round either runs
//! to completion or has not started.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Error from [`PauseController::wait_while_paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitAborted;

impl std::fmt::Display for WaitAborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wait aborted while paused")
    }
}

impl std::error::Error for WaitAborted {}

/// Edge-triggered pause flag with abortable waiting.
pub struct PauseController {
    tx: watch::Sender<bool>,
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// Observe pause/resume edges.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Suspend while paused; resolves on resume, errs when `cancel` fires.
    /// Returns immediately when not paused.
    pub async fn wait_while_paused(&self, cancel: &CancellationToken) -> Result<(), WaitAborted> {
        let mut rx = self.tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Controller dropped; treat as resumed.
                        return Ok(());
                    }
                }
                _ = cancel.cancelled() => return Err(WaitAborted),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn wait_returns_immediately_when_not_paused() {
        let p = PauseController::new();
        timeout(
            Duration::from_millis(10),
            p.wait_while_paused(&CancellationToken::new()),
        )
        .await
        .expect("must not block")
        .unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_until_resume() {
        let p = Arc::new(PauseController::new());
        p.pause();
        assert!(p.is_paused());
        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.wait_while_paused(&CancellationToken::new()).await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        p.resume();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_aborts_on_cancel() {
        let p = Arc::new(PauseController::new());
        p.pause();
        let cancel = CancellationToken::new();
        let waiter = {
            let p = Arc::clone(&p);
            let cancel = cancel.clone();
            tokio::spawn(async move { p.wait_while_paused(&cancel).await })
        };
        sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(WaitAborted));
    }

    #[tokio::test]
    async fn subscribe_sees_edges() {
        let p = PauseController::new();
        let mut rx = p.subscribe();
        p.pause();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        p.resume();
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
