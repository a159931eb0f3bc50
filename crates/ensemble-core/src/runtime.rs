// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The top-level runtime handle.
//!
//! Owns every piece of shared state the components need — cost ledger,
//! running-tool tracker, sequential lanes, pause gate, quota counters, and
//! the agent registry — and is passed explicitly.  Tests construct fresh
//! runtimes instead of resetting process-wide singletons.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use ensemble_model::{CostTracker, QuotaTracker};
use ensemble_tools::{RunningToolTracker, SequentialQueue};

use crate::agent::AgentDefinition;
use crate::pause::PauseController;

pub struct Runtime {
    pub cost: Arc<CostTracker>,
    pub running: Arc<RunningToolTracker>,
    pub queue: Arc<SequentialQueue>,
    pub pause: Arc<PauseController>,
    pub quota: Arc<QuotaTracker>,
    agents: RwLock<HashMap<String, Arc<AgentDefinition>>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            cost: Arc::new(CostTracker::new()),
            running: Arc::new(RunningToolTracker::new()),
            queue: Arc::new(SequentialQueue::new()),
            pause: Arc::new(PauseController::new()),
            quota: Arc::new(QuotaTracker::new()),
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register an agent so workers and verifiers can resolve it by id.
    /// Re-registering an id replaces the previous definition.
    pub fn register_agent(&self, agent: Arc<AgentDefinition>) {
        self.agents
            .write()
            .insert(agent.agent_id.clone(), agent);
    }

    pub fn agent(&self, agent_id: &str) -> Option<Arc<AgentDefinition>> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_runtime_is_empty() {
        let rt = Runtime::new();
        assert_eq!(rt.cost.record_count(), 0);
        assert!(rt.running.is_empty());
        assert!(rt.agent_ids().is_empty());
    }

    #[test]
    fn register_and_resolve_agent() {
        let rt = Runtime::new();
        rt.register_agent(Arc::new(AgentDefinition::new("a1", "worker")));
        assert!(rt.agent("a1").is_some());
        assert!(rt.agent("nope").is_none());
    }

    #[test]
    fn reregistering_replaces() {
        let rt = Runtime::new();
        rt.register_agent(Arc::new(AgentDefinition::new("a1", "old")));
        rt.register_agent(Arc::new(AgentDefinition::new("a1", "new")));
        assert_eq!(rt.agent("a1").unwrap().name, "new");
        assert_eq!(rt.agent_ids().len(), 1);
    }

    #[test]
    fn runtimes_are_independent() {
        let a = Runtime::new();
        let b = Runtime::new();
        a.cost.add_estimated_usage("test-model", "xxxx", "yy", None);
        assert_eq!(a.cost.record_count(), 1);
        assert_eq!(b.cost.record_count(), 0);
    }
}
