// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use ensemble_config::{AgentLimits, CompactionSettings, ModelSettings, RetryOptions};
use ensemble_model::AgentTag;
use ensemble_tools::{ToolLifecycleHooks, ToolRegistry};

/// Everything the orchestrator needs to drive one agent.
///
/// Plain data plus a shared tool registry and optional lifecycle hooks.
/// Workers are referenced by `agent_id` through the runtime's agent
/// registry; `parent_id` is a weak back-reference, never a cycle.
#[derive(Clone)]
pub struct AgentDefinition {
    pub agent_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    /// Pinned model; skips class selection.
    pub model: Option<String>,
    pub model_class: Option<String>,
    pub disabled_models: Vec<String>,
    /// Per-agent selection weights, keyed by canonical model id.
    pub model_scores: HashMap<String, u32>,
    pub settings: ModelSettings,
    pub retry: RetryOptions,
    pub limits: AgentLimits,
    pub compaction: CompactionSettings,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Option<Arc<dyn ToolLifecycleHooks>>,
    /// Agent id of the verifier that gates this agent's final output.
    pub verifier: Option<String>,
    /// Named history thread this agent appends to, when persistent history
    /// is in use.
    pub history_thread: Option<String>,
}

impl AgentDefinition {
    pub fn new(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            name: name.into(),
            parent_id: None,
            model: None,
            model_class: None,
            disabled_models: Vec::new(),
            model_scores: HashMap::new(),
            settings: ModelSettings::default(),
            retry: RetryOptions::default(),
            limits: AgentLimits::default(),
            compaction: CompactionSettings::default(),
            tools: Arc::new(ToolRegistry::new()),
            hooks: None,
            verifier: None,
            history_thread: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_model_class(mut self, class: impl Into<String>) -> Self {
        self.model_class = Some(class.into());
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ToolLifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_verifier(mut self, verifier_agent_id: impl Into<String>) -> Self {
        self.verifier = Some(verifier_agent_id.into());
        self
    }

    pub fn with_limits(mut self, limits: AgentLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// The identity stamped onto every event this agent produces.
    pub fn tag(&self) -> AgentTag {
        AgentTag {
            agent_id: self.agent_id.clone(),
            name: self.name.clone(),
            parent_id: self.parent_id.clone(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
