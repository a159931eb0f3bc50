// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Plain-data configuration for the ensemble runtime.
//!
//! Everything in this crate is inert data: model settings, retry policy,
//! per-agent limits, and the ambient constants shared by the tool executor
//! and the embedding cache.  Behaviour lives in `ensemble-tools` and
//! `ensemble-core`; this crate only describes it.

pub mod limits;
pub mod settings;

pub use limits::*;
pub use settings::{
    AgentLimits, CompactionSettings, ModelSettings, RetryOptions, ToolChoice,
};
