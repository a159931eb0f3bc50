// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ambient runtime constants.
//!
//! These are the process-wide defaults consumed by the tool execution
//! manager and the embedding cache.  Per-tool and per-agent overrides take
//! precedence where a field for them exists.

/// Default wall-clock budget for a single tool invocation, in milliseconds.
pub const FUNCTION_TIMEOUT_MS: u64 = 30_000;

/// Tools that are exempt from the default timeout budget.
///
/// These are long-running by design: waiting on a background tool, or
/// driving an interactive code/debug session whose duration the model
/// controls.
pub const EXCLUDED_FROM_TIMEOUT_FUNCTIONS: &[&str] = &[
    "wait_for_running_tool",
    "run_shell_command_with_output",
    "execute_code",
    "debug_code",
    "test_code",
];

/// Tools that let the agent observe background tool state.
///
/// When at least one of these is registered for an agent, a tool that
/// exceeds its timeout budget is promoted to the background instead of
/// being reported as failed; the agent can then poll or wait for it.
pub const STATUS_TRACKING_TOOLS: &[&str] = &[
    "get_running_tools",
    "wait_for_running_tool",
    "get_tool_status",
];

/// Fallback cap on a tool result, in characters.  Per-tool `max_length`
/// overrides this.
pub const MAX_RESULT_LENGTH: usize = 5000;

/// Tools whose output is truncated but never summarized.  Their output is
/// already a window into a larger source the model can re-query.
pub const SKIP_SUMMARIZATION_TOOLS: &[&str] = &[
    "read_source",
    "get_page_content",
    "read_file",
    "list_files",
];

/// Time-to-live for cached embedding vectors, in milliseconds.
pub const EMBEDDING_TTL_MS: u64 = 3_600_000;

/// Maximum number of entries in the embedding cache.
pub const EMBEDDING_CACHE_MAX: usize = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tracking_tools_are_a_subset_of_timeout_exempt_or_not() {
        // wait_for_running_tool appears in both lists: it both tracks status
        // and must never be killed by the budget it exists to work around.
        assert!(STATUS_TRACKING_TOOLS.contains(&"wait_for_running_tool"));
        assert!(EXCLUDED_FROM_TIMEOUT_FUNCTIONS.contains(&"wait_for_running_tool"));
    }

    #[test]
    fn constants_match_documented_defaults() {
        assert_eq!(FUNCTION_TIMEOUT_MS, 30_000);
        assert_eq!(MAX_RESULT_LENGTH, 5000);
        assert_eq!(EMBEDDING_TTL_MS, 3_600_000);
        assert_eq!(EMBEDDING_CACHE_MAX, 1000);
    }
}
