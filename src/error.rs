//! Error taxonomy for the agent core
//!
//! Tool failures never surface as errors - they become tool-role messages
//! and the loop continues. Everything here is for the seams where the KIND
//! of failure changes control flow: retry, continuation, or termination.

use thiserror::Error;

/// Errors that cross component boundaries.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Bad tool arguments or CLI flags. Never retried.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A tool ran and failed (non-zero exit, missing file, pattern mismatch).
    /// Captured in the ToolResult; the loop continues with the model informed.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// Connection reset/refused, 429, 5xx. Retried with backoff.
    #[error("transient I/O error: {0}")]
    Transient(String),

    /// Reply cut off mid-stream. Resolved by continuation; surfaced only
    /// if the continuation budget is exhausted.
    #[error("reply truncated: {0}")]
    Truncation(String),

    /// The permission gate refused the call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Canceled,

    /// The loop detected repeated non-progressing tool calls.
    #[error("agent stalled: {0}")]
    Stall(String),

    /// Non-transient auth/quota/validation error from the model provider.
    /// Terminal for the current loop.
    #[error("provider error ({status}): {message}")]
    Provider { status: u16, message: String },
}

impl AgentError {
    /// Whether the model client should retry after backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// Classify an HTTP status from the chat API.
    pub fn from_status(status: u16, body: String) -> Self {
        if status == 429 || status >= 500 {
            AgentError::Transient(format!("HTTP {}: {}", status, truncate(&body, 200)))
        } else {
            AgentError::Provider {
                status,
                message: truncate(&body, 400),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
