// src/error.rs

use std::time::Duration;

use crate::types::SourceId;

/// Failure of one external media tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with {code:?}: {stderr}")]
    Exit {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("malformed {tool} output: {detail}")]
    Malformed { tool: String, detail: String },
}

impl ToolError {
    /// Nonzero exit whose diagnostics point at a full disk.
    pub fn is_disk_full(&self) -> bool {
        matches!(self, ToolError::Exit { stderr, .. } if mentions_disk_full(stderr))
    }
}

pub fn mentions_disk_full(text: &str) -> bool {
    text.contains("No space left on device")
}

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("no segments buffered for source {0}")]
    EmptyBuffer(SourceId),

    #[error("probe failed: {0}")]
    ProbeFailed(#[source] ToolError),

    #[error("concat failed: {0}")]
    ConcatFailed(#[source] ToolError),

    #[error("overlay failed: {0}")]
    OverlayFailed(#[source] ToolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComposeError {
    /// Text safe to show to an end user; tool diagnostics stay in the logs.
    pub fn user_message(&self) -> &'static str {
        match self {
            ComposeError::EmptyBuffer(_) => "The buffer is empty, there is nothing to save yet.",
            _ => "Could not assemble the video.",
        }
    }

    pub fn is_empty_buffer(&self) -> bool {
        matches!(self, ComposeError::EmptyBuffer(_))
    }
}

/// Alarm query failure on one channel. Logged, never escalated.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("http error: {0}")]
    Http(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("poll task failed: {0}")]
    Join(String),
}
