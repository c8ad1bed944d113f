// src/types.rs

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Integer identity of a camera or NVR channel source.
pub type SourceId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    /// Network address of the stream, credentials included (e.g. `rtsp://user:pw@host/...`).
    pub url: String,
    /// Re-encode instead of stream copy when the camera codec is unfit for distribution.
    #[serde(default)]
    pub transcode: bool,
}

/// One fixed-duration slice of a source's stream on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub source_id: SourceId,
    pub seq: u32,
    pub path: PathBuf,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Transient request for one composed clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRequest {
    pub source_id: SourceId,
    /// Identity of whoever asked (user id, `alarm-<channel>-<cluster>`, ...).
    /// Output file names are keyed by it, so distinct requesters never clobber each other.
    pub requester: String,
    pub duration_secs: u64,
    pub offset_secs: u64,
}

impl ComposeRequest {
    pub fn recent(source_id: SourceId, requester: impl Into<String>, duration_secs: u64) -> Self {
        Self {
            source_id,
            requester: requester.into(),
            duration_secs,
            offset_secs: 0,
        }
    }

    pub fn with_offset(mut self, offset_secs: u64) -> Self {
        self.offset_secs = offset_secs;
        self
    }
}
