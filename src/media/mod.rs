// src/media/mod.rs

use std::future::Future;
use std::path::Path;

use crate::error::ToolError;
use crate::types::Resolution;

pub mod ffmpeg;

pub use ffmpeg::FfmpegTool;

/// Black-box media tool used by the compose pipeline.
///
/// Every method maps one invocation of the external binary; a nonzero exit
/// surfaces as [`ToolError::Exit`] carrying the tool's diagnostics.
pub trait MediaTool: Send + Sync {
    /// Pixel dimensions of the first video stream.
    fn probe(&self, input: &Path) -> impl Future<Output = Result<Resolution, ToolError>> + Send;

    /// Stream-copies the files listed in `manifest` into `output`.
    fn concat(
        &self,
        manifest: &Path,
        output: &Path,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;

    /// Burns `watermark` into `input`, video only.
    fn overlay(
        &self,
        input: &Path,
        watermark: &Path,
        output: &Path,
    ) -> impl Future<Output = Result<(), ToolError>> + Send;
}

/// Concat demuxer manifest: one `file '<absolute-path>'` line per input.
pub fn concat_manifest<'a>(paths: impl IntoIterator<Item = &'a Path>) -> String {
    let mut out = String::new();
    for p in paths {
        let abs = std::path::absolute(p).unwrap_or_else(|_| p.to_path_buf());
        // quote close, escaped quote, quote reopen
        let escaped = abs.to_string_lossy().replace('\'', r"'\''");
        out.push_str("file '");
        out.push_str(&escaped);
        out.push_str("'\n");
    }
    out
}
