// src/media/ffmpeg.rs

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use log::debug;
use serde::Deserialize;
use tokio::process::Command;

use super::MediaTool;
use crate::config::MediaConfig;
use crate::error::ToolError;
use crate::store::SegmentStore;
use crate::types::{Resolution, Source};

/// ffmpeg/ffprobe binding of [`MediaTool`].
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: String,
    ffprobe: String,
    timeout: Duration,
    overlay_position: String,
}

impl FfmpegTool {
    pub fn new(cfg: &MediaConfig) -> Self {
        Self {
            ffmpeg: cfg.ffmpeg.clone(),
            ffprobe: cfg.ffprobe.clone(),
            timeout: cfg.tool_timeout(),
            overlay_position: cfg.overlay_position.clone(),
        }
    }

    /// Runs `bin` to completion and returns its stdout.
    /// The child is killed when the timeout fires (kill-on-drop).
    async fn run(&self, bin: &str, args: Vec<OsString>) -> Result<Vec<u8>, ToolError> {
        debug!("[media] {} {:?}", bin, args);

        let child = Command::new(bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: bin.to_string(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|source| ToolError::Spawn {
                tool: bin.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: bin.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(ToolError::Exit {
                tool: bin.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

impl MediaTool for FfmpegTool {
    async fn probe(&self, input: &Path) -> Result<Resolution, ToolError> {
        let stdout = self.run(&self.ffprobe, probe_args(input)).await?;
        parse_probe(&self.ffprobe, &stdout)
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> Result<(), ToolError> {
        self.run(&self.ffmpeg, concat_args(manifest, output)).await?;
        Ok(())
    }

    async fn overlay(&self, input: &Path, watermark: &Path, output: &Path) -> Result<(), ToolError> {
        self.run(
            &self.ffmpeg,
            overlay_args(input, watermark, &self.overlay_position, output),
        )
        .await?;
        Ok(())
    }
}

fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

pub fn probe_args(input: &Path) -> Vec<OsString> {
    let mut args = os_args(&[
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height",
        "-of",
        "json",
    ]);
    args.push(input.into());
    args
}

pub fn concat_args(manifest: &Path, output: &Path) -> Vec<OsString> {
    let mut args = os_args(&["-hide_banner", "-loglevel", "error", "-y", "-f", "concat", "-safe", "0", "-i"]);
    args.push(manifest.into());
    args.extend(os_args(&["-c", "copy", "-movflags", "+faststart"]));
    args.push(output.into());
    args
}

pub fn overlay_args(input: &Path, watermark: &Path, position: &str, output: &Path) -> Vec<OsString> {
    let mut args = os_args(&["-hide_banner", "-loglevel", "error", "-y", "-i"]);
    args.push(input.into());
    args.push("-i".into());
    args.push(watermark.into());
    args.push("-filter_complex".into());
    args.push(format!("[0:v][1:v]overlay={},setsar=1,setdar=16/9[v]", position).into());
    args.extend(os_args(&[
        "-map",
        "[v]",
        "-an",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-movflags",
        "+faststart",
    ]));
    args.push(output.into());
    args
}

/// Long-running segmenting capture of one source into the store's ring.
pub fn capture_args(source: &Source, store: &SegmentStore) -> Vec<OsString> {
    let mut args = os_args(&["-hide_banner", "-loglevel", "warning", "-nostdin"]);

    if source.url.starts_with("rtsp://") || source.url.starts_with("rtsps://") {
        args.extend(os_args(&["-rtsp_transport", "tcp"]));
    }
    args.push("-i".into());
    args.push(source.url.clone().into());

    if source.transcode {
        args.extend(os_args(&["-c:v", "libx264", "-preset", "veryfast"]));
    } else {
        args.extend(os_args(&["-c:v", "copy"]));
    }
    args.extend(os_args(&["-an", "-aspect", "16:9", "-f", "segment"]));
    args.push("-segment_time".into());
    args.push(store.segment_seconds().to_string().into());
    args.push("-segment_wrap".into());
    args.push(store.ring_size().to_string().into());
    args.extend(os_args(&["-reset_timestamps", "1"]));

    if store.extension() == "mp4" {
        // fragmented, so the segment still being written stays readable
        args.extend(os_args(&[
            "-segment_format_options",
            "movflags=+frag_keyframe+empty_moov+default_base_moof",
        ]));
    }
    args.push(store.output_pattern(source.id).into());
    args
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

pub fn parse_probe(tool: &str, stdout: &[u8]) -> Result<Resolution, ToolError> {
    let malformed = |detail: String| ToolError::Malformed {
        tool: tool.to_string(),
        detail,
    };

    let out: ProbeOutput = serde_json::from_slice(stdout).map_err(|e| malformed(e.to_string()))?;
    let stream = out
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| malformed("no video stream".into()))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(Resolution { width, height }),
        _ => Err(malformed("missing width/height".into())),
    }
}
