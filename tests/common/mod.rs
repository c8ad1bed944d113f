#![allow(dead_code)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use courtcam_node::config::WatermarkVariant;
use courtcam_node::media::MediaTool;
use courtcam_node::{ComposePipeline, Resolution, SegmentStore, SourceId, ToolError};

/// Stand-in for ffmpeg: concat writes the manifest into the output,
/// overlay appends the watermark it was given.
#[derive(Default)]
pub struct FakeTool {
    pub resolution: Option<Resolution>,
    pub fail_concat: bool,
    pub fail_overlay: bool,
    /// Overlay never finishes, as with a hung encoder.
    pub stall_overlay: bool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTool {
    pub fn with_height(height: u32) -> Self {
        Self {
            resolution: Some(Resolution {
                width: height * 16 / 9,
                height,
            }),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn exit(stderr: &str) -> ToolError {
    ToolError::Exit {
        tool: "ffmpeg".into(),
        code: Some(1),
        stderr: stderr.into(),
    }
}

impl MediaTool for FakeTool {
    async fn probe(&self, input: &Path) -> Result<Resolution, ToolError> {
        self.record(format!("probe {}", name(input)));
        tokio::task::yield_now().await;
        self.resolution
            .ok_or_else(|| exit("Invalid data found when processing input"))
    }

    async fn concat(&self, manifest: &Path, output: &Path) -> Result<(), ToolError> {
        self.record(format!("concat {}", name(output)));
        let listing = tokio::fs::read_to_string(manifest)
            .await
            .map_err(|e| exit(&e.to_string()))?;
        tokio::task::yield_now().await;
        if self.fail_concat {
            tokio::fs::write(output, b"partial").await.ok();
            return Err(exit("Impossible to open 'buffer_1_003.mp4'"));
        }
        tokio::fs::write(output, listing)
            .await
            .map_err(|e| exit(&e.to_string()))
    }

    async fn overlay(&self, input: &Path, watermark: &Path, output: &Path) -> Result<(), ToolError> {
        self.record(format!("overlay {}", name(output)));
        if self.fail_overlay {
            return Err(exit("Error initializing filter 'overlay'"));
        }
        if self.stall_overlay {
            std::future::pending::<()>().await;
        }
        let mut body = tokio::fs::read_to_string(input)
            .await
            .map_err(|e| exit(&e.to_string()))?;
        tokio::task::yield_now().await;
        body.push_str(&format!("watermark {}\n", watermark.display()));
        tokio::fs::write(output, body)
            .await
            .map_err(|e| exit(&e.to_string()))
    }
}

fn name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Simulates the wrapping segment muxer: write `count` segments, one per
/// `span_secs`, the last one written just now.
pub fn write_ring(store: &SegmentStore, source: SourceId, count: u32) -> Vec<PathBuf> {
    let now = SystemTime::now();
    let span = store.segment_seconds();
    (0..count)
        .map(|i| {
            let seq = i % store.ring_size();
            let path = store.segment_path(source, seq);
            let f = File::create(&path).unwrap();
            let age = Duration::from_secs((count - 1 - i) as u64 * span);
            f.set_modified(now - age).unwrap();
            path
        })
        .collect()
}

pub fn watermarks() -> Vec<WatermarkVariant> {
    vec![
        WatermarkVariant {
            min_height: 0,
            path: PathBuf::from("/assets/watermark.png"),
        },
        WatermarkVariant {
            min_height: 1080,
            path: PathBuf::from("/assets/watermark_1080.png"),
        },
    ]
}

pub fn pipeline(store: SegmentStore, tool: FakeTool, work_dir: &Path) -> ComposePipeline<FakeTool> {
    ComposePipeline::new(store, tool, work_dir, watermarks())
}
