// src/compose/mod.rs

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::config::WatermarkVariant;
use crate::error::{ComposeError, ToolError};
use crate::media::{MediaTool, concat_manifest};
use crate::store::SegmentStore;
use crate::types::{ComposeRequest, Resolution, SourceId};

const OUTPUT_PREFIX: &str = "video_camera_";

/// Files produced by one successful compose. The caller owns and deletes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedClip {
    pub source_id: SourceId,
    pub intermediate: PathBuf,
    pub output: PathBuf,
    pub resolution: Resolution,
    pub segments: usize,
}

impl ComposedClip {
    pub fn remove_files(&self) {
        remove_quietly(&self.intermediate);
        remove_quietly(&self.output);
    }

    /// Guard that deletes both files when dropped, including when the owning
    /// task is aborted.
    pub fn cleanup_guard(&self) -> Artifacts {
        Artifacts::new(vec![self.intermediate.clone(), self.output.clone()])
    }
}

/// Removes its files on drop unless [`Artifacts::keep`] was called.
#[derive(Debug)]
pub struct Artifacts {
    paths: Vec<PathBuf>,
}

impl Artifacts {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn keep(mut self) {
        self.paths.clear();
    }
}

impl Drop for Artifacts {
    fn drop(&mut self) {
        for p in &self.paths {
            remove_quietly(p);
        }
    }
}

/// Segment window → probe → watermark variant → concat → overlay.
pub struct ComposePipeline<T> {
    store: SegmentStore,
    tool: T,
    work_dir: PathBuf,
    watermarks: Vec<WatermarkVariant>,
}

impl<T: MediaTool> ComposePipeline<T> {
    pub fn new(
        store: SegmentStore,
        tool: T,
        work_dir: impl Into<PathBuf>,
        mut watermarks: Vec<WatermarkVariant>,
    ) -> Self {
        watermarks.sort_by_key(|w| w.min_height);
        Self {
            store,
            tool,
            work_dir: work_dir.into(),
            watermarks,
        }
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Highest bucket whose `min_height` the frame reaches; the lowest bucket otherwise.
    pub fn watermark_for(&self, resolution: Resolution) -> Option<&Path> {
        self.watermarks
            .iter()
            .rev()
            .find(|w| resolution.height >= w.min_height)
            .or_else(|| self.watermarks.first())
            .map(|w| w.path.as_path())
    }

    /// `(intermediate, final, manifest)` paths, keyed by source and requester.
    pub fn output_paths(&self, source_id: SourceId, requester: &str) -> (PathBuf, PathBuf, PathBuf) {
        let base = format!("{}{}_user_{}", OUTPUT_PREFIX, source_id, sanitize(requester));
        (
            self.work_dir.join(format!("{}.mp4", base)),
            self.work_dir.join(format!("{}_wm.mp4", base)),
            self.work_dir.join(format!("{}.txt", base)),
        )
    }

    /// Removes compose artifacts left in the work directory by an earlier run.
    /// Must run before any compose is started.
    pub fn sweep_work_dir(&self) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.work_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let ours = name.starts_with(OUTPUT_PREFIX)
                && (name.ends_with(".mp4") || name.ends_with(".txt"));
            if !ours {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(_) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("[compose] failed to remove {:?}: {}", entry.path(), e),
            }
        }

        if removed > 0 {
            info!("[compose] removed {} stale files from {:?}", removed, self.work_dir);
        }
        Ok(removed)
    }

    pub async fn compose(&self, req: &ComposeRequest) -> Result<ComposedClip, ComposeError> {
        let segments = match self
            .store
            .select_window(req.source_id, req.duration_secs, req.offset_secs)
        {
            Ok(s) => s,
            Err(e @ ComposeError::EmptyBuffer(_)) => {
                info!("[compose] source {}: buffer empty", req.source_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let first = &segments[0].path;
        let resolution = self.tool.probe(first).await.map_err(|e| {
            log_tool_failure("probe", req, &e);
            ComposeError::ProbeFailed(e)
        })?;

        let watermark = self
            .watermark_for(resolution)
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no watermark configured"))?;

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let (intermediate, output, manifest) = self.output_paths(req.source_id, &req.requester);

        // every error return and a dropped future remove what was written so far
        let artifacts = Artifacts::new(vec![manifest.clone(), intermediate.clone(), output.clone()]);

        tokio::fs::write(
            &manifest,
            concat_manifest(segments.iter().map(|s| s.path.as_path())),
        )
        .await?;

        let concat = self.tool.concat(&manifest, &intermediate).await;
        remove_quietly(&manifest);
        if let Err(e) = concat {
            log_tool_failure("concat", req, &e);
            return Err(ComposeError::ConcatFailed(e));
        }

        if let Err(e) = self.tool.overlay(&intermediate, &watermark, &output).await {
            log_tool_failure("overlay", req, &e);
            return Err(ComposeError::OverlayFailed(e));
        }

        artifacts.keep();
        info!(
            "[compose] source {} for {}: {} segments, {} → {:?}",
            req.source_id,
            req.requester,
            segments.len(),
            resolution,
            output
        );

        Ok(ComposedClip {
            source_id: req.source_id,
            intermediate,
            output,
            resolution,
            segments: segments.len(),
        })
    }
}

fn log_tool_failure(stage: &str, req: &ComposeRequest, err: &ToolError) {
    if err.is_disk_full() {
        error!(
            "[compose] {} for source {}: DISK FULL, no fallback storage: {}",
            stage, req.source_id, err
        );
    } else {
        error!("[compose] {} for source {} failed: {}", stage, req.source_id, err);
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("[compose] failed to remove {:?}: {}", path, e),
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
