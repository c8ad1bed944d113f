// src/store/mod.rs

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::BufferConfig;
use crate::error::ComposeError;
use crate::types::{Segment, SourceId};

pub mod retention;

pub use retention::RingRetention;

const SEGMENT_PREFIX: &str = "buffer_";

/// Names, lists and orders the on-disk ring of each source.
///
/// The store never writes segments itself; the capture process does, using
/// [`SegmentStore::output_pattern`]. Readers only list and select.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    dir: PathBuf,
    extension: String,
    segment_seconds: u64,
    ring_size: u32,
}

impl SegmentStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        extension: impl Into<String>,
        segment_seconds: u64,
        ring_size: u32,
    ) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            segment_seconds: segment_seconds.max(1),
            ring_size: ring_size.max(1),
        }
    }

    pub fn from_config(cfg: &BufferConfig) -> Self {
        Self::new(
            cfg.segment_dir.clone(),
            cfg.extension.clone(),
            cfg.segment_seconds,
            cfg.ring_size,
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn segment_seconds(&self) -> u64 {
        self.segment_seconds
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn retention_secs(&self) -> u64 {
        self.segment_seconds * self.ring_size as u64
    }

    /// `buffer_<id>_<seq3>.<ext>`
    pub fn segment_path(&self, source_id: SourceId, seq: u32) -> PathBuf {
        self.dir.join(format!(
            "{}{}_{:03}.{}",
            SEGMENT_PREFIX, source_id, seq, self.extension
        ))
    }

    /// Output template handed to the segmenting capture process.
    pub fn output_pattern(&self, source_id: SourceId) -> PathBuf {
        self.dir
            .join(format!("{}{}_%03d.{}", SEGMENT_PREFIX, source_id, self.extension))
    }

    /// Parses `buffer_<id>_<seq>.<ext>` back into `(id, seq)`.
    pub fn parse_name(&self, name: &str) -> Option<(SourceId, u32)> {
        let stem = name
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        let rest = stem.strip_prefix(SEGMENT_PREFIX)?;
        let (id, seq) = rest.rsplit_once('_')?;
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some((id.parse().ok()?, seq.parse().ok()?))
    }

    /// All segments of `source_id`, oldest write first.
    ///
    /// A file that disappears between the directory scan and its metadata read
    /// (capture just rotated over it) is skipped.
    pub fn list(&self, source_id: SourceId) -> io::Result<Vec<Segment>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut segments = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some((id, seq)) = name.to_str().and_then(|n| self.parse_name(n)) else {
                continue;
            };
            if id != source_id {
                continue;
            }

            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    debug!("[store] skipping {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            segments.push(Segment {
                source_id: id,
                seq,
                path: entry.path(),
                modified,
            });
        }

        segments.sort_by(|a, b| match a.modified.cmp(&b.modified) {
            Ordering::Equal => a.path.cmp(&b.path),
            other => other,
        });
        Ok(segments)
    }

    /// Picks the contiguous run of segments covering `duration_secs` that ends
    /// `offset_secs` before the newest segment.
    pub fn select_window(
        &self,
        source_id: SourceId,
        duration_secs: u64,
        offset_secs: u64,
    ) -> Result<Vec<Segment>, ComposeError> {
        let offset_secs = self.clamp_offset(source_id, duration_secs, offset_secs);
        let mut all = self.list(source_id)?;
        if all.is_empty() {
            return Err(ComposeError::EmptyBuffer(source_id));
        }

        let mut range = self.window_range(duration_secs, offset_secs, all.len());
        if range.is_empty() && offset_secs > 0 {
            // ring not filled up to the offset yet
            warn!(
                "[store] source {}: offset {}s reaches past the {} recorded segments, using offset 0",
                source_id,
                offset_secs,
                all.len()
            );
            range = self.window_range(duration_secs, 0, all.len());
        }
        if range.is_empty() {
            return Err(ComposeError::EmptyBuffer(source_id));
        }

        debug!(
            "[store] source {} window {:?} of {} segments (d={}s off={}s)",
            source_id,
            range,
            all.len(),
            duration_secs,
            offset_secs
        );

        all.truncate(range.end);
        Ok(all.split_off(range.start))
    }

    /// Requests reaching past the retained span fall back to the most recent footage.
    fn clamp_offset(&self, source_id: SourceId, duration_secs: u64, offset_secs: u64) -> u64 {
        if offset_secs > 0 && offset_secs.saturating_add(duration_secs) > self.retention_secs() {
            warn!(
                "[store] source {}: offset {}s + duration {}s exceeds retained {}s, using offset 0",
                source_id,
                offset_secs,
                duration_secs,
                self.retention_secs()
            );
            return 0;
        }
        offset_secs
    }

    /// Index range into an oldest-first list of `available` segments.
    pub fn window_range(&self, duration_secs: u64, offset_secs: u64, available: usize) -> Range<usize> {
        // +1 absorbs the partial segments at both unaligned ends
        let count = duration_secs.div_ceil(self.segment_seconds) as usize + 1;
        let offset_segments = (offset_secs / self.segment_seconds) as usize;

        let end = available.saturating_sub(offset_segments);
        let start = end.saturating_sub(count);
        start..end
    }
}
