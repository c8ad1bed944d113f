// src/store/retention.rs
use std::fs;
use std::io;

use log::{info, warn};

use super::SegmentStore;
use crate::types::SourceId;

/// Removes segments whose sequence index lies outside the configured ring.
///
/// The capture process only ever rewrites indices `0..ring_size`, so files
/// left over from a larger earlier ring would otherwise stay forever and break
/// the "at most N segments per source" bound.
pub struct RingRetention {
    store: SegmentStore,
}

impl RingRetention {
    pub fn new(store: SegmentStore) -> Self {
        Self { store }
    }

    /// Returns the number of files removed.
    pub fn run(&self, source_id: SourceId) -> io::Result<usize> {
        let ring_size = self.store.ring_size();
        let mut removed = 0;

        for seg in self.store.list(source_id)? {
            if seg.seq < ring_size {
                continue;
            }
            match fs::remove_file(&seg.path) {
                Ok(_) => {
                    info!("[retention] removed {:?}", seg.path);
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("[retention] failed {:?}: {}", seg.path, e);
                }
            }
        }

        Ok(removed)
    }
}
