// src/alarm/mod.rs

use log::warn;

use crate::error::PollError;

pub mod client;
pub mod digest;
pub mod poller;

pub use client::{CgiEventClient, EventQuery, EventRow, EventSource, SearchHandle};
pub use poller::{AlarmPoller, PollSettings};

/// Upper bound on `find_next` round-trips per poll.
const MAX_PAGES: usize = 50;

/// Per-channel dedup state: the greatest cluster already acted upon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmState {
    last_seen: Option<u64>,
}

impl AlarmState {
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Records `cluster` and returns `true` when it is strictly newer than anything seen.
    pub fn observe(&mut self, cluster: Option<u64>) -> bool {
        match cluster {
            Some(c) if self.last_seen.is_none_or(|last| c > last) => {
                self.last_seen = Some(c);
                true
            }
            _ => false,
        }
    }
}

/// A search handle that is destroyed on every exit path.
pub struct SearchSession<'a, E: EventSource + ?Sized> {
    source: &'a E,
    handle: SearchHandle,
}

impl<'a, E: EventSource + ?Sized> SearchSession<'a, E> {
    pub fn open(source: &'a E) -> Result<Self, PollError> {
        let handle = source.create_search()?;
        Ok(Self { source, handle })
    }

    pub fn find(&self, query: &EventQuery) -> Result<bool, PollError> {
        self.source.find_events(&self.handle, query)
    }

    pub fn next_page(&self, count: u32) -> Result<Vec<EventRow>, PollError> {
        self.source.find_next(&self.handle, count)
    }
}

impl<E: EventSource + ?Sized> Drop for SearchSession<'_, E> {
    fn drop(&mut self) {
        if let Err(e) = self.source.destroy(&self.handle) {
            warn!("[alarm] failed to release search {}: {}", self.handle.0, e);
        }
    }
}

/// Greatest cluster among rows tagged `tag` within the query window.
pub fn latest_cluster<E: EventSource + ?Sized>(
    source: &E,
    query: &EventQuery,
    tag: &str,
    page_size: u32,
) -> Result<Option<u64>, PollError> {
    let session = SearchSession::open(source)?;
    if !session.find(query)? {
        return Ok(None);
    }

    let mut best: Option<u64> = None;
    for _ in 0..MAX_PAGES {
        let rows = session.next_page(page_size)?;
        let full_page = rows.len() >= page_size as usize;

        for row in rows.iter().filter(|r| r.has_tag(tag)) {
            if let Some(c) = row.cluster {
                best = Some(best.map_or(c, |b| b.max(c)));
            }
        }

        if !full_page {
            break;
        }
    }

    Ok(best)
}
