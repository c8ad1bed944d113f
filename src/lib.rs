// src/lib.rs
pub mod alarm;
pub mod capture;
pub mod compose;
pub mod config;
pub mod delivery;
pub mod error;
pub mod http;
pub mod media;
pub mod store;
pub mod types;

// Re-export der wichtigsten Typen
pub use compose::{ComposePipeline, ComposedClip};
pub use error::{ComposeError, PollError, ToolError};
pub use store::SegmentStore;
pub use types::{ComposeRequest, Resolution, Segment, Source, SourceId};
