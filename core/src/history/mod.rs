//! Per-query history of what the tree did

pub mod entry;
pub mod recorder;

pub use entry::QueryHistory;
pub use recorder::{HistoryFile, HistoryMetadata, HistoryRecorder};
