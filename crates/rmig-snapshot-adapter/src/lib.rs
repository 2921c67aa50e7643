//! File-backed connectors: a source engine read from an exported JSON snapshot and a target
//! engine that records every command in an append-only JSONL journal.

pub mod journal;
pub mod snapshot;

use thiserror::Error;

pub use journal::{JournalEntry, JournalInstance, JournalJob, JournalTarget, JOURNAL_PARTITION};
pub use snapshot::{SnapshotInstance, SnapshotSource, SourceSnapshot};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("journal {path} line {line}: {message}")]
    Journal {
        path: String,
        line: usize,
        message: String,
    },
}
