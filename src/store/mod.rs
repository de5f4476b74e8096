//! Durable progress: per-target checkpoints and the interaction log.

pub mod checkpoint;
pub mod interactions;

pub use checkpoint::{CheckpointStatus, CheckpointStore, ExtractionCheckpoint, FileCheckpointStore};
pub use interactions::{InteractionGate, InteractionKind, InteractionRecord};

/// Storage failures. Any of these stops the campaign.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store worker is gone: {0}")]
    WorkerGone(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.display().to_string(),
            source,
        }
    }
}
