//! Error taxonomy for the upload engine.
//!
//! Construction-time problems (`Config`, `Checkpoint`) are raised before any
//! request leaves the process. Everything else surfaces from a single unit of
//! work inside a worker and is reported through the session's error callback.

use crate::checkpoint::WorkerCheckpoint;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Missing endpoint, tokens, callbacks, or an unusable file source.
    #[error("configuration error: {0}")]
    Config(String),

    /// A resumed checkpoint does not line up with the recomputed partitioning.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Non-success envelope, malformed body, or network failure.
    #[error("transport error: uri: {uri}; body: {body}")]
    Transport { uri: String, body: String },

    /// Empty or negative byte range requested for a part read.
    #[error("range error [{start}, {end})")]
    Range { start: u64, end: u64 },

    /// Part read extends past the end of the file on disk.
    #[error("read of '{path}' up to {end} exceeds file size {size}")]
    ExceedsFileSize { path: String, end: u64, size: u64 },

    /// The file source has no metadata for an index it claims to own.
    #[error("no file metadata for index {0}")]
    MissingFile(u64),

    /// The server kept rejecting the same content until the retry budget ran out.
    #[error("worker {worker}: upload still failing after retries, failed indices {indices:?}")]
    RetryExhausted {
        worker: usize,
        indices: Vec<u64>,
        checkpoint: Box<WorkerCheckpoint>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        UploadError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for UploadError {
    fn from(e: serde_yaml::Error) -> Self {
        UploadError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UploadError>;
