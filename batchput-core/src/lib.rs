#![doc = "batchput-core: resumable, concurrent, batched upload engine."]

//! This crate holds the engine behind `batchput`: partitioning a file list
//! across workers, batching small files, sending large files in parts,
//! reconciling against the server's content verification, and keeping a
//! checkpoint that can be persisted and resumed.
//!
//! # Usage
//! Build an [`UploadSession`] from a [`FileSource`], optional [`GlobalCheckpoint`],
//! [`Callbacks`] and [`UploadConfig`], then `start()` it.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod contract;
pub mod control;
pub mod error;
pub mod fileio;
pub mod plan;
pub mod progress;
pub mod session;
pub mod source;
pub mod worker;

pub use checkpoint::{GlobalCheckpoint, MultipartCursor, WorkerCheckpoint};
pub use config::UploadConfig;
pub use error::UploadError;
pub use progress::{Callbacks, ProgressUpdate};
pub use session::UploadSession;
pub use source::{FileDescriptor, FileSource, ManifestSource};
