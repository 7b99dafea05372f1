//! # contract: the storage server as seen by the upload engine
//!
//! Workers never talk HTTP directly. Every round trip goes through the
//! [`StorageApi`] trait, which has three operations:
//!
//! - [`StorageApi::upload`]: one PUT carrying a batch, a whole file, or one
//!   part of a large file.
//! - [`StorageApi::check_hashes`]: ask the server which stored files failed
//!   content verification.
//! - [`StorageApi::check_uploaded`]: ask the server which of a worker's
//!   remaining files it already holds.
//!
//! [`crate::client::HttpStorage`] is the production implementation. The trait
//! is annotated for `mockall` so tests can script server behaviour.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::Result;
use crate::source::FileDescriptor;

/// Per-file metadata attached to an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEntry {
    pub index: u64,
    pub name: String,
    pub size: u64,
    pub fingerprint: String,
}

impl UploadEntry {
    pub fn new(index: u64, file: &FileDescriptor) -> Self {
        Self {
            index,
            name: file.name.clone(),
            size: file.size,
            fingerprint: file.fingerprint.clone(),
        }
    }
}

/// Byte range of one part of a large file; `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl PartRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// One PUT. For a batch, `body` is the concatenation of the files in the
/// same order as `entries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub entries: Vec<UploadEntry>,
    pub part: Option<PartRange>,
    pub body: Vec<u8>,
}

/// Successful response envelope (`code == 200`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub code: u16,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of a content verification round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashCheck {
    pub failed: BTreeSet<u64>,
    /// The server has not finished verifying everything yet.
    pub need_check: bool,
}

/// Entry of an uploaded-check query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileQuery {
    pub name: String,
    pub index: u64,
    pub file_size: u64,
    /// Opaque descriptor; the server echoes it back in its own records.
    pub meta: String,
    pub hash: String,
}

impl FileQuery {
    pub fn new(index: u64, file: &FileDescriptor) -> Self {
        Self {
            name: file.name.clone(),
            index,
            file_size: file.size,
            meta: file.path.to_string_lossy().into_owned(),
            hash: file.fingerprint.clone(),
        }
    }
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Send one batch, whole file, or part.
    async fn upload(&self, req: UploadRequest) -> Result<Envelope>;

    /// Indices whose stored content failed verification.
    async fn check_hashes(&self) -> Result<HashCheck>;

    /// Subset of `files` the server already holds.
    async fn check_uploaded(&self, files: Vec<FileQuery>) -> Result<BTreeSet<u64>>;
}
