//! Caller-supplied file lists.
//!
//! The engine only ever asks a [`FileSource`] two things: how many files there
//! are, and what the metadata for a given global index is. Fingerprints are
//! computed by the caller and passed through untouched.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::error::{Result, UploadError};

/// Metadata for one file in the upload set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Hex content fingerprint, opaque to the engine.
    pub fingerprint: String,
}

pub trait FileSource: Send + Sync {
    fn file_count(&self) -> usize;

    fn file_info(&self, index: u64) -> Option<FileDescriptor>;
}

/// On-disk manifest entry; `name` falls back to the path's file name.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    path: PathBuf,
    #[serde(default)]
    name: Option<String>,
    size: u64,
    fingerprint: String,
}

/// A [`FileSource`] backed by an in-memory list.
#[derive(Debug, Clone, Default)]
pub struct ManifestSource {
    files: Vec<FileDescriptor>,
}

impl ManifestSource {
    pub fn new(files: Vec<FileDescriptor>) -> Self {
        Self { files }
    }

    /// Loads a manifest from a `.json`, `.yaml` or `.yml` file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            error!(error = ?e, manifest = %path.display(), "Failed to read manifest");
            e
        })?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let entries: Vec<ManifestEntry> = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        let files = entries
            .into_iter()
            .map(|e| {
                let name = e.name.unwrap_or_else(|| {
                    e.path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| e.path.to_string_lossy().into_owned())
                });
                FileDescriptor {
                    path: e.path,
                    name,
                    size: e.size,
                    fingerprint: e.fingerprint,
                }
            })
            .collect::<Vec<_>>();
        info!(manifest = %path.display(), files = files.len(), "Loaded manifest");
        Ok(Self { files })
    }

    pub fn files(&self) -> &[FileDescriptor] {
        &self.files
    }
}

impl FileSource for ManifestSource {
    fn file_count(&self) -> usize {
        self.files.len()
    }

    fn file_info(&self, index: u64) -> Option<FileDescriptor> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.files.get(i))
            .cloned()
    }
}

/// Looks up `index`, turning a hole in the source into an error.
pub fn describe(source: &dyn FileSource, index: u64) -> Result<FileDescriptor> {
    source
        .file_info(index)
        .ok_or(UploadError::MissingFile(index))
}
