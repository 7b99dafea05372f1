//! Worker and session checkpoints.
//!
//! A [`WorkerCheckpoint`] is both the live state of a worker and the record a
//! caller persists to resume after a restart. The session-wide
//! [`GlobalCheckpoint`] is just the ordered list of them, index-aligned with
//! worker identity.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, UploadError};

/// Position inside a large file that is being sent part by part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartCursor {
    pub file_index: u64,
    /// 1-based.
    pub next_part_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCheckpoint {
    pub start_index: u64,
    pub end_index: u64,
    pub next_index: u64,
    #[serde(default)]
    pub multipart: Option<MultipartCursor>,
    /// Retry stack: the most recently added index is retried first.
    #[serde(default)]
    pub hash_mismatch: Vec<u64>,
    #[serde(default)]
    pub uploaded: BTreeSet<u64>,
    #[serde(default)]
    pub upload_complete_size: u64,
    /// Last measured throughput in MiB/s.
    #[serde(default)]
    pub speed: f64,
}

impl WorkerCheckpoint {
    pub fn new(range: Range<u64>) -> Self {
        Self {
            start_index: range.start,
            end_index: range.end,
            next_index: range.start,
            multipart: None,
            hash_mismatch: Vec::new(),
            uploaded: BTreeSet::new(),
            upload_complete_size: 0,
            speed: 0.0,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.start_index..self.end_index
    }

    pub fn partition_len(&self) -> u64 {
        self.end_index - self.start_index
    }

    pub fn is_empty_partition(&self) -> bool {
        self.start_index == self.end_index
    }

    /// Cursor at the end and no large file mid-flight.
    pub fn is_exhausted(&self) -> bool {
        self.next_index == self.end_index && self.multipart.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.is_exhausted() && self.hash_mismatch.is_empty()
    }

    /// Files consumed by the cursor minus those waiting to be re-sent.
    pub fn completed_units(&self) -> u64 {
        (self.next_index - self.start_index).saturating_sub(self.hash_mismatch.len() as u64)
    }

    /// Takes the next index to work on: retries first, then the cursor.
    pub fn take_next(&mut self) -> Option<u64> {
        if let Some(index) = self.hash_mismatch.pop() {
            return Some(index);
        }
        if self.next_index < self.end_index {
            let index = self.next_index;
            self.next_index += 1;
            return Some(index);
        }
        None
    }

    /// Accounts for a successful transfer of `bytes` that took `elapsed`.
    pub fn record_transfer(&mut self, bytes: u64, elapsed: Duration) {
        self.upload_complete_size += bytes;
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.speed = bytes as f64 / (1024.0 * 1024.0) / secs;
        }
    }

    /// Folds server-reported failures into the retry stack.
    ///
    /// Only indices inside this partition are taken; reported indices lose
    /// their "already uploaded" status so they get sent again.
    pub fn merge_mismatches(&mut self, reported: &BTreeSet<u64>) {
        for &index in reported {
            if !self.range().contains(&index) {
                continue;
            }
            self.uploaded.remove(&index);
            if !self.hash_mismatch.contains(&index) {
                self.hash_mismatch.push(index);
            }
        }
    }

    /// Structural sanity check for checkpoints coming from outside.
    pub fn validate(&self) -> Result<()> {
        if !(self.start_index <= self.next_index && self.next_index <= self.end_index) {
            return Err(UploadError::Checkpoint(format!(
                "cursor {} outside [{}, {}]",
                self.next_index, self.start_index, self.end_index
            )));
        }
        if let Some(index) = self
            .hash_mismatch
            .iter()
            .find(|&&i| !self.range().contains(&i))
        {
            return Err(UploadError::Checkpoint(format!(
                "mismatch index {index} outside [{}, {})",
                self.start_index, self.end_index
            )));
        }
        if let Some(index) = self.uploaded.iter().find(|&&i| !self.range().contains(&i)) {
            return Err(UploadError::Checkpoint(format!(
                "uploaded index {index} outside [{}, {})",
                self.start_index, self.end_index
            )));
        }
        if let Some(mp) = &self.multipart {
            if !self.range().contains(&mp.file_index) || mp.next_part_number == 0 {
                return Err(UploadError::Checkpoint(format!(
                    "invalid multipart cursor {mp:?}"
                )));
            }
        }
        Ok(())
    }
}

/// `min(file_count, limit)`, never less than one for a non-empty set.
pub fn worker_count(file_count: u64, worker_count_limit: usize) -> usize {
    file_count.min(worker_count_limit as u64) as usize
}

/// Splits `[0, file_count)` into contiguous, disjoint ranges, one per worker.
/// The last range absorbs the remainder.
pub fn partition(file_count: u64, worker_count_limit: usize) -> Vec<Range<u64>> {
    let workers = worker_count(file_count, worker_count_limit) as u64;
    if workers == 0 {
        return Vec::new();
    }
    let base = file_count / workers;
    (0..workers)
        .map(|i| {
            let start = base * i;
            let end = if i == workers - 1 {
                file_count
            } else {
                base * (i + 1)
            };
            start..end
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalCheckpoint {
    pub workers: Vec<WorkerCheckpoint>,
}

impl GlobalCheckpoint {
    pub fn fresh(file_count: u64, worker_count_limit: usize) -> Self {
        Self {
            workers: partition(file_count, worker_count_limit)
                .into_iter()
                .map(WorkerCheckpoint::new)
                .collect(),
        }
    }

    /// Checks a resumed checkpoint against the partitioning recomputed for
    /// this run. Any drift (usually a changed worker count limit) is fatal.
    pub fn validate_against(&self, file_count: u64, worker_count_limit: usize) -> Result<()> {
        let expected = partition(file_count, worker_count_limit);
        if self.workers.len() != expected.len() {
            return Err(UploadError::Checkpoint(format!(
                "expected {} worker checkpoints, got {}",
                expected.len(),
                self.workers.len()
            )));
        }
        for (i, (cp, range)) in self.workers.iter().zip(expected.iter()).enumerate() {
            if cp.range() != *range {
                return Err(UploadError::Checkpoint(format!(
                    "worker {i} owns {:?}, expected {:?}",
                    cp.range(),
                    range
                )));
            }
            cp.validate()?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the checkpoint next to `path` and renames it into place.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), workers = self.workers.len(), "Saved checkpoint");
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let cp = Self::from_json(&json)?;
        info!(path = %path.display(), workers = cp.workers.len(), "Loaded checkpoint");
        Ok(cp)
    }
}
