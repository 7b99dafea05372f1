//! Work planning: batch packing and multipart ranges.
//!
//! Both functions are pure with respect to the network. `pack_batch` edits the
//! working copy of a checkpoint it is handed; the worker only commits that copy
//! once the request built from it has succeeded.

use tracing::debug;

use crate::checkpoint::WorkerCheckpoint;
use crate::contract::PartRange;
use crate::error::Result;
use crate::source::{describe, FileSource};

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_count: usize,
    /// Exclusive upper bound on the summed size of a batch.
    pub max_bytes: u64,
}

/// Greedily packs small files into one batch.
///
/// Pending retries are drained from the top of the stack first, then the
/// cursor moves forward. Files the server already holds are stepped over
/// without being packed. Packing stops at the first candidate that would push
/// the batch to or past `max_bytes`; that candidate is left for the
/// single-file path. The returned order is the order of the request body.
pub fn pack_batch(
    cp: &mut WorkerCheckpoint,
    source: &dyn FileSource,
    limits: BatchLimits,
) -> Result<Vec<u64>> {
    let mut batch = Vec::new();
    let mut total = 0u64;

    while batch.len() < limits.max_count {
        let Some(&index) = cp.hash_mismatch.last() else {
            break;
        };
        let size = describe(source, index)?.size;
        if total + size >= limits.max_bytes {
            break;
        }
        cp.hash_mismatch.pop();
        batch.push(index);
        total += size;
    }

    while cp.next_index < cp.end_index && batch.len() < limits.max_count {
        let index = cp.next_index;
        if cp.uploaded.contains(&index) {
            debug!(index, "Skipping file already on server");
            cp.next_index += 1;
            continue;
        }
        let size = describe(source, index)?.size;
        if total + size >= limits.max_bytes {
            break;
        }
        batch.push(index);
        cp.next_index += 1;
        total += size;
    }

    Ok(batch)
}

/// Byte range of 1-based part `part_number`, or `None` once past the end.
pub fn part_range(part_number: u32, part_size: u64, file_size: u64) -> Option<PartRange> {
    if part_number == 0 || part_size == 0 {
        return None;
    }
    let start = u64::from(part_number - 1) * part_size;
    if start >= file_size {
        return None;
    }
    let end = (u64::from(part_number) * part_size).min(file_size);
    Some(PartRange {
        part_number,
        start,
        end,
        total: file_size,
    })
}

pub fn part_count(file_size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    file_size.div_ceil(part_size)
}
