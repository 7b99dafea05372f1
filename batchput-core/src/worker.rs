//! Per-partition upload loop.
//!
//! A worker owns one contiguous slice of the file index space and drives it to
//! completion one unit of work at a time: a batch of small files, one whole
//! file, or one part of a large file. Every unit is computed against a copy of
//! the checkpoint and committed only when it succeeded, so the last committed
//! checkpoint is always a valid resume point.
//!
//! Between units the worker polls its [`ControlSignal`] and, when enough has
//! changed, reconciles with the server's content verification. Indices that
//! failed verification are pushed onto the retry stack. If two consecutive
//! reconciliations report the same non-empty set while no multipart transfer is
//! open, the retry budget shrinks by one; running out is fatal for the worker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{MultipartCursor, WorkerCheckpoint};
use crate::config::UploadConfig;
use crate::contract::{FileQuery, StorageApi, UploadEntry, UploadRequest};
use crate::control::{ControlSignal, RunState};
use crate::error::{Result, UploadError};
use crate::fileio::{read_file, read_range};
use crate::plan::{pack_batch, part_range, BatchLimits};
use crate::progress::{ProgressAggregator, SessionEvent};
use crate::source::{describe, FileSource};

/// Share of a partition that may be consumed before re-checking hashes.
const CHECK_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Finished,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    Reset,
    Decremented(u32),
    Exhausted,
}

/// Tracks how often the server has repeated the same rejection.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
    last_reported: Option<BTreeSet<u64>>,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            remaining: max,
            last_reported: None,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Feeds one reconciliation result into the budget.
    pub fn observe(&mut self, reported: &BTreeSet<u64>, multipart_open: bool) -> RetryVerdict {
        let repeated = !reported.is_empty()
            && !multipart_open
            && self.last_reported.as_ref() == Some(reported);
        self.last_reported = Some(reported.clone());
        if !repeated {
            self.remaining = self.max;
            return RetryVerdict::Reset;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            RetryVerdict::Exhausted
        } else {
            RetryVerdict::Decremented(self.remaining)
        }
    }
}

pub struct Worker {
    id: usize,
    source: Arc<dyn FileSource>,
    api: Arc<dyn StorageApi>,
    aggregator: Arc<ProgressAggregator>,
    config: Arc<UploadConfig>,
    control: ControlSignal,
    checkpoint: WorkerCheckpoint,
    retry: RetryBudget,
    need_check: bool,
    last_check_mark: u64,
}

impl Worker {
    pub fn new(
        id: usize,
        source: Arc<dyn FileSource>,
        api: Arc<dyn StorageApi>,
        aggregator: Arc<ProgressAggregator>,
        config: Arc<UploadConfig>,
        control: ControlSignal,
        checkpoint: WorkerCheckpoint,
    ) -> Self {
        let retry = RetryBudget::new(config.max_retry);
        let last_check_mark = checkpoint.next_index;
        Self {
            id,
            source,
            api,
            aggregator,
            config,
            control,
            checkpoint,
            retry,
            need_check: false,
            last_check_mark,
        }
    }

    pub fn checkpoint(&self) -> &WorkerCheckpoint {
        &self.checkpoint
    }

    pub async fn run(mut self) -> WorkerOutcome {
        info!(
            worker = self.id,
            start = self.checkpoint.start_index,
            end = self.checkpoint.end_index,
            next = self.checkpoint.next_index,
            "Worker started"
        );

        if self.checkpoint.is_empty_partition() {
            return self.finish();
        }
        if self.stopped() {
            return self.stop();
        }

        let started = Instant::now();
        if let Err(e) = self.reconcile_uploaded().await {
            return self.fail(e);
        }
        debug!(worker = self.id, elapsed = ?started.elapsed(), "Uploaded check done");

        loop {
            if self.stopped() {
                return self.stop();
            }

            match self.step().await {
                Ok(cp) => self.commit(cp),
                Err(e) => return self.fail(e),
            }

            if self.stopped() {
                return self.stop();
            }

            if self.reconcile_due() {
                if self.need_check && self.checkpoint.is_complete() {
                    self.wait_for_pending_check().await;
                    if self.stopped() {
                        return self.stop();
                    }
                }
                if let Err(e) = self.reconcile_hashes().await {
                    return self.fail(e);
                }
                if self.stopped() {
                    return self.stop();
                }
            }

            if self.checkpoint.is_complete() && !self.need_check {
                return self.finish();
            }
        }
    }

    fn stopped(&self) -> bool {
        self.control.state() != RunState::Running
    }

    fn commit(&mut self, checkpoint: WorkerCheckpoint) {
        self.checkpoint = checkpoint;
        self.aggregator.record(self.id, self.checkpoint.clone());
    }

    fn finish(self) -> WorkerOutcome {
        info!(
            worker = self.id,
            bytes = self.checkpoint.upload_complete_size,
            "Worker finished"
        );
        self.aggregator.worker_finished(self.id);
        WorkerOutcome::Finished
    }

    fn stop(self) -> WorkerOutcome {
        info!(worker = self.id, state = ?self.control.state(), next = self.checkpoint.next_index, "Worker stopped");
        self.aggregator.flush();
        WorkerOutcome::Stopped
    }

    fn fail(self, e: UploadError) -> WorkerOutcome {
        error!(worker = self.id, error = %e, next = self.checkpoint.next_index, "Worker failed");
        self.aggregator.worker_failed(self.id, e);
        if self.config.abort_on_worker_failure && self.control.cancel() {
            warn!(worker = self.id, "Cancelling sibling workers after failure");
            self.aggregator.emit(SessionEvent::Cancelled);
        }
        WorkerOutcome::Failed
    }

    fn reconcile_due(&self) -> bool {
        let cp = &self.checkpoint;
        let progressed = cp.next_index.saturating_sub(self.last_check_mark) as f64;
        let len = cp.partition_len().max(1) as f64;
        progressed / len > CHECK_FRACTION
            || (cp.is_exhausted() && cp.hash_mismatch.is_empty())
            || self.need_check
    }

    async fn wait_for_pending_check(&self) {
        let mut rx = self.control.subscribe();
        let interrupted = async {
            let _ = rx.wait_for(|s| *s != RunState::Running).await;
        };
        tokio::select! {
            _ = tokio::time::sleep(self.config.pending_check_interval()) => {}
            _ = interrupted => {}
        };
    }

    /// Learns which of the remaining files the server already holds.
    async fn reconcile_uploaded(&mut self) -> Result<()> {
        let mut cp = self.checkpoint.clone();
        if cp.next_index >= cp.end_index {
            return Ok(());
        }
        let queries = (cp.next_index..cp.end_index)
            .map(|i| describe(self.source.as_ref(), i).map(|f| FileQuery::new(i, &f)))
            .collect::<Result<Vec<_>>>()?;
        let existing = self.api.check_uploaded(queries).await?;
        let range = cp.range();
        let pending = cp.hash_mismatch.clone();
        cp.uploaded.extend(
            existing
                .into_iter()
                .filter(|i| range.contains(i) && !pending.contains(i)),
        );
        info!(worker = self.id, existing = cp.uploaded.len(), "Server already holds files");
        self.commit(cp);
        Ok(())
    }

    async fn reconcile_hashes(&mut self) -> Result<()> {
        let mut cp = self.checkpoint.clone();
        self.last_check_mark = cp.next_index;

        let check = self.api.check_hashes().await?;
        self.need_check = check.need_check;
        let range = cp.range();
        let reported: BTreeSet<u64> = check
            .failed
            .into_iter()
            .filter(|i| range.contains(i))
            .collect();
        let verdict = self.retry.observe(&reported, cp.multipart.is_some());
        cp.merge_mismatches(&reported);
        info!(
            worker = self.id,
            failed = reported.len(),
            pending = cp.hash_mismatch.len(),
            need_check = self.need_check,
            "Hash reconciliation"
        );
        self.commit(cp);

        match verdict {
            RetryVerdict::Reset => Ok(()),
            RetryVerdict::Decremented(left) => {
                warn!(worker = self.id, retries_left = left, failed = ?reported, "Server rejected the same files again");
                Ok(())
            }
            RetryVerdict::Exhausted => Err(UploadError::RetryExhausted {
                worker: self.id,
                indices: reported.into_iter().collect(),
                checkpoint: Box::new(self.checkpoint.clone()),
            }),
        }
    }

    /// Performs exactly one unit of work and returns the resulting checkpoint.
    async fn step(&self) -> Result<WorkerCheckpoint> {
        let mut cp = self.checkpoint.clone();

        if let Some(cursor) = cp.multipart {
            self.send_part(&mut cp, cursor).await?;
            return Ok(cp);
        }

        if self.config.use_batch {
            let limits = BatchLimits {
                max_count: self.config.batch_count_limit,
                max_bytes: self.config.batch_size_limit,
            };
            let batch = pack_batch(&mut cp, self.source.as_ref(), limits)?;
            if !batch.is_empty() {
                self.send_batch(&mut cp, &batch).await?;
                return Ok(cp);
            }
        }

        self.send_single(&mut cp).await?;
        Ok(cp)
    }

    async fn send_batch(&self, cp: &mut WorkerCheckpoint, batch: &[u64]) -> Result<()> {
        let started = Instant::now();
        let mut entries = Vec::with_capacity(batch.len());
        let mut body = Vec::new();
        for &index in batch {
            let file = describe(self.source.as_ref(), index)?;
            body.extend(read_file(&file.path).await?);
            entries.push(UploadEntry::new(index, &file));
        }
        let total: u64 = entries.iter().map(|e| e.size).sum();
        debug!(worker = self.id, indices = ?batch, bytes = total, "Uploading batch");
        self.api
            .upload(UploadRequest {
                entries,
                part: None,
                body,
            })
            .await?;
        cp.record_transfer(total, started.elapsed());
        Ok(())
    }

    async fn send_single(&self, cp: &mut WorkerCheckpoint) -> Result<()> {
        let Some(index) = cp.take_next() else {
            return Ok(());
        };
        if cp.uploaded.contains(&index) {
            debug!(worker = self.id, index, "Skipping file already on server");
            return Ok(());
        }

        let file = describe(self.source.as_ref(), index)?;
        if self.config.use_multipart && file.size > self.config.multipart_size_limit {
            let cursor = MultipartCursor {
                file_index: index,
                next_part_number: 1,
            };
            cp.multipart = Some(cursor);
            return self.send_part(cp, cursor).await;
        }

        let started = Instant::now();
        let body = read_file(&file.path).await?;
        debug!(worker = self.id, index, bytes = file.size, "Uploading file");
        self.api
            .upload(UploadRequest {
                entries: vec![UploadEntry::new(index, &file)],
                part: None,
                body,
            })
            .await?;
        cp.record_transfer(file.size, started.elapsed());
        Ok(())
    }

    async fn send_part(&self, cp: &mut WorkerCheckpoint, cursor: MultipartCursor) -> Result<()> {
        let index = cursor.file_index;
        if cp.uploaded.contains(&index) {
            cp.multipart = None;
            return Ok(());
        }
        let file = describe(self.source.as_ref(), index)?;
        let Some(range) = part_range(
            cursor.next_part_number,
            self.config.multipart_size_limit,
            file.size,
        ) else {
            cp.multipart = None;
            return Ok(());
        };

        let started = Instant::now();
        let body = read_range(&file.path, range.start, range.end).await?;
        debug!(
            worker = self.id,
            index,
            part = range.part_number,
            start = range.start,
            end = range.end,
            "Uploading part"
        );
        self.api
            .upload(UploadRequest {
                entries: vec![UploadEntry::new(index, &file)],
                part: Some(range),
                body,
            })
            .await?;
        cp.record_transfer(range.len(), started.elapsed());
        cp.multipart = if range.end >= file.size {
            None
        } else {
            Some(MultipartCursor {
                file_index: index,
                next_part_number: cursor.next_part_number + 1,
            })
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::GlobalCheckpoint;
    use crate::contract::{Envelope, HashCheck, MockStorageApi};
    use crate::progress::PROGRESS_INTERVAL;
    use crate::source::{FileDescriptor, ManifestSource};
    use tokio::sync::mpsc;

    fn set(items: &[u64]) -> BTreeSet<u64> {
        items.iter().copied().collect()
    }

    #[test]
    fn identical_repeat_decrements_by_one() {
        let mut budget = RetryBudget::new(3);
        assert_eq!(budget.observe(&set(&[4, 5]), false), RetryVerdict::Reset);
        assert_eq!(
            budget.observe(&set(&[4, 5]), false),
            RetryVerdict::Decremented(2)
        );
        assert_eq!(budget.remaining(), 2);
    }

    #[test]
    fn different_set_or_open_multipart_resets() {
        let mut budget = RetryBudget::new(3);
        budget.observe(&set(&[1]), false);
        budget.observe(&set(&[1]), false);
        assert_eq!(budget.remaining(), 2);

        assert_eq!(budget.observe(&set(&[1, 2]), false), RetryVerdict::Reset);
        assert_eq!(budget.remaining(), 3);

        budget.observe(&set(&[1, 2]), false);
        assert_eq!(budget.remaining(), 2);
        assert_eq!(budget.observe(&set(&[1, 2]), true), RetryVerdict::Reset);
        assert_eq!(budget.remaining(), 3);
    }

    #[test]
    fn empty_reports_never_count() {
        let mut budget = RetryBudget::new(1);
        for _ in 0..5 {
            assert_eq!(budget.observe(&set(&[]), false), RetryVerdict::Reset);
        }
    }

    #[test]
    fn budget_runs_out_after_max_identical_repeats() {
        let mut budget = RetryBudget::new(2);
        let s = set(&[9]);
        assert_eq!(budget.observe(&s, false), RetryVerdict::Reset);
        assert_eq!(budget.observe(&s, false), RetryVerdict::Decremented(1));
        assert_eq!(budget.observe(&s, false), RetryVerdict::Exhausted);
    }

    #[test]
    fn zero_budget_fails_on_first_repeat() {
        let mut budget = RetryBudget::new(0);
        let s = set(&[3]);
        assert_eq!(budget.observe(&s, false), RetryVerdict::Reset);
        assert_eq!(budget.observe(&s, false), RetryVerdict::Exhausted);
    }

    fn worker_over(
        dir: &std::path::Path,
        sizes: &[usize],
        api: MockStorageApi,
    ) -> (Worker, Arc<ProgressAggregator>) {
        let files = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let path = dir.join(format!("{i}.bin"));
                std::fs::write(&path, vec![b'a' + i as u8; size]).unwrap();
                FileDescriptor {
                    path,
                    name: format!("{i}.bin"),
                    size: size as u64,
                    fingerprint: format!("{i:032x}"),
                }
            })
            .collect();
        let (tx, _rx) = mpsc::unbounded_channel();
        let cp = GlobalCheckpoint::fresh(sizes.len() as u64, 1);
        let aggregator = Arc::new(ProgressAggregator::new(
            sizes.len() as u64,
            cp.clone(),
            PROGRESS_INTERVAL,
            tx,
        ));
        let control = ControlSignal::new();
        control.run();
        let worker = Worker::new(
            0,
            Arc::new(ManifestSource::new(files)),
            Arc::new(api),
            aggregator.clone(),
            Arc::new(UploadConfig::new("http://h", "t", "b")),
            control,
            cp.workers[0].clone(),
        );
        (worker, aggregator)
    }

    #[tokio::test]
    async fn worker_skips_stored_files_and_batches_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockStorageApi::new();
        api.expect_check_uploaded()
            .times(1)
            .returning(|files| {
                assert_eq!(files.len(), 3);
                Ok(BTreeSet::from([0]))
            });
        api.expect_upload()
            .times(1)
            .withf(|req| {
                req.entries.iter().map(|e| e.index).collect::<Vec<_>>() == vec![1, 2]
                    && req.body == b"bbccc"
            })
            .returning(|_| {
                Ok(Envelope {
                    code: 200,
                    ..Envelope::default()
                })
            });
        api.expect_check_hashes()
            .times(1)
            .returning(|| Ok(HashCheck::default()));

        let (worker, aggregator) = worker_over(dir.path(), &[1, 2, 3], api);
        assert_eq!(worker.run().await, WorkerOutcome::Finished);
        assert!(aggregator.is_worker_finished(0));
        let cp = aggregator.worker_checkpoint(0).unwrap();
        assert!(cp.is_complete());
        assert_eq!(cp.upload_complete_size, 5);
    }

    #[tokio::test]
    async fn failed_unit_leaves_the_checkpoint_at_the_last_good_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockStorageApi::new();
        api.expect_check_uploaded()
            .returning(|_| Ok(BTreeSet::new()));
        api.expect_upload().times(1).returning(|_| {
            Err(UploadError::Transport {
                uri: "http://h/v2/upload".into(),
                body: "oops".into(),
            })
        });

        let (worker, aggregator) = worker_over(dir.path(), &[4, 4], api);
        assert_eq!(worker.run().await, WorkerOutcome::Failed);
        assert_eq!(aggregator.error_count(), 1);
        let cp = aggregator.worker_checkpoint(0).unwrap();
        assert_eq!(cp.next_index, 0);
        assert_eq!(cp.upload_complete_size, 0);
    }
}
