use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::checkpoint::{GlobalCheckpoint, WorkerCheckpoint};
use crate::error::{Result, UploadError};

/// Minimum wall-clock gap between two progress callbacks.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// What the progress callback receives.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Fraction of files done, in `[0, 1]`, never smaller than a previous report.
    pub value: f64,
    /// Sum of the workers' last measured throughput, MiB/s.
    pub speed: f64,
    pub uploaded_bytes: u64,
    pub checkpoint: GlobalCheckpoint,
}

pub type ProgressCallback = Box<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(usize, &UploadError) + Send + Sync>;
pub type SignalCallback = Box<dyn Fn() + Send + Sync>;

/// Caller hooks. `progress`, `error` and `finished` are mandatory.
#[derive(Default)]
pub struct Callbacks {
    on_progress: Option<ProgressCallback>,
    on_error: Option<ErrorCallback>,
    on_finished: Option<SignalCallback>,
    on_started: Option<SignalCallback>,
    on_paused: Option<SignalCallback>,
    on_cancelled: Option<SignalCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&ProgressUpdate) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(usize, &UploadError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_finished(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }

    pub fn on_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_started = Some(Box::new(f));
        self
    }

    pub fn on_paused(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_paused = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancelled = Some(Box::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.on_progress.is_none() || self.on_error.is_none() || self.on_finished.is_none() {
            return Err(UploadError::Config(
                "progress, error and finished callbacks are required".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum SessionEvent {
    Started,
    Progress(ProgressUpdate),
    Error { worker: usize, error: UploadError },
    Finished,
    Paused,
    Cancelled,
}

/// Runs caller callbacks on their own task, off the workers' call stacks.
pub fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    callbacks: Callbacks,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Started => fire(&callbacks.on_started),
                SessionEvent::Paused => fire(&callbacks.on_paused),
                SessionEvent::Cancelled => fire(&callbacks.on_cancelled),
                SessionEvent::Finished => fire(&callbacks.on_finished),
                SessionEvent::Progress(update) => {
                    if let Some(cb) = &callbacks.on_progress {
                        cb(&update);
                    }
                }
                SessionEvent::Error { worker, error } => {
                    if let Some(cb) = &callbacks.on_error {
                        cb(worker, &error);
                    }
                }
            }
        }
        debug!("Event dispatcher drained");
    })
}

fn fire(cb: &Option<SignalCallback>) {
    if let Some(cb) = cb {
        cb();
    }
}

struct AggregatorState {
    slots: Vec<WorkerCheckpoint>,
    finished: Vec<bool>,
    finished_reported: bool,
    last_notified: Option<Instant>,
    last_value: f64,
    /// A record arrived since the last progress event.
    pending: bool,
    error_count: usize,
}

/// Folds per-worker checkpoints into one monotone, rate-limited progress value.
///
/// Each worker owns one slot and replaces it wholesale; the fold reads all
/// slots under the same lock, so a slot is never seen half-written.
pub struct ProgressAggregator {
    file_count: u64,
    interval: Duration,
    state: Mutex<AggregatorState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ProgressAggregator {
    pub fn new(
        file_count: u64,
        checkpoint: GlobalCheckpoint,
        interval: Duration,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let workers = checkpoint.workers.len();
        let mut state = AggregatorState {
            slots: checkpoint.workers,
            finished: vec![false; workers],
            finished_reported: false,
            last_notified: None,
            last_value: 0.0,
            pending: false,
            error_count: 0,
        };
        state.last_value = fold(&state.slots, file_count);
        Self {
            file_count,
            interval,
            state: Mutex::new(state),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn emit(&self, event: SessionEvent) {
        // The receiver only goes away when the session is dropped.
        let _ = self.events.send(event);
    }

    /// Stores a worker's latest checkpoint and folds it into the session value.
    /// A progress event goes out only if the interval has elapsed; otherwise
    /// the update is held back until the next due record or [`Self::flush`].
    /// Returns the emitted value.
    pub fn record(&self, worker: usize, checkpoint: WorkerCheckpoint) -> Option<f64> {
        self.record_at(worker, checkpoint, Instant::now())
    }

    pub fn record_at(
        &self,
        worker: usize,
        checkpoint: WorkerCheckpoint,
        now: Instant,
    ) -> Option<f64> {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(worker) {
            *slot = checkpoint;
        }
        state.last_value = fold(&state.slots, self.file_count).max(state.last_value);
        state.pending = true;
        let due = state
            .last_notified
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        Some(self.emit_progress(&mut state, now))
    }

    /// Emits the held-back update, if any, regardless of the interval.
    pub fn flush(&self) -> Option<f64> {
        let mut state = self.lock();
        if !state.pending {
            return None;
        }
        Some(self.emit_progress(&mut state, Instant::now()))
    }

    fn emit_progress(&self, state: &mut AggregatorState, now: Instant) -> f64 {
        state.last_notified = Some(now);
        state.pending = false;
        let update = ProgressUpdate {
            value: state.last_value,
            speed: state.slots.iter().map(|s| s.speed).sum(),
            uploaded_bytes: state.slots.iter().map(|s| s.upload_complete_size).sum(),
            checkpoint: GlobalCheckpoint {
                workers: state.slots.clone(),
            },
        };
        self.emit(SessionEvent::Progress(update));
        state.last_value
    }

    /// Marks a worker done; fires the session's `finished` once all are.
    /// Any held-back progress goes out first.
    pub fn worker_finished(&self, worker: usize) -> bool {
        let mut state = self.lock();
        if let Some(done) = state.finished.get_mut(worker) {
            *done = true;
        }
        if state.pending {
            self.emit_progress(&mut state, Instant::now());
        }
        if state.finished_reported || !state.finished.iter().all(|&d| d) {
            return false;
        }
        state.finished_reported = true;
        info!(workers = state.finished.len(), "All workers finished");
        self.emit(SessionEvent::Finished);
        true
    }

    pub fn worker_failed(&self, worker: usize, error: UploadError) {
        let mut state = self.lock();
        state.error_count += 1;
        if state.pending {
            self.emit_progress(&mut state, Instant::now());
        }
        drop(state);
        self.emit(SessionEvent::Error { worker, error });
    }

    pub fn is_worker_finished(&self, worker: usize) -> bool {
        self.lock().finished.get(worker).copied().unwrap_or(false)
    }

    pub fn worker_checkpoint(&self, worker: usize) -> Option<WorkerCheckpoint> {
        self.lock().slots.get(worker).cloned()
    }

    pub fn snapshot(&self) -> GlobalCheckpoint {
        GlobalCheckpoint {
            workers: self.lock().slots.clone(),
        }
    }

    /// Last value handed to the caller (or the resumed starting point).
    pub fn progress(&self) -> f64 {
        self.lock().last_value
    }

    pub fn error_count(&self) -> usize {
        self.lock().error_count
    }
}

/// Share of files done across all partitions, clamped to `[0, 1]`.
pub fn fold(slots: &[WorkerCheckpoint], file_count: u64) -> f64 {
    if file_count == 0 {
        return 0.0;
    }
    let done: u64 = slots.iter().map(|s| s.completed_units()).sum();
    (done as f64 / file_count as f64).clamp(0.0, 1.0)
}
