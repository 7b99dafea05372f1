//! # session: the orchestrator
//!
//! [`UploadSession`] validates its inputs, partitions the file set, builds or
//! checks the resumable [`GlobalCheckpoint`], and owns one tokio task per
//! worker. Control calls fan out through a shared [`ControlSignal`]; caller
//! callbacks are dispatched from a separate task fed by the progress
//! aggregator.
//!
//! Typical flow:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use batchput_core::{Callbacks, ManifestSource, UploadConfig, UploadSession};
//! # async fn demo(source: ManifestSource) -> batchput_core::error::Result<()> {
//! let config = UploadConfig::new("http://localhost:5000", "token", "batch");
//! let callbacks = Callbacks::new()
//!     .on_progress(|p| println!("{:.1}%", p.value * 100.0))
//!     .on_error(|worker, e| eprintln!("worker {worker}: {e}"))
//!     .on_finished(|| println!("done"));
//! let session = UploadSession::new_http(Arc::new(source), None, callbacks, config)?;
//! session.start();
//! session.wait().await;
//! # Ok(())
//! # }
//! ```

use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint::GlobalCheckpoint;
use crate::client::HttpStorage;
use crate::config::UploadConfig;
use crate::contract::StorageApi;
use crate::control::ControlSignal;
use crate::error::{Result, UploadError};
use crate::progress::{
    spawn_dispatcher, Callbacks, ProgressAggregator, SessionEvent, PROGRESS_INTERVAL,
};
use crate::source::{describe, FileSource};
use crate::worker::{Worker, WorkerOutcome};

struct Pending {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    callbacks: Callbacks,
}

pub struct UploadSession {
    source: Arc<dyn FileSource>,
    api: Arc<dyn StorageApi>,
    config: Arc<UploadConfig>,
    aggregator: Arc<ProgressAggregator>,
    control: ControlSignal,
    worker_count: usize,
    dispatcher: Mutex<Option<Pending>>,
    handles: Mutex<Vec<Option<JoinHandle<WorkerOutcome>>>>,
}

impl UploadSession {
    /// Builds a session. Fails before any network traffic when the
    /// configuration, callbacks, file source or resumed checkpoint are unusable.
    pub fn new(
        source: Arc<dyn FileSource>,
        checkpoint: Option<GlobalCheckpoint>,
        callbacks: Callbacks,
        config: UploadConfig,
        api: Arc<dyn StorageApi>,
    ) -> Result<Self> {
        config.validate()?;
        callbacks.validate()?;

        let file_count = source.file_count() as u64;
        if file_count == 0 {
            return Err(UploadError::Config("file source is empty".into()));
        }
        for index in 0..file_count {
            describe(source.as_ref(), index)?;
        }

        let checkpoint = match checkpoint {
            Some(cp) => {
                cp.validate_against(file_count, config.worker_count_limit)?;
                info!(workers = cp.workers.len(), "Resuming from checkpoint");
                cp
            }
            None => GlobalCheckpoint::fresh(file_count, config.worker_count_limit),
        };
        let worker_count = checkpoint.workers.len();
        config.trace_loaded();
        info!(files = file_count, workers = worker_count, "Upload session created");

        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = Arc::new(ProgressAggregator::new(
            file_count,
            checkpoint,
            PROGRESS_INTERVAL,
            tx,
        ));

        Ok(Self {
            source,
            api,
            config: Arc::new(config),
            aggregator,
            control: ControlSignal::new(),
            worker_count,
            dispatcher: Mutex::new(Some(Pending {
                events: rx,
                callbacks,
            })),
            handles: Mutex::new((0..worker_count).map(|_| None).collect()),
        })
    }

    /// Same as [`UploadSession::new`] with the HTTP client built from `config`.
    pub fn new_http(
        source: Arc<dyn FileSource>,
        checkpoint: Option<GlobalCheckpoint>,
        callbacks: Callbacks,
        config: UploadConfig,
    ) -> Result<Self> {
        config.validate()?;
        let api = Arc::new(HttpStorage::new(&config)?);
        Self::new(source, checkpoint, callbacks, config, api)
    }

    fn handles(&self) -> MutexGuard<'_, Vec<Option<JoinHandle<WorkerOutcome>>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launches every worker that is neither running nor finished.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.control.is_cancelled() {
            warn!("start() called on a cancelled session; ignoring");
            return;
        }
        self.control.run();

        if let Some(pending) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            spawn_dispatcher(pending.events, pending.callbacks);
        }

        let mut launched = 0;
        let mut handles = self.handles();
        for (id, slot) in handles.iter_mut().enumerate() {
            let running = slot.as_ref().is_some_and(|h| !h.is_finished());
            if running || self.aggregator.is_worker_finished(id) {
                continue;
            }
            let Some(checkpoint) = self.aggregator.worker_checkpoint(id) else {
                continue;
            };
            let worker = Worker::new(
                id,
                self.source.clone(),
                self.api.clone(),
                self.aggregator.clone(),
                self.config.clone(),
                self.control.clone(),
                checkpoint,
            );
            *slot = Some(tokio::spawn(worker.run()));
            launched += 1;
        }
        drop(handles);

        info!(launched, workers = self.worker_count, "Session started");
        self.aggregator.emit(SessionEvent::Started);
    }

    /// Asks workers to stop after their current unit (`true`) or clears the
    /// flag (`false`). Clearing does not relaunch stopped workers.
    pub fn pause(&self, flag: bool) {
        if !self.control.pause(flag) {
            warn!(flag, "pause() called on a cancelled session; ignoring");
            return;
        }
        info!(flag, "Session pause flag set");
        if flag {
            self.aggregator.emit(SessionEvent::Paused);
        }
    }

    /// Terminal stop. Further control calls are ignored.
    pub fn cancel(&self) {
        if !self.control.cancel() {
            warn!("cancel() called on a cancelled session; ignoring");
            return;
        }
        info!("Session cancelled");
        self.aggregator.emit(SessionEvent::Cancelled);
    }

    /// Waits for every launched worker task to return.
    pub async fn wait(&self) -> Vec<WorkerOutcome> {
        let pending: Vec<JoinHandle<WorkerOutcome>> =
            self.handles().iter_mut().filter_map(Option::take).collect();
        let outcomes = join_all(pending)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or(WorkerOutcome::Failed))
            .collect::<Vec<_>>();
        debug!(workers = outcomes.len(), "Workers joined");
        outcomes
    }

    pub fn checkpoint(&self) -> GlobalCheckpoint {
        self.aggregator.snapshot()
    }

    pub fn progress(&self) -> f64 {
        self.aggregator.progress()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// True once every worker has drained its partition.
    pub fn is_finished(&self) -> bool {
        (0..self.worker_count).all(|id| self.aggregator.is_worker_finished(id))
    }

    pub fn error_count(&self) -> usize {
        self.aggregator.error_count()
    }
}
