#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use batchput_core::contract::{
    Envelope, FileQuery, HashCheck, StorageApi, UploadRequest,
};
use batchput_core::error::{Result, UploadError};
use batchput_core::{Callbacks, FileDescriptor, ManifestSource, UploadConfig};

pub type UploadHook = Box<dyn Fn(usize, &UploadRequest) -> Result<()> + Send + Sync>;

/// In-memory server that records every request and replays scripted
/// verification results.
#[derive(Default)]
pub struct FakeStorage {
    pub uploads: Mutex<Vec<UploadRequest>>,
    pub queries: Mutex<Vec<Vec<FileQuery>>>,
    /// Order of successful uploads (`upload:<first index>`) and hash checks (`check`).
    pub calls: Mutex<Vec<String>>,
    /// Returned by `check_hashes` in order; an empty script means "all good".
    pub hash_script: Mutex<VecDeque<HashCheck>>,
    /// Returned by `check_hashes` once the script is drained.
    pub hash_default: Mutex<HashCheck>,
    pub already_stored: BTreeSet<u64>,
    /// Called before each upload is recorded, with the running request count.
    pub on_upload: Option<UploadHook>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stored(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.already_stored = indices.into_iter().collect();
        self
    }

    pub fn with_hash_script(self, script: Vec<BTreeSet<u64>>) -> Self {
        *self.hash_script.lock().unwrap() = script
            .into_iter()
            .map(|failed| HashCheck {
                failed,
                need_check: false,
            })
            .collect();
        self
    }

    pub fn with_hash_default(self, failed: BTreeSet<u64>) -> Self {
        *self.hash_default.lock().unwrap() = HashCheck {
            failed,
            need_check: false,
        };
        self
    }

    pub fn with_upload_hook(
        mut self,
        hook: impl Fn(usize, &UploadRequest) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_upload = Some(Box::new(hook));
        self
    }

    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn uploaded_indices(&self) -> Vec<Vec<u64>> {
        self.uploads()
            .iter()
            .map(|r| r.entries.iter().map(|e| e.index).collect())
            .collect()
    }
}

#[async_trait]
impl StorageApi for FakeStorage {
    async fn upload(&self, req: UploadRequest) -> Result<Envelope> {
        let count = self.uploads.lock().unwrap().len();
        if let Some(hook) = &self.on_upload {
            hook(count, &req)?;
        }
        let first = req.entries.first().map_or(0, |e| e.index);
        self.calls.lock().unwrap().push(format!("upload:{first}"));
        self.uploads.lock().unwrap().push(req);
        Ok(Envelope {
            code: 200,
            ..Envelope::default()
        })
    }

    async fn check_hashes(&self) -> Result<HashCheck> {
        self.calls.lock().unwrap().push("check".into());
        let next = self.hash_script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.hash_default.lock().unwrap().clone()))
    }

    async fn check_uploaded(&self, files: Vec<FileQuery>) -> Result<BTreeSet<u64>> {
        let found = files
            .iter()
            .map(|f| f.index)
            .filter(|i| self.already_stored.contains(i))
            .collect();
        self.queries.lock().unwrap().push(files);
        Ok(found)
    }
}

pub fn transport_error() -> UploadError {
    UploadError::Transport {
        uri: "fake://upload".into(),
        body: "{\"code\":500}".into(),
    }
}

/// Writes one file per entry of `sizes` into `dir`, filled with the file's
/// index byte so bodies can be told apart.
pub fn write_files(dir: &Path, sizes: &[usize]) -> ManifestSource {
    let files = sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| {
            let path = dir.join(format!("file-{i}.bin"));
            std::fs::write(&path, vec![i as u8; size]).unwrap();
            FileDescriptor {
                path,
                name: format!("file-{i}.bin"),
                size: size as u64,
                fingerprint: format!("{i:032x}"),
            }
        })
        .collect();
    ManifestSource::new(files)
}

pub fn test_config(workers: usize) -> UploadConfig {
    UploadConfig {
        worker_count_limit: workers,
        pending_check_interval_ms: 10,
        ..UploadConfig::new("http://storage.test", "token", "batch-1")
    }
}

/// Collects callback traffic for assertions.
#[derive(Clone, Default)]
pub struct Recorder {
    pub events: Arc<Mutex<Vec<String>>>,
    pub errors: Arc<Mutex<Vec<(usize, String)>>>,
    pub exhausted: Arc<Mutex<Vec<(usize, Vec<u64>, Vec<u64>)>>>,
    pub progress: Arc<Mutex<Vec<f64>>>,
    pub done: Arc<Notify>,
}

impl Recorder {
    pub fn callbacks(&self) -> Callbacks {
        let (events, progress) = (self.events.clone(), self.progress.clone());
        let (errors, exhausted) = (self.errors.clone(), self.exhausted.clone());
        let (done_ok, done_err) = (self.done.clone(), self.done.clone());
        let (started, paused, cancelled) =
            (self.events.clone(), self.events.clone(), self.events.clone());
        Callbacks::new()
            .on_progress(move |p| progress.lock().unwrap().push(p.value))
            .on_error(move |worker, e| {
                if let UploadError::RetryExhausted {
                    indices,
                    checkpoint,
                    ..
                } = e
                {
                    exhausted.lock().unwrap().push((
                        worker,
                        indices.clone(),
                        checkpoint.hash_mismatch.clone(),
                    ));
                }
                errors.lock().unwrap().push((worker, e.to_string()));
                done_err.notify_one();
            })
            .on_finished(move || {
                events.lock().unwrap().push("finished".into());
                done_ok.notify_one();
            })
            .on_started(move || started.lock().unwrap().push("started".into()))
            .on_paused(move || paused.lock().unwrap().push("paused".into()))
            .on_cancelled(move || cancelled.lock().unwrap().push("cancelled".into()))
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(usize, String)> {
        self.errors.lock().unwrap().clone()
    }

    /// Waits for a finished or error callback, bounded so a hang fails the test.
    pub async fn settled(&self) {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.done.notified())
            .await
            .expect("session did not settle");
    }

    /// Lets the dispatcher drain events already queued.
    pub async fn flush(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
