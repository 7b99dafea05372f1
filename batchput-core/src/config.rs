use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, UploadError};

const MIB: u64 = 1024 * 1024;

/// Session configuration. Immutable once a session has been built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub server_uri: String,
    pub token: String,
    pub batch_token: String,
    /// How many identical consecutive mismatch reports a worker tolerates.
    pub max_retry: u32,
    pub timeout_secs: u64,
    pub worker_count_limit: usize,
    pub use_batch: bool,
    pub batch_count_limit: usize,
    pub batch_size_limit: u64,
    pub use_multipart: bool,
    pub multipart_size_limit: u64,
    pub api_version: u32,
    /// Cancel every worker once one of them fails.
    pub abort_on_worker_failure: bool,
    /// Delay between reconciliations when the server reports a pending check
    /// and nothing else is left to upload.
    pub pending_check_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            token: String::new(),
            batch_token: String::new(),
            max_retry: 3,
            timeout_secs: 30,
            worker_count_limit: 1,
            use_batch: true,
            batch_count_limit: 10,
            batch_size_limit: 5 * MIB,
            use_multipart: true,
            multipart_size_limit: 20 * MIB,
            api_version: 2,
            abort_on_worker_failure: false,
            pending_check_interval_ms: 1000,
        }
    }
}

impl UploadConfig {
    pub fn new(
        server_uri: impl Into<String>,
        token: impl Into<String>,
        batch_token: impl Into<String>,
    ) -> Self {
        Self {
            server_uri: server_uri.into(),
            token: token.into(),
            batch_token: batch_token.into(),
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn pending_check_interval(&self) -> Duration {
        Duration::from_millis(self.pending_check_interval_ms)
    }

    /// Versioned API root, e.g. `http://host:5000/v2`.
    pub fn api_base(&self) -> String {
        format!(
            "{}/v{}",
            self.server_uri.trim_end_matches('/'),
            self.api_version
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_uri.trim().is_empty() {
            return Err(UploadError::Config("server uri is not provided".into()));
        }
        if self.token.is_empty() || self.batch_token.is_empty() {
            return Err(UploadError::Config("no token provided".into()));
        }
        if self.worker_count_limit == 0 {
            return Err(UploadError::Config(
                "worker_count_limit must be at least 1".into(),
            ));
        }
        if self.use_batch && (self.batch_count_limit == 0 || self.batch_size_limit == 0) {
            return Err(UploadError::Config(
                "batching enabled with a zero count or size limit".into(),
            ));
        }
        if self.use_multipart && self.multipart_size_limit == 0 {
            return Err(UploadError::Config(
                "multipart enabled with a zero part size".into(),
            ));
        }
        Ok(())
    }

    pub fn trace_loaded(&self) {
        info!(
            server_uri = %self.server_uri,
            api_version = self.api_version,
            worker_count_limit = self.worker_count_limit,
            use_batch = self.use_batch,
            use_multipart = self.use_multipart,
            "Loaded upload config"
        );
        debug!(
            batch_count_limit = self.batch_count_limit,
            batch_size_limit = self.batch_size_limit,
            multipart_size_limit = self.multipart_size_limit,
            max_retry = self.max_retry,
            timeout_secs = self.timeout_secs,
            "Upload config limits"
        );
    }
}
