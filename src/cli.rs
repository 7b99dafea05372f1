/// # batchput CLI Interface (Module)
///
/// Command parsing and the async [`run`] entrypoint. All engine logic lives in
/// `batchput-core`; this module wires settings, manifest, checkpoint file and
/// process signals around an [`UploadSession`].
///
/// - For command-line users: `batchput --help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
use anyhow::{Context, Result};
use batchput_core::{Callbacks, GlobalCheckpoint, ManifestSource, UploadSession};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::load_config::load_config;

/// CLI for batchput: resumable batched uploads to batch-token object storage.
#[derive(Parser)]
#[clap(
    name = "batchput",
    version,
    about = "Upload a file manifest to batch-token object storage, resumably"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload every file in the manifest, resuming from the checkpoint if present
    Upload {
        /// Path to the YAML settings file
        #[clap(long)]
        config: PathBuf,
        /// Path to the JSON or YAML file manifest
        #[clap(long)]
        manifest: PathBuf,
        /// Where the resumable checkpoint is read from and written to
        #[clap(long, default_value = "batchput-checkpoint.json")]
        checkpoint: PathBuf,
    },
}

/// How a session run ended, as seen from the callbacks.
#[derive(Debug)]
enum RunEnd {
    Finished,
    Failed { worker: usize, error: String },
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Upload {
            config,
            manifest,
            checkpoint,
        } => upload(&config, &manifest, &checkpoint).await,
    }
}

async fn upload(config: &Path, manifest: &Path, checkpoint: &Path) -> Result<()> {
    let config = load_config(config)?;
    let source = ManifestSource::load(manifest)
        .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
    let resumed = if checkpoint.exists() {
        let cp = GlobalCheckpoint::load(checkpoint)
            .await
            .with_context(|| format!("Failed to load checkpoint {}", checkpoint.display()))?;
        Some(cp)
    } else {
        None
    };
    tracing::info!(
        command = "upload",
        files = source.files().len(),
        resumed = resumed.is_some(),
        "Starting upload"
    );

    let (tx, mut ended) = mpsc::unbounded_channel();
    let failed = tx.clone();
    let callbacks = Callbacks::new()
        .on_progress(|p| {
            tracing::info!(
                progress = %format!("{:.1}%", p.value * 100.0),
                speed_mib_s = p.speed,
                bytes = p.uploaded_bytes,
                "Upload progress"
            );
        })
        .on_error(move |worker, e| {
            let _ = failed.send(RunEnd::Failed {
                worker,
                error: e.to_string(),
            });
        })
        .on_finished(move || {
            let _ = tx.send(RunEnd::Finished);
        });

    let session = UploadSession::new_http(Arc::new(source), resumed, callbacks, config)
        .context("Failed to create upload session")?;
    session.start();

    let end = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            tracing::warn!("Interrupted, pausing after in-flight requests");
            None
        }
        end = ended.recv() => end,
    };

    match end {
        Some(RunEnd::Finished) => {
            session.wait().await;
            if checkpoint.exists() {
                tokio::fs::remove_file(checkpoint)
                    .await
                    .with_context(|| format!("Failed to remove {}", checkpoint.display()))?;
            }
            tracing::info!(command = "upload", "Upload complete");
            Ok(())
        }
        Some(RunEnd::Failed { worker, error }) => {
            tracing::error!(command = "upload", worker, error = %error, "Upload failed");
            persist(&session, checkpoint).await?;
            Err(anyhow::anyhow!("Worker {worker} failed: {error}"))
        }
        None => {
            persist(&session, checkpoint).await?;
            Err(anyhow::anyhow!(
                "Upload interrupted; resume with --checkpoint {}",
                checkpoint.display()
            ))
        }
    }
}

/// Stops the remaining workers at their next step boundary and saves where they got to.
async fn persist(session: &UploadSession, checkpoint: &Path) -> Result<()> {
    session.pause(true);
    session.wait().await;
    session
        .checkpoint()
        .save(checkpoint)
        .await
        .with_context(|| format!("Failed to save checkpoint {}", checkpoint.display()))?;
    tracing::info!(
        checkpoint = %checkpoint.display(),
        progress = session.progress(),
        "Checkpoint saved"
    );
    Ok(())
}
