/// `load_config` module: reads the static YAML settings file and injects secrets from the environment.
///
/// The settings file carries everything that is safe to commit (server endpoint, limits,
/// worker count). Tokens never live in it; they are read from `BATCHPUT_TOKEN` and
/// `BATCHPUT_BATCH_TOKEN`, which may come from a `.env` file loaded by `main`.
///
/// # Errors
/// All errors use `anyhow::Error` and name the file or variable at fault.
use anyhow::Result;
use batchput_core::UploadConfig;
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub const TOKEN_VAR: &str = "BATCHPUT_TOKEN";
pub const BATCH_TOKEN_VAR: &str = "BATCHPUT_BATCH_TOKEN";

/// Loads a YAML settings file (no secrets), fills in secrets from the
/// environment and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<UploadConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let mut config: UploadConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    config.token = secret(TOKEN_VAR)?;
    config.batch_token = secret(BATCH_TOKEN_VAR)?;

    if let Err(e) = config.validate() {
        error!(error = %e, config_path = ?path_ref, "Invalid configuration");
        return Err(anyhow::anyhow!("Invalid configuration in {:?}: {e}", path_ref));
    }

    info!(
        server_uri = %config.server_uri,
        workers = config.worker_count_limit,
        "Config loaded and merged successfully"
    );
    Ok(config)
}

fn secret(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => {
            info!(var, "Secret found in env");
            Ok(value)
        }
        Ok(_) => {
            error!(var, "Secret environment variable is empty");
            Err(anyhow::anyhow!("{var} environment variable is empty"))
        }
        Err(e) => {
            error!(error = ?e, var, "Secret environment variable not set");
            Err(anyhow::anyhow!("{var} environment variable not set: {e}"))
        }
    }
}
