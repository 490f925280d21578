//! Command implementations for the `runvault` binary.
//!
//! Every command prints one pretty JSON report on stdout and returns whether
//! the report describes a success, which becomes the process exit code.

pub mod classify;
pub mod delete;
pub mod export;
pub mod purge;
pub mod restore;

use anyhow::{Context, Result};
use runvault::ArtifactStore;
use runvault_db::MetadataStore;
use runvault_protocol::RunvaultConfig;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// Storage handles shared by the commands that touch runs.
pub struct Workspace {
    pub config: RunvaultConfig,
    pub artifacts: ArtifactStore,
    pub db: MetadataStore,
}

impl Workspace {
    /// Resolve configuration from the environment, then apply CLI overrides.
    pub fn open(data_dir: Option<PathBuf>, db_path: Option<PathBuf>) -> Result<Self> {
        let mut config = RunvaultConfig::from_env().context("Invalid runvault configuration")?;
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        if let Some(path) = db_path {
            config.db_path = path;
        }
        debug!(
            "Using data dir {} and database {}",
            config.data_dir.display(),
            config.db_path.display()
        );
        let artifacts = ArtifactStore::open(&config.data_dir)
            .with_context(|| format!("Failed to open data dir: {}", config.data_dir.display()))?;
        let db = MetadataStore::open_with_timeout(&config.db_path, config.lock_timeout)
            .with_context(|| format!("Failed to open database: {}", config.db_path.display()))?;
        Ok(Self { config, artifacts, db })
    }
}

pub fn print_json<T: Serialize>(report: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    println!("{}", body);
    Ok(())
}
