//! Run deletion and age-based retention sweeps.
//!
//! Deletion always removes the metadata record first and the artifact tree
//! second, after the layout and symlink checks have passed.

use crate::artifacts::{ArtifactStore, RunRoot, StoreError};
use crate::bundle::export::export_locked;
use crate::bundle::ExportOptions;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use runvault_db::{DbError, LockError, MetadataStore, RunFilter, RunLock, RunRecord};
use runvault_protocol::{ErrorCode, RunvaultConfig};
use runvault_security::validate_identifier;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("Retention days must be >= 0, got {0}")]
    InvalidDays(i64),

    #[error("Failed to list runs: {0}")]
    Db(#[from] DbError),

    #[error("Failed to write retention report to {path}: {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RetentionError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RetentionError::InvalidDays(_) => ErrorCode::UnknownError,
            _ => ErrorCode::StorageError,
        }
    }
}

/// Why a removal stopped. Metadata may already be gone when `Store` is returned
/// from the tree deletion step.
#[derive(Debug, Error)]
pub(crate) enum RemovalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl RemovalError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RemovalError::Store(e) => e.error_code(),
            RemovalError::Db(e) => e.error_code(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RemovalOutcome {
    pub metadata_deleted: bool,
    pub artifacts_deleted: bool,
    pub artifacts_missing: bool,
}

/// Remove a run's metadata and then its tree. The caller holds the run lock.
pub(crate) fn remove_run(db: &MetadataStore, root: &RunRoot) -> Result<RemovalOutcome, RemovalError> {
    let present = root.exists();
    if present {
        root.verify_tree()?;
    }
    let metadata_deleted = db.delete_run(root.run_id())?;
    let artifacts_deleted = if present { root.delete_tree()? } else { false };
    Ok(RemovalOutcome {
        metadata_deleted,
        artifacts_deleted,
        artifacts_missing: !present,
    })
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub backup_first: bool,
    /// Defaults to `<data_root>/backups`.
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub run_id: String,
    pub deleted: bool,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub technical_details: Option<String>,
    pub artifacts_deleted: bool,
    pub artifacts_missing: bool,
    pub backup_archive_path: Option<String>,
}

impl DeleteReport {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            deleted: false,
            error_code: None,
            error_message: None,
            technical_details: None,
            artifacts_deleted: false,
            artifacts_missing: false,
            backup_archive_path: None,
        }
    }

    fn fail(mut self, code: ErrorCode, details: impl Into<String>) -> Self {
        let details = details.into();
        error!("Delete of run {} failed ({}): {}", self.run_id, code, details);
        self.deleted = false;
        self.error_code = Some(code);
        self.error_message = Some(code.friendly_message().to_string());
        self.technical_details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionOptions {
    pub dry_run: bool,
    pub export_before_delete: bool,
    /// Defaults to `<data_root>/backups`.
    pub export_dir: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Planned,
    Deleted,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: String,
    pub action: String,
    pub status: AuditStatus,
    pub error: Option<String>,
    pub backup_archive_path: Option<String>,
}

impl AuditEntry {
    fn delete(run_id: &str, status: AuditStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            action: "delete".to_string(),
            status,
            error: None,
            backup_archive_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub cutoff_created_at: String,
    pub dry_run: bool,
    pub export_before_delete: bool,
    pub export_dir: Option<String>,
    pub report_path: Option<String>,
    pub scanned_runs: usize,
    pub deleted_runs: usize,
    pub failed_runs: usize,
    pub skipped_runs: usize,
    pub deleted_run_ids: Vec<String>,
    pub audit_entries: Vec<AuditEntry>,
    pub errors: Vec<String>,
}

impl RetentionReport {
    fn record_failure(&mut self, mut entry: AuditEntry, code: ErrorCode, details: &str) {
        warn!("Retention failed for run {}: {} {}", entry.run_id, code, details);
        self.failed_runs += 1;
        self.errors
            .push(format!("run_id={} code={} details={}", entry.run_id, code, details));
        entry.status = AuditStatus::Failed;
        entry.error = Some(details.to_string());
        self.audit_entries.push(entry);
    }
}

/// `created_at` cutoff for a sweep of runs older than `days`.
pub fn retention_cutoff(days: i64, now: DateTime<Utc>) -> Result<String, RetentionError> {
    if days < 0 {
        return Err(RetentionError::InvalidDays(days));
    }
    let cutoff = ChronoDuration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or(RetentionError::InvalidDays(days))?;
    Ok(cutoff.to_rfc3339_opts(SecondsFormat::Micros, true))
}

pub struct RetentionService<'a> {
    artifacts: &'a ArtifactStore,
    db: &'a MetadataStore,
    config: &'a RunvaultConfig,
}

impl<'a> RetentionService<'a> {
    pub fn new(artifacts: &'a ArtifactStore, db: &'a MetadataStore, config: &'a RunvaultConfig) -> Self {
        Self { artifacts, db, config }
    }

    /// Delete one run. `confirm_token` must equal `run_id`.
    pub fn delete_run(&self, run_id: &str, confirm_token: &str, options: &DeleteOptions) -> DeleteReport {
        let report = DeleteReport::new(run_id);
        if confirm_token != run_id {
            return report.fail(
                ErrorCode::UnknownError,
                format!("Confirmation token does not match run_id: {}", run_id),
            );
        }
        if let Err(e) = validate_identifier(run_id) {
            return report.fail(ErrorCode::StorageError, e.to_string());
        }
        let run = match self.db.get_run(run_id) {
            Ok(Some(run)) => run,
            Ok(None) => return report.fail(ErrorCode::StorageError, format!("Run not found: {}", run_id)),
            Err(e) => return report.fail(e.error_code(), e.to_string()),
        };
        let root = match self.recorded_root(&run) {
            Ok(root) => root,
            Err(e) => return report.fail(e.error_code(), e.to_string()),
        };
        let _lock = match RunLock::acquire(&root.lock_path(), self.config.lock_timeout) {
            Ok(lock) => lock,
            Err(e) => return report.fail(ErrorCode::StorageError, e.to_string()),
        };
        self.delete_locked(&root, options.backup_first, options.backup_dir.as_deref(), report)
    }

    fn delete_locked(
        &self,
        root: &RunRoot,
        backup_first: bool,
        backup_dir: Option<&Path>,
        mut report: DeleteReport,
    ) -> DeleteReport {
        if root.exists() {
            if let Err(e) = root.verify_tree() {
                return report.fail(e.error_code(), e.to_string());
            }
        }

        if backup_first {
            let export = export_locked(root, &self.export_options(backup_dir));
            if !export.is_success() {
                let details = export
                    .technical_details
                    .unwrap_or_else(|| "Backup export failed".to_string());
                return report.fail(
                    export.error_code.unwrap_or(ErrorCode::StorageError),
                    format!("Backup before delete failed: {}", details),
                );
            }
            report.backup_archive_path = export.archive_path;
        }

        match remove_run(self.db, root) {
            Ok(outcome) => {
                info!(
                    "Deleted run {} (metadata={}, artifacts={}, missing={})",
                    root.run_id(),
                    outcome.metadata_deleted,
                    outcome.artifacts_deleted,
                    outcome.artifacts_missing
                );
                report.deleted = true;
                report.artifacts_deleted = outcome.artifacts_deleted;
                report.artifacts_missing = outcome.artifacts_missing;
                report
            }
            Err(e) => report.fail(e.error_code(), e.to_string()),
        }
    }

    /// Best-effort sweep of runs created at or before `now - days`.
    pub fn purge_older_than(&self, days: i64, options: &RetentionOptions) -> Result<RetentionReport, RetentionError> {
        self.purge_older_than_at(days, Utc::now(), options)
    }

    pub fn purge_older_than_at(
        &self,
        days: i64,
        now: DateTime<Utc>,
        options: &RetentionOptions,
    ) -> Result<RetentionReport, RetentionError> {
        let cutoff = retention_cutoff(days, now)?;
        let export_dir = options
            .export_dir
            .clone()
            .unwrap_or_else(|| self.artifacts.backups_dir());
        let candidates = self.db.list_runs(&RunFilter {
            created_before: Some(cutoff.clone()),
            ..RunFilter::default()
        })?;
        info!(
            "Retention sweep: {} runs created at or before {} (dry_run={})",
            candidates.len(),
            cutoff,
            options.dry_run
        );

        let mut report = RetentionReport {
            cutoff_created_at: cutoff,
            dry_run: options.dry_run,
            export_before_delete: options.export_before_delete,
            export_dir: options
                .export_before_delete
                .then(|| export_dir.display().to_string()),
            report_path: options.report_path.as_ref().map(|p| p.display().to_string()),
            scanned_runs: candidates.len(),
            deleted_runs: 0,
            failed_runs: 0,
            skipped_runs: 0,
            deleted_run_ids: Vec::new(),
            audit_entries: Vec::new(),
            errors: Vec::new(),
        };

        for run in &candidates {
            if options.dry_run {
                report
                    .audit_entries
                    .push(AuditEntry::delete(&run.run_id, AuditStatus::Planned));
                continue;
            }
            self.sweep_one(run, options.export_before_delete, &export_dir, &mut report);
        }

        if let Some(path) = &options.report_path {
            write_report(path, &report)?;
        }
        Ok(report)
    }

    fn sweep_one(&self, run: &RunRecord, export_first: bool, export_dir: &Path, report: &mut RetentionReport) {
        let mut entry = AuditEntry::delete(&run.run_id, AuditStatus::Deleted);
        let root = match self.recorded_root(run) {
            Ok(root) => root,
            Err(e) => return report.record_failure(entry, e.error_code(), &e.to_string()),
        };
        let _lock = match RunLock::try_acquire(&root.lock_path()) {
            Ok(lock) => lock,
            Err(LockError::Locked(_)) => {
                info!("Retention skipped run {}: locked by another operation", run.run_id);
                report.skipped_runs += 1;
                entry.status = AuditStatus::Skipped;
                entry.error = Some("Run is locked by another operation".to_string());
                report.audit_entries.push(entry);
                return;
            }
            Err(e) => return report.record_failure(entry, ErrorCode::StorageError, &e.to_string()),
        };

        let deleted = self.delete_locked(&root, export_first, Some(export_dir), DeleteReport::new(&run.run_id));
        entry.backup_archive_path = deleted.backup_archive_path.clone();
        if deleted.deleted {
            report.deleted_runs += 1;
            report.deleted_run_ids.push(run.run_id.clone());
            report.audit_entries.push(entry);
        } else {
            let details = deleted.technical_details.unwrap_or_default();
            report.record_failure(entry, deleted.error_code.unwrap_or(ErrorCode::UnknownError), &details);
        }
    }

    fn recorded_root(&self, run: &RunRecord) -> Result<RunRoot, StoreError> {
        self.artifacts
            .recorded_run_root(Path::new(&run.artifacts_root_path), &run.session_id, &run.run_id)
    }

    fn export_options(&self, output_dir: Option<&Path>) -> ExportOptions {
        ExportOptions {
            output_dir: Some(
                output_dir
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.artifacts.backups_dir()),
            ),
            signing_key: self.config.signing_key.clone(),
            lock_timeout: self.config.lock_timeout,
        }
    }
}

fn write_report(path: &Path, report: &RetentionReport) -> Result<(), RetentionError> {
    let failed = |source| RetentionError::Report {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(failed)?;
    }
    let body = serde_json::to_string_pretty(report).map_err(|e| failed(e.into()))?;
    fs::write(path, body).map_err(failed)
}
