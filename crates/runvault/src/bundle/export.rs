//! Deterministic run export.
//!
//! Entries are written in manifest order with a fixed 1980-01-01 timestamp
//! and 0o644 permissions, so identical trees produce identical archives.
//! `bundle_manifest.json` is always the last entry.

use super::manifest::BundleManifest;
use super::BundleError;
use crate::artifacts::{ArtifactStore, RunRoot, StoreError};
use runvault_db::{MetadataStore, RunLock, RunRecord};
use runvault_protocol::defaults::{BUNDLE_MANIFEST_FILE, BUNDLE_SUFFIX, DEFAULT_LOCK_TIMEOUT_SECS};
use runvault_protocol::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Exported,
    Failed,
}

/// Outcome of an export. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReport {
    pub status: ExportStatus,
    pub run_id: String,
    pub session_id: String,
    pub archive_path: Option<String>,
    pub files_count: usize,
    pub total_bytes: u64,
    pub archive_signed: bool,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub technical_details: Option<String>,
}

impl ExportReport {
    fn new(location: &RunLocation) -> Self {
        Self {
            status: ExportStatus::Failed,
            run_id: location.run_id.clone(),
            session_id: location.session_id.clone(),
            archive_path: None,
            files_count: 0,
            total_bytes: 0,
            archive_signed: false,
            error_code: None,
            error_message: None,
            technical_details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExportStatus::Exported
    }

    fn fail(self, err: &BundleError) -> Self {
        self.fail_with(err.error_code(), err.to_string())
    }

    fn fail_with(mut self, code: ErrorCode, details: String) -> Self {
        error!("Export of run {} failed ({}): {}", self.run_id, code, details);
        self.status = ExportStatus::Failed;
        self.error_code = Some(code);
        self.error_message = Some(code.friendly_message().to_string());
        self.technical_details = Some(details);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Defaults to the parent of the run root.
    pub output_dir: Option<PathBuf>,
    pub signing_key: Option<String>,
    pub lock_timeout: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            signing_key: None,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
        }
    }
}

/// Where a run's artifacts are recorded to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLocation {
    pub run_id: String,
    pub session_id: String,
    pub artifacts_root_path: PathBuf,
}

impl From<&RunRecord> for RunLocation {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.run_id.clone(),
            session_id: run.session_id.clone(),
            artifacts_root_path: PathBuf::from(&run.artifacts_root_path),
        }
    }
}

/// Export one run to `<output_dir>/<run_id>_bundle.zip`.
pub fn export_run(store: &ArtifactStore, location: &RunLocation, options: &ExportOptions) -> ExportReport {
    let report = ExportReport::new(location);
    let root = match store.recorded_run_root(
        &location.artifacts_root_path,
        &location.session_id,
        &location.run_id,
    ) {
        Ok(root) => root,
        Err(e) => return report.fail(&e.into()),
    };
    if !root.exists() {
        let err = StoreError::MissingRoot(root.path().display().to_string());
        return report.fail(&err.into());
    }
    let _lock = match RunLock::acquire(&root.lock_path(), options.lock_timeout) {
        Ok(lock) => lock,
        Err(e) => return report.fail(&e.into()),
    };
    export_locked(&root, options)
}

/// Export a run looked up by id in the metadata store.
pub fn export_by_id(
    store: &ArtifactStore,
    db: &MetadataStore,
    run_id: &str,
    options: &ExportOptions,
) -> ExportReport {
    let unknown = RunLocation {
        run_id: run_id.to_string(),
        session_id: String::new(),
        artifacts_root_path: PathBuf::new(),
    };
    match db.get_run(run_id) {
        Ok(Some(run)) => export_run(store, &RunLocation::from(&run), options),
        Ok(None) => ExportReport::new(&unknown)
            .fail_with(ErrorCode::StorageError, format!("Run not found: {}", run_id)),
        Err(e) => ExportReport::new(&unknown).fail_with(e.error_code(), e.to_string()),
    }
}

/// Export a run whose lock the caller already holds.
pub(crate) fn export_locked(root: &RunRoot, options: &ExportOptions) -> ExportReport {
    let location = RunLocation {
        run_id: root.run_id().to_string(),
        session_id: root.session_id().to_string(),
        artifacts_root_path: root.path().to_path_buf(),
    };
    let mut report = ExportReport::new(&location);
    match write_bundle(root, options) {
        Ok(written) => {
            info!(
                "Exported run {} ({} files, {} bytes) to {}",
                root.run_id(),
                written.files_count,
                written.total_bytes,
                written.archive_path.display()
            );
            report.status = ExportStatus::Exported;
            report.archive_path = Some(written.archive_path.display().to_string());
            report.files_count = written.files_count;
            report.total_bytes = written.total_bytes;
            report.archive_signed = written.signed;
            report
        }
        Err(e) => report.fail(&e),
    }
}

struct WrittenBundle {
    archive_path: PathBuf,
    files_count: usize,
    total_bytes: u64,
    signed: bool,
}

fn write_bundle(root: &RunRoot, options: &ExportOptions) -> Result<WrittenBundle, BundleError> {
    let mut manifest = BundleManifest::build(root)?;
    if manifest.files.is_empty() {
        return Err(BundleError::EmptyRun(root.path().display().to_string()));
    }
    let signing_key = options
        .signing_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());
    if let Some(key) = signing_key {
        manifest.sign(key)?;
    }

    let output_dir = match &options.output_dir {
        Some(dir) => dir.clone(),
        None => root
            .path()
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::MissingRoot(root.path().display().to_string()))?,
    };
    fs::create_dir_all(&output_dir).map_err(|e| BundleError::io(&output_dir, e))?;
    let archive_path = output_dir.join(format!("{}{}", root.run_id(), BUNDLE_SUFFIX));

    let tmp = tempfile::Builder::new()
        .prefix(".runvault-export-")
        .suffix(".tmp")
        .tempfile_in(&output_dir)
        .map_err(|e| BundleError::io(&output_dir, e))?;

    let options_zip = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let mut zip = ZipWriter::new(tmp.reopen().map_err(|e| BundleError::io(tmp.path(), e))?);
    for entry in &manifest.files {
        zip.start_file(entry.relative_path.as_str(), options_zip)?;
        let mut source = root.open_file(&entry.relative_path)?;
        let copied = io::copy(&mut source, &mut zip)
            .map_err(|e| BundleError::io(Path::new(&entry.relative_path), e))?;
        if copied != entry.size_bytes {
            return Err(BundleError::Changed(entry.relative_path.clone()));
        }
    }
    zip.start_file(BUNDLE_MANIFEST_FILE, options_zip)?;
    zip.write_all(&manifest.to_json_bytes()?)
        .map_err(|e| BundleError::io(Path::new(BUNDLE_MANIFEST_FILE), e))?;
    let file = zip.finish()?;
    file.sync_all().map_err(|e| BundleError::io(tmp.path(), e))?;
    drop(file);

    tmp.persist(&archive_path)
        .map_err(|e| BundleError::io(&archive_path, e.error))?;

    Ok(WrittenBundle {
        archive_path,
        files_count: manifest.files.len(),
        total_bytes: manifest.total_bytes(),
        signed: manifest.signature.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;

    fn populated() -> (TempDir, ArtifactStore, RunRoot) {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(&temp.path().join("data")).unwrap();
        let root = store.create_run_root("s1", "r1").unwrap();
        root.write_text("run.json", "{\"run_id\":\"r1\",\"session_id\":\"s1\"}").unwrap();
        root.write_text("logs/run.log", "2024-01-01T00:00:00Z Run started with 1 files\n").unwrap();
        root.write_text("llm/response_raw.txt", "{}").unwrap();
        (temp, store, root)
    }

    fn location(root: &RunRoot) -> RunLocation {
        RunLocation {
            run_id: "r1".to_string(),
            session_id: "s1".to_string(),
            artifacts_root_path: root.path().to_path_buf(),
        }
    }

    #[test]
    fn test_export_writes_manifest_last() {
        let (_temp, store, root) = populated();
        let report = export_run(&store, &location(&root), &ExportOptions::default());
        assert!(report.is_success(), "{:?}", report);
        assert_eq!(report.files_count, 3);
        assert!(!report.archive_signed);

        let path = PathBuf::from(report.archive_path.unwrap());
        assert_eq!(path.file_name().unwrap(), "r1_bundle.zip");
        assert_eq!(path.parent().unwrap(), root.path().parent().unwrap());

        let mut archive = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["llm/response_raw.txt", "logs/run.log", "run.json", BUNDLE_MANIFEST_FILE]
        );
        let mut manifest = String::new();
        archive
            .by_name(BUNDLE_MANIFEST_FILE)
            .unwrap()
            .read_to_string(&mut manifest)
            .unwrap();
        let parsed = BundleManifest::parse(manifest.as_bytes()).unwrap();
        assert_eq!(parsed.manifest.files.len(), 3);
    }

    #[test]
    fn test_export_is_byte_identical() {
        let (temp, store, root) = populated();
        let first = export_run(
            &store,
            &location(&root),
            &ExportOptions {
                output_dir: Some(temp.path().join("a")),
                ..ExportOptions::default()
            },
        );
        let second = export_run(
            &store,
            &location(&root),
            &ExportOptions {
                output_dir: Some(temp.path().join("b")),
                ..ExportOptions::default()
            },
        );
        let a = fs::read(first.archive_path.unwrap()).unwrap();
        let b = fs::read(second.archive_path.unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_export_signed() {
        let (_temp, store, root) = populated();
        let report = export_run(
            &store,
            &location(&root),
            &ExportOptions {
                signing_key: Some("  secret  ".to_string()),
                ..ExportOptions::default()
            },
        );
        assert!(report.archive_signed);

        let blank = export_run(
            &store,
            &location(&root),
            &ExportOptions {
                signing_key: Some("   ".to_string()),
                ..ExportOptions::default()
            },
        );
        assert!(!blank.archive_signed);
    }

    #[test]
    fn test_export_missing_and_empty_roots_fail() {
        let (_temp, store, _root) = populated();
        let missing = RunLocation {
            run_id: "nope".to_string(),
            session_id: "s1".to_string(),
            artifacts_root_path: store.run_root("s1", "nope").unwrap().path().to_path_buf(),
        };
        let report = export_run(&store, &missing, &ExportOptions::default());
        assert_eq!(report.status, ExportStatus::Failed);
        assert_eq!(report.error_code, Some(ErrorCode::StorageError));

        let empty = store.run_root("s1", "empty").unwrap();
        fs::create_dir_all(empty.path()).unwrap();
        let report = export_run(
            &store,
            &RunLocation {
                run_id: "empty".to_string(),
                session_id: "s1".to_string(),
                artifacts_root_path: empty.path().to_path_buf(),
            },
            &ExportOptions::default(),
        );
        assert_eq!(report.status, ExportStatus::Failed);
        assert!(report.technical_details.unwrap().contains("empty"));
    }

    #[test]
    fn test_export_rejects_layout_mismatch() {
        let (_temp, store, root) = populated();
        let wrong = RunLocation {
            run_id: "r2".to_string(),
            session_id: "s1".to_string(),
            artifacts_root_path: root.path().to_path_buf(),
        };
        let report = export_run(&store, &wrong, &ExportOptions::default());
        assert_eq!(report.status, ExportStatus::Failed);
        assert_eq!(report.error_code, Some(ErrorCode::StorageError));
    }

    #[test]
    #[cfg(unix)]
    fn test_export_rejects_symlink() {
        let (temp, store, root) = populated();
        let outside = temp.path().join("outside.txt");
        fs::write(&outside, "secret").unwrap();
        std::os::unix::fs::symlink(&outside, root.path().join("logs/link.txt")).unwrap();
        let report = export_run(&store, &location(&root), &ExportOptions::default());
        assert_eq!(report.status, ExportStatus::Failed);
        assert!(report.archive_path.is_none());
    }
}
