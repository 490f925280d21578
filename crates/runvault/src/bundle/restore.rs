//! Integrity-checked restore of a run bundle.
//!
//! Order of checks, all before any byte is written under the data root:
//! 1. safety pass over entry names, types and zip-bomb limits
//! 2. structural pass (`run.json` plus a layout root)
//! 3. manifest integrity (size and SHA-256 of every listed file)
//! 4. signature policy
//! 5. run.json identity
//!
//! Extraction goes to a staging directory that is renamed into place, then
//! the metadata is reconciled in one SQLite transaction. A metadata failure
//! removes the freshly restored tree unless rollback is disabled.

use super::manifest::{check_signature, BundleManifest, ManifestStatus, ParsedManifest, SignatureCheck, SignatureStatus};
use crate::artifacts::{guess_mime, ArtifactStore, RunRoot, StoreError};
use crate::retention::remove_run;
use runvault_db::{
    normalize_timestamp, now_timestamp, ArtifactRefRecord, LlmOutputRecord, MetadataStore, NewDocument,
    OcrUpdate, RestoredDocument, RestoredRun, RunLock, RunRecord, SessionRecord,
};
use runvault_protocol::defaults::{BUNDLE_MANIFEST_FILE, LAYOUT_ROOTS, RUN_LOG_PATH, RUN_MANIFEST_FILE};
use runvault_protocol::{ArtifactKind, ErrorCode, OcrStatus, RestoreLimits, RunStatus, RunvaultConfig};
use runvault_security::{sha256_reader, validate_identifier, validate_relative, ContainedRoot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::{error, info, warn};
use zip::ZipArchive;

const LLM_PARSED_PATH: &str = "llm/response_parsed.json";
const LLM_VALIDATION_PATH: &str = "llm/validation.json";
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Restored,
    Verified,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub overwrite_existing: bool,
    pub rollback_on_metadata_failure: bool,
    pub verify_only: bool,
    /// `None` falls back to the configured default.
    pub require_signature: Option<bool>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            rollback_on_metadata_failure: true,
            verify_only: false,
            require_signature: None,
        }
    }
}

/// Outcome of a restore or verification. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub status: RestoreStatus,
    pub run_id: Option<String>,
    pub session_id: Option<String>,
    pub artifacts_root_path: Option<String>,
    pub restored_paths: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub technical_details: Option<String>,
    pub manifest_verification_status: ManifestStatus,
    pub files_checked: usize,
    pub signature_verification_status: SignatureStatus,
    pub archive_signed: bool,
    pub signature_required: bool,
    pub verify_only: bool,
    pub rollback_attempted: bool,
    pub rollback_succeeded: Option<bool>,
}

impl RestoreReport {
    fn new(verify_only: bool, signature_required: bool) -> Self {
        Self {
            status: RestoreStatus::Failed,
            run_id: None,
            session_id: None,
            artifacts_root_path: None,
            restored_paths: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            error_code: None,
            error_message: None,
            technical_details: None,
            manifest_verification_status: ManifestStatus::NotChecked,
            files_checked: 0,
            signature_verification_status: SignatureStatus::NotChecked,
            archive_signed: false,
            signature_required,
            verify_only,
            rollback_attempted: false,
            rollback_succeeded: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status != RestoreStatus::Failed
    }

    fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Restore warning: {}", message);
        self.warnings.push(message);
    }

    fn fail(&mut self, failure: Failure) {
        error!("Restore failed ({}): {}", failure.code, failure.message);
        self.status = RestoreStatus::Failed;
        self.error_code = Some(failure.code);
        self.error_message = Some(failure.code.friendly_message().to_string());
        self.technical_details = Some(format!(
            "{}; files_checked={}",
            failure.message, self.files_checked
        ));
        self.errors.push(failure.message);
    }
}

#[derive(Debug)]
struct Failure {
    code: ErrorCode,
    message: String,
}

impl Failure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn archive(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RestoreInvalidArchive, message)
    }

    fn signature(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RestoreInvalidSignature, message)
    }

    fn fs(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RestoreFsError, message)
    }

    fn db(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RestoreDbError, message)
    }
}

type Step<T> = Result<T, Failure>;

#[derive(Debug, Clone, Copy)]
struct EntryInfo {
    index: usize,
    size: u64,
}

/// Regular-file entries that passed the safety and structural passes.
#[derive(Debug)]
struct Inspection {
    files: BTreeMap<String, EntryInfo>,
    has_bundle_manifest: bool,
}

/// Restores bundles into one data root and metadata store.
pub struct RestoreService<'a> {
    artifacts: &'a ArtifactStore,
    db: &'a MetadataStore,
    config: &'a RunvaultConfig,
}

impl<'a> RestoreService<'a> {
    pub fn new(artifacts: &'a ArtifactStore, db: &'a MetadataStore, config: &'a RunvaultConfig) -> Self {
        Self { artifacts, db, config }
    }

    /// Verify and, unless `verify_only`, restore the bundle at `archive_path`.
    pub fn restore(&self, archive_path: &Path, options: &RestoreOptions) -> RestoreReport {
        let require_signature = options.require_signature.unwrap_or(self.config.require_signature);
        let mut report = RestoreReport::new(options.verify_only, require_signature);
        info!(
            "Restoring {} (verify_only={}, overwrite={})",
            archive_path.display(),
            options.verify_only,
            options.overwrite_existing
        );

        match self.run(archive_path, options, require_signature, &mut report) {
            Ok(()) => {
                report.status = if options.verify_only {
                    RestoreStatus::Verified
                } else {
                    RestoreStatus::Restored
                };
                info!(
                    "Restore {} for run {} ({} files checked)",
                    if options.verify_only { "verified" } else { "completed" },
                    report.run_id.as_deref().unwrap_or("?"),
                    report.files_checked
                );
            }
            Err(failure) => report.fail(failure),
        }
        report
    }

    fn run(
        &self,
        archive_path: &Path,
        options: &RestoreOptions,
        require_signature: bool,
        report: &mut RestoreReport,
    ) -> Step<()> {
        if !archive_path.is_file() {
            return Err(Failure::archive(format!(
                "Archive file not found: {}",
                archive_path.display()
            )));
        }
        let file = File::open(archive_path)
            .map_err(|e| Failure::fs(format!("Failed to open archive {}: {}", archive_path.display(), e)))?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| Failure::archive(format!("Invalid ZIP archive: {}", e)))?;

        let inspection = inspect_entries(&mut archive, &self.config.restore_limits)?;
        let manifest = self.verify_integrity(&mut archive, &inspection, require_signature, report)?;
        self.verify_signature(manifest.as_ref(), require_signature, report)?;

        let snapshot = read_run_snapshot(&mut archive, &inspection)?;
        let (run_id, session_id) = snapshot_identity(&snapshot)?;
        if let Some(parsed) = &manifest {
            if parsed.manifest.run_id != run_id {
                return Err(Failure::archive(format!(
                    "bundle_manifest.json run_id does not match run.json. bundle={} run={}",
                    parsed.manifest.run_id, run_id
                )));
            }
            if parsed.manifest.session_id != session_id {
                return Err(Failure::archive(format!(
                    "bundle_manifest.json session_id does not match run.json. bundle={} run={}",
                    parsed.manifest.session_id, session_id
                )));
            }
        }
        report.run_id = Some(run_id.clone());
        report.session_id = Some(session_id.clone());

        let target = self
            .artifacts
            .run_root(&session_id, &run_id)
            .map_err(|e| Failure::fs(format!("Resolved target path is outside data root: {}", e)))?;
        report.artifacts_root_path = Some(target.path().display().to_string());

        if options.verify_only {
            return Ok(());
        }

        let exists = target.exists()
            || self
                .db
                .run_exists(&run_id)
                .map_err(|e| Failure::db(format!("Failed to look up run {}: {}", run_id, e)))?;
        if exists && !options.overwrite_existing {
            return Err(Failure::new(
                ErrorCode::RestoreRunExists,
                format!("Run already exists: {}", run_id),
            ));
        }

        let _lock = RunLock::acquire(&target.lock_path(), self.config.lock_timeout)
            .map_err(|e| Failure::fs(format!("Failed to lock run {}: {}", run_id, e)))?;

        let staging = self
            .artifacts
            .staging_dir()
            .map_err(|e| Failure::fs(format!("Failed to create staging directory: {}", e)))?;
        let staged = staging.path().join(&run_id);
        extract_entries(&mut archive, &inspection, &staged)?;

        // The existing run is only touched once the replacement is fully staged.
        if exists {
            self.remove_existing(&target)?;
        }
        move_into_place(&staged, target.path())?;
        report.restored_paths = restored_paths(&target);

        let reconciled = build_restored_run(&snapshot, &target, report)
            .map_err(|e| Failure::db(format!("Failed to rebuild metadata from restored tree: {}", e)))
            .and_then(|restored| {
                self.db
                    .reconcile_restored_run(&restored)
                    .map_err(|e| Failure::db(format!("Metadata restore failed: {}", e)))
            });

        if let Err(failure) = reconciled {
            if options.rollback_on_metadata_failure {
                report.rollback_attempted = true;
                let rolled_back = match target.delete_tree() {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Rollback of {} failed: {}", target.path().display(), e);
                        false
                    }
                };
                report.rollback_succeeded = Some(rolled_back);
                if rolled_back {
                    report.restored_paths.clear();
                } else {
                    report.warn("Rollback failed after metadata restore failure; restored files may remain on disk.");
                }
            } else {
                report.warn(format!(
                    "Rollback disabled; restored files remain at {} for manual inspection.",
                    target.path().display()
                ));
            }
            return Err(failure);
        }
        Ok(())
    }

    fn verify_integrity(
        &self,
        archive: &mut ZipArchive<File>,
        inspection: &Inspection,
        require_signature: bool,
        report: &mut RestoreReport,
    ) -> Step<Option<ParsedManifest>> {
        if !inspection.has_bundle_manifest {
            report.manifest_verification_status = ManifestStatus::LegacyMissingManifest;
            report.signature_verification_status = SignatureStatus::MissingManifestUnsignedLegacy;
            if require_signature {
                return Err(Failure::signature(
                    "Archive signature is required in strict mode, but bundle_manifest.json is missing.",
                ));
            }
            if !self.config.allow_legacy_archives {
                return Err(Failure::archive(
                    "bundle_manifest.json is missing and legacy archives are not allowed.",
                ));
            }
            report.warn("bundle_manifest.json is missing; legacy archive restored without integrity verification.");
            return Ok(None);
        }

        match verify_manifest_entries(archive, inspection, &mut report.files_checked) {
            Ok(parsed) => {
                report.manifest_verification_status = ManifestStatus::Verified;
                Ok(Some(parsed))
            }
            Err(failure) => {
                report.manifest_verification_status = ManifestStatus::Failed;
                Err(failure)
            }
        }
    }

    fn verify_signature(
        &self,
        manifest: Option<&ParsedManifest>,
        require_signature: bool,
        report: &mut RestoreReport,
    ) -> Step<()> {
        let Some(parsed) = manifest else {
            return Ok(());
        };
        report.archive_signed = !matches!(parsed.raw.get("signature"), None | Some(Value::Null));

        let (status, problem) = match check_signature(&parsed.raw, self.config.signing_key.as_deref()) {
            SignatureCheck::Verified => (SignatureStatus::Verified, None),
            SignatureCheck::Unsigned => (
                SignatureStatus::Unsigned,
                Some("Archive is unsigned (bundle_manifest.json has no signature).".to_string()),
            ),
            SignatureCheck::MissingKey => (
                SignatureStatus::SignedUnverifiedMissingKey,
                Some("Archive is signed, but no signing key is configured. Signature was not verified.".to_string()),
            ),
            SignatureCheck::Invalid(reason) => (
                SignatureStatus::InvalidIgnored,
                Some(format!("Archive signature is invalid: {}.", reason)),
            ),
        };

        match problem {
            None => {
                report.signature_verification_status = status;
                Ok(())
            }
            Some(message) if require_signature => {
                report.signature_verification_status = SignatureStatus::Failed;
                Err(Failure::signature(format!("{} Strict mode requires a valid signature.", message)))
            }
            Some(message) => {
                report.signature_verification_status = status;
                report.warn(format!("{} Strict mode is disabled, continuing.", message));
                Ok(())
            }
        }
    }

    fn remove_existing(&self, target: &RunRoot) -> Step<()> {
        let failed = |e: &dyn std::fmt::Display| {
            Failure::fs(format!("Failed to remove existing run before restore: {}", e))
        };
        let existing = self.db.get_run(target.run_id()).map_err(|e| failed(&e))?;
        if let Some(run) = existing {
            let recorded = self
                .artifacts
                .recorded_run_root(Path::new(&run.artifacts_root_path), &run.session_id, &run.run_id)
                .map_err(|e| failed(&e))?;
            remove_run(self.db, &recorded).map_err(|e| failed(&e))?;
        }
        if target.exists() {
            target.delete_tree().map_err(|e| failed(&e))?;
        }
        info!("Removed existing run {} before restore", target.run_id());
        Ok(())
    }
}

fn inspect_entries(archive: &mut ZipArchive<File>, limits: &RestoreLimits) -> Step<Inspection> {
    let count = archive.len();
    if count == 0 {
        return Err(Failure::archive("Archive is empty."));
    }
    if count > limits.max_entries {
        return Err(Failure::archive(format!(
            "Archive has too many entries ({}), limit is {}.",
            count, limits.max_entries
        )));
    }

    let mut names = Vec::with_capacity(count);
    for index in 0..count {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| Failure::archive(format!("Unreadable archive entry #{}: {}", index, e)))?;
        names.push((entry.name().to_string(), index));
    }
    names.sort();

    let mut seen = BTreeSet::new();
    let mut files = BTreeMap::new();
    let mut layout_roots = BTreeSet::new();
    let mut total: u64 = 0;

    for (name, index) in names {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| Failure::archive(format!("Unreadable archive entry {}: {}", name, e)))?;
        let logical = name.strip_suffix('/').unwrap_or(&name);
        let parts = validate_relative(logical)
            .map_err(|e| Failure::archive(format!("Archive entry has invalid path '{}': {}", name, e)))?;
        if !seen.insert(logical.to_string()) {
            return Err(Failure::archive(format!(
                "Archive contains duplicated entry path: {}",
                name
            )));
        }
        if entry
            .unix_mode()
            .map(|mode| mode & S_IFMT == S_IFLNK)
            .unwrap_or(false)
        {
            return Err(Failure::archive(format!("Archive contains symlink entry: {}", name)));
        }
        if entry.is_dir() {
            continue;
        }

        let size = entry.size();
        if size > limits.max_single_file_bytes {
            return Err(Failure::archive(format!(
                "Archive entry '{}' exceeds max_single_file_bytes: {} > {}.",
                name, size, limits.max_single_file_bytes
            )));
        }
        let ratio = size as f64 / entry.compressed_size().max(1) as f64;
        if ratio > limits.max_compression_ratio {
            return Err(Failure::archive(format!(
                "Archive entry '{}' exceeds max_compression_ratio: {:.2} > {:.2}.",
                name, ratio, limits.max_compression_ratio
            )));
        }
        total = total.saturating_add(size);
        if total > limits.max_total_uncompressed_bytes {
            return Err(Failure::archive(format!(
                "Archive uncompressed size exceeds allowed limit: {} > {}.",
                total, limits.max_total_uncompressed_bytes
            )));
        }

        if parts.len() > 1 && LAYOUT_ROOTS.contains(&parts[0]) {
            layout_roots.insert(parts[0].to_string());
        }
        files.insert(logical.to_string(), EntryInfo { index, size });
    }

    if !files.contains_key(RUN_MANIFEST_FILE) {
        return Err(Failure::archive("Archive does not contain run.json."));
    }
    if layout_roots.is_empty() {
        return Err(Failure::archive(
            "Archive must contain at least one layout root from logs/documents/llm.",
        ));
    }

    Ok(Inspection {
        has_bundle_manifest: files.contains_key(BUNDLE_MANIFEST_FILE),
        files,
    })
}

/// Read an entry fully, refusing anything longer than its declared size.
fn read_entry(archive: &mut ZipArchive<File>, name: &str, info: EntryInfo) -> Step<Vec<u8>> {
    let entry = archive
        .by_index(info.index)
        .map_err(|e| Failure::archive(format!("Failed to read {}: {}", name, e)))?;
    let mut buf = Vec::new();
    entry
        .take(info.size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| Failure::archive(format!("Failed to read {}: {}", name, e)))?;
    if buf.len() as u64 != info.size {
        return Err(Failure::archive(format!(
            "Archive entry '{}' size mismatch: {} != {}.",
            name,
            buf.len(),
            info.size
        )));
    }
    Ok(buf)
}

fn verify_manifest_entries(
    archive: &mut ZipArchive<File>,
    inspection: &Inspection,
    files_checked: &mut usize,
) -> Step<ParsedManifest> {
    let manifest_info = inspection
        .files
        .get(BUNDLE_MANIFEST_FILE)
        .copied()
        .ok_or_else(|| Failure::archive("bundle_manifest.json is not present."))?;
    let bytes = read_entry(archive, BUNDLE_MANIFEST_FILE, manifest_info)?;
    let parsed = BundleManifest::parse(&bytes).map_err(|e| Failure::new(e.error_code(), e.to_string()))?;

    let mut listed = BTreeSet::new();
    for expected in &parsed.manifest.files {
        *files_checked += 1;
        let path = expected.relative_path.as_str();
        listed.insert(path);
        let info = inspection.files.get(path).copied().ok_or_else(|| {
            Failure::archive(format!("Integrity mismatch: '{}' is listed but missing from archive.", path))
        })?;
        if info.size != expected.size_bytes {
            return Err(Failure::archive(format!(
                "Integrity mismatch for '{}': size {} != {}.",
                path, info.size, expected.size_bytes
            )));
        }
        let entry = archive
            .by_index(info.index)
            .map_err(|e| Failure::archive(format!("Failed to read {}: {}", path, e)))?;
        let (digest, read) = sha256_reader(entry.take(expected.size_bytes.saturating_add(1)))
            .map_err(|e| Failure::archive(format!("Failed to read {}: {}", path, e)))?;
        if read != expected.size_bytes {
            return Err(Failure::archive(format!(
                "Integrity mismatch for '{}': size {} != {}.",
                path, read, expected.size_bytes
            )));
        }
        if digest != expected.sha256 {
            return Err(Failure::archive(format!(
                "Integrity mismatch for '{}': sha256 does not match.",
                path
            )));
        }
    }

    for path in inspection.files.keys() {
        if path == BUNDLE_MANIFEST_FILE || listed.contains(path.as_str()) {
            continue;
        }
        *files_checked += 1;
        return Err(Failure::archive(format!(
            "Integrity mismatch: '{}' is not listed in bundle_manifest.json.",
            path
        )));
    }
    Ok(parsed)
}

fn read_run_snapshot(archive: &mut ZipArchive<File>, inspection: &Inspection) -> Step<Map<String, Value>> {
    let info = inspection
        .files
        .get(RUN_MANIFEST_FILE)
        .copied()
        .ok_or_else(|| Failure::archive("Archive does not contain run.json."))?;
    let bytes = read_entry(archive, RUN_MANIFEST_FILE, info)?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Failure::archive(format!("Failed to parse run.json: {}", e)))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Failure::archive("run.json root must be a JSON object.")),
    }
}

fn snapshot_identity(snapshot: &Map<String, Value>) -> Step<(String, String)> {
    let run_id = text(snapshot.get("run_id")).unwrap_or_default();
    let session_id = text(snapshot.get("session_id")).unwrap_or_default();
    if run_id.is_empty() || session_id.is_empty() {
        return Err(Failure::archive("run.json must contain non-empty session_id and run_id."));
    }
    validate_identifier(&run_id).map_err(|e| Failure::archive(format!("run.json run_id is invalid: {}", e)))?;
    validate_identifier(&session_id)
        .map_err(|e| Failure::archive(format!("run.json session_id is invalid: {}", e)))?;
    Ok((run_id, session_id))
}

fn extract_entries(archive: &mut ZipArchive<File>, inspection: &Inspection, staged: &Path) -> Step<()> {
    fs::create_dir_all(staged)
        .map_err(|e| Failure::fs(format!("Failed to create {}: {}", staged.display(), e)))?;
    let guard = ContainedRoot::new(staged).map_err(|e| Failure::fs(e.to_string()))?;

    for (name, info) in &inspection.files {
        if name == BUNDLE_MANIFEST_FILE {
            continue;
        }
        let destination = guard
            .resolve(name)
            .map_err(|e| Failure::archive(format!("Path traversal detected in archive entry {}: {}", name, e)))?;
        let bytes = read_entry(archive, name, *info)?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Failure::fs(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        fs::write(&destination, bytes)
            .map_err(|e| Failure::fs(format!("Failed to write {}: {}", destination.display(), e)))?;
    }
    Ok(())
}

fn move_into_place(staged: &Path, target: &Path) -> Step<()> {
    if fs::symlink_metadata(target).is_ok() {
        return Err(Failure::new(
            ErrorCode::RestoreRunExists,
            format!("Target run path already exists: {}", target.display()),
        ));
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Failure::fs(format!("Failed to create {}: {}", parent.display(), e)))?;
    }
    fs::rename(staged, target).map_err(|e| {
        Failure::fs(format!(
            "Failed to move restored tree into {}: {}",
            target.display(),
            e
        ))
    })
}

fn restored_paths(target: &RunRoot) -> Vec<String> {
    let mut paths = vec![target.path().display().to_string()];
    for relative in [RUN_MANIFEST_FILE, RUN_LOG_PATH, LLM_PARSED_PATH, LLM_VALIDATION_PATH] {
        if target.is_file(relative) {
            if let Ok(path) = target.resolve(relative) {
                paths.push(path.display().to_string());
            }
        }
    }
    paths
}

/// Trimmed non-empty string form of a scalar.
fn text(value: Option<&Value>) -> Option<String> {
    let raw = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

fn object_or_empty(value: Option<&Value>) -> Value {
    match value {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => Value::Object(Map::new()),
    }
}

fn build_restored_run(
    snapshot: &Map<String, Value>,
    target: &RunRoot,
    report: &mut RestoreReport,
) -> Result<RestoredRun, StoreError> {
    let run_id = target.run_id().to_string();
    let session_id = target.session_id().to_string();
    let empty = Map::new();
    let inputs = snapshot.get("inputs").and_then(Value::as_object).unwrap_or(&empty);
    let metrics = snapshot.get("metrics").and_then(Value::as_object).unwrap_or(&empty);

    let input = |key: &str| text(inputs.get(key)).unwrap_or_else(|| "unknown".to_string());
    let prompt_version = input("prompt_version");
    let schema_version = text(inputs.get("schema_version")).unwrap_or_else(|| prompt_version.clone());

    let status = match text(snapshot.get("status")) {
        None => RunStatus::Completed,
        Some(raw) => raw.parse::<RunStatus>().unwrap_or_else(|_| {
            report.warn(format!("Invalid run status '{}' in run.json. Fallback to 'completed'.", raw));
            RunStatus::Completed
        }),
    };
    let created_at = text(snapshot.get("created_at"))
        .and_then(|raw| normalize_timestamp(&raw))
        .unwrap_or_else(now_timestamp);

    let run = RunRecord {
        run_id: run_id.clone(),
        session_id: session_id.clone(),
        created_at: created_at.clone(),
        provider: input("provider"),
        model: input("model"),
        prompt_name: input("prompt_name"),
        prompt_version,
        schema_version,
        status,
        error_code: text(snapshot.get("error_code")),
        error_message: text(snapshot.get("error_message")),
        timings: object_or_empty(metrics.get("timings")),
        usage: object_or_empty(metrics.get("usage")),
        usage_normalized: object_or_empty(metrics.get("usage_normalized")),
        cost: object_or_empty(metrics.get("cost")),
        artifacts_root_path: target.path().display().to_string(),
    };

    let ocr_model_hint = inputs
        .get("ocr_options")
        .and_then(|o| text(o.get("model")));
    let documents = restored_documents(snapshot, target, ocr_model_hint.as_deref(), report)?;
    let llm_output = restored_llm_output(target, report);

    let mut artifact_refs = Vec::new();
    for file in target.list_files()? {
        if let Some((kind, doc_id)) = ArtifactKind::classify_path(&file.relative_path) {
            artifact_refs.push(ArtifactRefRecord {
                run_id: run_id.clone(),
                doc_id,
                kind,
                relative_path: file.relative_path,
                metadata: json!({ "size_bytes": file.size_bytes }),
            });
        }
    }

    Ok(RestoredRun {
        session: SessionRecord {
            session_id,
            created_at,
        },
        run,
        documents,
        llm_output,
        artifact_refs,
    })
}

fn restored_documents(
    snapshot: &Map<String, Value>,
    target: &RunRoot,
    ocr_model_hint: Option<&str>,
    report: &mut RestoreReport,
) -> Result<Vec<RestoredDocument>, StoreError> {
    let listed = snapshot
        .get("artifacts")
        .and_then(|a| a.get("documents"))
        .and_then(Value::as_array);

    let mut entries: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
    match listed {
        Some(items) => {
            for item in items.iter().filter_map(Value::as_object) {
                let Some(doc_id) = text(item.get("doc_id")) else {
                    continue;
                };
                if let Err(e) = validate_identifier(&doc_id) {
                    report.warn(format!("Skipping document with invalid doc_id: {}", e));
                    continue;
                }
                entries.insert(doc_id, item.clone());
            }
        }
        None => {
            for child in target.list_children("documents")? {
                if child.is_dir {
                    entries.insert(child.name, Map::new());
                }
            }
        }
    }

    let mut documents = Vec::with_capacity(entries.len());
    for (doc_id, item) in entries {
        documents.push(restored_document(target, &doc_id, &item, ocr_model_hint, report)?);
    }
    Ok(documents)
}

fn restored_document(
    target: &RunRoot,
    doc_id: &str,
    item: &Map<String, Value>,
    ocr_model_hint: Option<&str>,
    report: &mut RestoreReport,
) -> Result<RestoredDocument, StoreError> {
    let doc_root = format!("documents/{}", doc_id);
    let original = target
        .list_children(&format!("{}/original", doc_root))?
        .into_iter()
        .find(|child| !child.is_dir);

    let (original_filename, original_mime) = match original {
        Some(child) => {
            let mime = guess_mime(&child.name).map(str::to_string);
            (child.name, mime)
        }
        None => {
            report.warn(format!("Original file not found for doc_id={}", doc_id));
            (format!("{}.bin", doc_id), None)
        }
    };

    let pages_count = match item.get("pages_count").and_then(Value::as_i64) {
        Some(count) => Some(count),
        None => {
            let pages = target.list_children(&format!("{}/ocr/pages", doc_root))?;
            let markdown = pages.iter().filter(|p| !p.is_dir && p.name.ends_with(".md")).count();
            (!pages.is_empty()).then_some(markdown as i64)
        }
    };

    let ocr_status = match text(item.get("ocr_status")) {
        None => OcrStatus::Ok,
        Some(raw) => raw.parse::<OcrStatus>().unwrap_or_else(|_| {
            report.warn(format!(
                "Invalid ocr_status '{}' for doc_id={}. Fallback to 'ok'.",
                raw, doc_id
            ));
            OcrStatus::Ok
        }),
    };

    Ok(RestoredDocument {
        document: NewDocument {
            run_id: target.run_id().to_string(),
            doc_id: doc_id.to_string(),
            original_path: format!("{}/original/{}", doc_root, original_filename),
            original_filename,
            original_mime,
        },
        ocr: OcrUpdate {
            ocr_status,
            ocr_model: text(item.get("ocr_model")).or_else(|| ocr_model_hint.map(str::to_string)),
            pages_count,
            ocr_artifacts_path: Some(format!("{}/ocr", doc_root)),
            ocr_error: text(item.get("ocr_error")),
        },
    })
}

fn restored_llm_output(target: &RunRoot, report: &mut RestoreReport) -> Option<LlmOutputRecord> {
    if !target.is_file(LLM_PARSED_PATH) {
        report.warn("LLM parsed response file is missing.");
        return None;
    }
    let valid = match target.read_json::<Value>(LLM_VALIDATION_PATH) {
        Ok(payload) => payload.get("valid").and_then(Value::as_bool).unwrap_or(false),
        Err(StoreError::NotFound(_)) => false,
        Err(e) => {
            report.warn(format!(
                "Validation artifact is unreadable; response_valid set to false ({}).",
                e
            ));
            false
        }
    };
    Some(LlmOutputRecord {
        run_id: target.run_id().to_string(),
        response_json_path: LLM_PARSED_PATH.to_string(),
        response_valid: valid,
        schema_validation_errors_path: (!valid).then(|| LLM_VALIDATION_PATH.to_string()),
    })
}
