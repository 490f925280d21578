//! Run bundles: deterministic ZIP export and integrity-checked restore.
//!
//! A bundle is every file of a run tree plus `bundle_manifest.json`, which
//! lists each file's size and SHA-256 and may carry an HMAC signature.

pub mod export;
pub mod manifest;
pub mod restore;

pub use export::{export_by_id, export_run, ExportOptions, ExportReport, ExportStatus, RunLocation};
pub use manifest::{
    check_signature, BundleManifest, BundleSignature, ManifestEntry, ManifestError, ManifestStatus,
    ParsedManifest, SignatureCheck, SignatureStatus,
};
pub use restore::{RestoreOptions, RestoreReport, RestoreService, RestoreStatus};

use crate::artifacts::StoreError;
use runvault_db::LockError;
use runvault_protocol::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run is locked: {0}")]
    Lock(#[from] LockError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Artifacts root is empty: {0}")]
    EmptyRun(String),

    #[error("File changed while exporting: {0}")]
    Changed(String),
}

impl BundleError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            BundleError::Manifest(e) => e.error_code(),
            _ => ErrorCode::StorageError,
        }
    }
}
