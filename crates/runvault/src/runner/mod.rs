//! Run orchestration.
//!
//! The orchestrator drives one run through its stages and talks to the
//! outside world only through three injected collaborators:
//! - `OcrClient`: turns one original document into page markdown
//! - `LlmClient`: turns the packed documents into a structured answer
//! - `OutputValidator`: checks the parsed answer against the prompt schema

pub mod cancel;
mod orchestrator;
pub mod pack;
pub mod quality;
pub mod snapshot;

pub use cancel::CancellationToken;
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest};
pub use snapshot::{DocumentEntry, RunSnapshot};

use crate::artifacts::StoreError;
use runvault_db::{DbError, LockError};
use runvault_protocol::{ErrorCode, ProviderError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A named binary attachment returned by OCR (table, image, page render).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl NamedArtifact {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OcrRequest {
    pub doc_id: String,
    /// Stored copy of the original, inside the run root.
    pub input_path: PathBuf,
    pub filename: String,
    pub mime: Option<String>,
    pub options: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct OcrResult {
    pub model: String,
    /// Markdown per page, in page order.
    pub pages: Vec<String>,
    pub raw_response: Value,
    pub tables: Vec<NamedArtifact>,
    pub images: Vec<NamedArtifact>,
    pub page_renders: Vec<NamedArtifact>,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub run_id: String,
    pub system_prompt: String,
    pub user_content: String,
    pub schema: Value,
    pub model: String,
    pub params: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResult {
    /// Model text, parsed by the orchestrator.
    pub raw_text: String,
    pub usage: Value,
    pub usage_normalized: Value,
    pub cost: Value,
    pub timings: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub schema_errors: Vec<String>,
    pub invariant_errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }

    pub fn errors(&self) -> Vec<String> {
        self.schema_errors
            .iter()
            .chain(self.invariant_errors.iter())
            .cloned()
            .collect()
    }
}

/// Blocking OCR call. Implementations honor `request.timeout`.
pub trait OcrClient {
    fn process_document(&self, request: &OcrRequest) -> Result<OcrResult, ProviderError>;
}

/// Blocking inference call. Implementations honor `request.timeout`.
pub trait LlmClient {
    fn generate_structured(&self, request: &LlmRequest) -> Result<LlmResult, ProviderError>;
}

pub trait OutputValidator {
    fn validate(&self, parsed: &Value, schema: &Value) -> ValidationOutcome;
}

/// Errors that stop a run before it exists or from being started at all.
/// Once a run is created, failures are reported through `RunOutcome`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid run request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Failed to lock run: {0}")]
    Lock(#[from] LockError),
}

impl RunError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RunError::InvalidRequest(_) => ErrorCode::UnknownError,
            RunError::Store(e) => e.error_code(),
            RunError::Db(e) => e.error_code(),
            RunError::Lock(_) => ErrorCode::StorageError,
        }
    }
}
