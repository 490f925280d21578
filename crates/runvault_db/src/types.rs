//! Row types for the metadata store.

use runvault_protocol::{ArtifactKind, OcrStatus, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: String,
}

/// Fields supplied when a run starts.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub run_id: String,
    pub session_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_name: String,
    pub prompt_version: String,
    pub schema_version: String,
    pub artifacts_root_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub session_id: String,
    pub created_at: String,
    pub provider: String,
    pub model: String,
    pub prompt_name: String,
    pub prompt_version: String,
    pub schema_version: String,
    pub status: RunStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub timings: Value,
    pub usage: Value,
    pub usage_normalized: Value,
    pub cost: Value,
    pub artifacts_root_path: String,
}

/// Opaque metric blobs owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub timings: Value,
    pub usage: Value,
    pub usage_normalized: Value,
    pub cost: Value,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            timings: Value::Object(Default::default()),
            usage: Value::Object(Default::default()),
            usage_normalized: Value::Object(Default::default()),
            cost: Value::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub run_id: String,
    pub doc_id: String,
    pub original_filename: String,
    pub original_mime: Option<String>,
    pub original_path: String,
}

/// OCR outcome recorded against a document row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OcrUpdate {
    pub ocr_status: OcrStatus,
    pub ocr_model: Option<String>,
    pub pages_count: Option<i64>,
    pub ocr_artifacts_path: Option<String>,
    pub ocr_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub run_id: String,
    pub doc_id: String,
    pub original_filename: String,
    pub original_mime: Option<String>,
    pub original_path: String,
    pub ocr_status: OcrStatus,
    pub ocr_model: Option<String>,
    pub pages_count: Option<i64>,
    pub ocr_artifacts_path: Option<String>,
    pub ocr_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmOutputRecord {
    pub run_id: String,
    pub response_json_path: String,
    pub response_valid: bool,
    pub schema_validation_errors_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRefRecord {
    pub run_id: String,
    pub doc_id: Option<String>,
    pub kind: ArtifactKind,
    pub relative_path: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub session_id: Option<String>,
    /// Inclusive upper bound on `created_at` (RFC 3339, UTC)
    pub created_before: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Document row rebuilt from a restored run tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredDocument {
    pub document: NewDocument,
    pub ocr: OcrUpdate,
}

/// Everything reconciled into the store for one restored run.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredRun {
    pub session: SessionRecord,
    pub run: RunRecord,
    pub documents: Vec<RestoredDocument>,
    pub llm_output: Option<LlmOutputRecord>,
    pub artifact_refs: Vec<ArtifactRefRecord>,
}
