//! The `run.json` checkpoint written at every stage transition.

use crate::artifacts::{RunRoot, StoreError, StoreResult};
use runvault_db::now_timestamp;
use runvault_protocol::defaults::{RUN_LOG_PATH, RUN_MANIFEST_FILE};
use runvault_protocol::{ErrorCode, OcrStatus, RunStage, RunStatus, StageName, StageStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInputs {
    pub provider: String,
    pub model: String,
    pub prompt_name: String,
    pub prompt_version: String,
    pub schema_version: String,
    pub ocr_options: Value,
    pub llm_params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    pub updated_at: String,
}

/// One document as the run sees it. Paths are relative to the run root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub doc_id: String,
    pub original_filename: String,
    pub original_mime: Option<String>,
    pub original_path: String,
    pub ocr_status: OcrStatus,
    pub ocr_model: Option<String>,
    pub pages_count: Option<i64>,
    pub ocr_artifacts_path: String,
    pub ocr_error: Option<String>,
    #[serde(default)]
    pub quality_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmArtifactPaths {
    pub request_path: String,
    pub response_raw_path: String,
    pub response_parsed_path: String,
    pub validation_path: String,
}

impl Default for LlmArtifactPaths {
    fn default() -> Self {
        Self {
            request_path: "llm/request.txt".to_string(),
            response_raw_path: "llm/response_raw.txt".to_string(),
            response_parsed_path: "llm/response_parsed.json".to_string(),
            validation_path: "llm/validation.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotArtifacts {
    /// Absolute run root.
    pub root: String,
    pub run_log: String,
    pub documents: Vec<DocumentEntry>,
    pub llm: LlmArtifactPaths,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub timings: Value,
    pub usage: Value,
    pub usage_normalized: Value,
    pub cost: Value,
}

impl Default for SnapshotMetrics {
    fn default() -> Self {
        let empty = || Value::Object(Map::new());
        Self {
            timings: empty(),
            usage: empty(),
            usage_normalized: empty(),
            cost: empty(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub session_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub stage: RunStage,
    pub failed_stage: Option<StageName>,
    pub inputs: SnapshotInputs,
    pub stages: BTreeMap<StageName, StageRecord>,
    pub artifacts: SnapshotArtifacts,
    pub metrics: SnapshotMetrics,
    pub validation: SnapshotValidation,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl RunSnapshot {
    pub fn new(root: &RunRoot, inputs: SnapshotInputs, created_at: &str) -> Self {
        let stages = StageName::ALL
            .iter()
            .map(|name| {
                (
                    *name,
                    StageRecord {
                        status: StageStatus::Pending,
                        updated_at: created_at.to_string(),
                    },
                )
            })
            .collect();
        Self {
            session_id: root.session_id().to_string(),
            run_id: root.run_id().to_string(),
            status: RunStatus::Created,
            stage: RunStage::Created,
            failed_stage: None,
            inputs,
            stages,
            artifacts: SnapshotArtifacts {
                root: root.path().display().to_string(),
                run_log: RUN_LOG_PATH.to_string(),
                documents: Vec::new(),
                llm: LlmArtifactPaths::default(),
            },
            metrics: SnapshotMetrics::default(),
            validation: SnapshotValidation::default(),
            error_code: None,
            error_message: None,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
        }
    }

    /// Move the state machine forward. Returns false for an illegal transition.
    pub fn advance(&mut self, next: RunStage) -> bool {
        if !self.stage.can_transition_to(next) {
            return false;
        }
        self.stage = next;
        self.status = next.status();
        true
    }

    pub fn set_stage(&mut self, name: StageName, status: StageStatus) {
        self.stages.insert(
            name,
            StageRecord {
                status,
                updated_at: now_timestamp(),
            },
        );
    }

    /// Mark `failed` as failed and every stage still pending as skipped.
    pub fn record_failure(&mut self, failed: StageName, code: ErrorCode, message: &str) {
        let now = now_timestamp();
        for (name, record) in self.stages.iter_mut() {
            if *name == failed {
                record.status = StageStatus::Failed;
                record.updated_at = now.clone();
            } else if matches!(record.status, StageStatus::Pending | StageStatus::Running) {
                record.status = StageStatus::Skipped;
                record.updated_at = now.clone();
            }
        }
        self.stage = RunStage::Failed;
        self.status = RunStatus::Failed;
        self.failed_stage = Some(failed);
        self.error_code = Some(code);
        self.error_message = Some(message.to_string());
    }

    pub fn document_mut(&mut self, doc_id: &str) -> Option<&mut DocumentEntry> {
        self.artifacts.documents.iter_mut().find(|d| d.doc_id == doc_id)
    }

    /// Atomically replace `run.json`, bumping `updated_at`.
    pub fn write(&mut self, root: &RunRoot) -> StoreResult<()> {
        self.updated_at = now_timestamp();
        let body = serde_json::to_vec_pretty(self).map_err(|e| StoreError::InvalidJson {
            path: RUN_MANIFEST_FILE.to_string(),
            message: e.to_string(),
        })?;
        root.write_atomic(RUN_MANIFEST_FILE, &body)?;
        Ok(())
    }

    pub fn load(root: &RunRoot) -> StoreResult<Self> {
        root.read_json(RUN_MANIFEST_FILE)
    }
}
