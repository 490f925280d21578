//! Run lifecycle vocabulary shared by the store, the orchestrator and the services.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted run status. Coarser than [`RunStage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Created,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "created" => Ok(RunStatus::Created),
            "running" => Ok(RunStatus::Running),
            "completed" | "complete" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Invalid run status: '{}'", s)),
        }
    }
}

/// Orchestrator state machine.
///
/// `created → running → ocr → packed → inferred → validated → completed`,
/// with `failed` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    #[default]
    Created,
    Running,
    Ocr,
    Packed,
    Inferred,
    Validated,
    Completed,
    Failed,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Created => "created",
            RunStage::Running => "running",
            RunStage::Ocr => "ocr",
            RunStage::Packed => "packed",
            RunStage::Inferred => "inferred",
            RunStage::Validated => "validated",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            RunStage::Created => 0,
            RunStage::Running => 1,
            RunStage::Ocr => 2,
            RunStage::Packed => 3,
            RunStage::Inferred => 4,
            RunStage::Validated => 5,
            RunStage::Completed => 6,
            RunStage::Failed => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStage::Completed | RunStage::Failed)
    }

    /// Strictly forward, one step at a time; `Failed` from anything non-terminal.
    pub fn can_transition_to(&self, next: RunStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunStage::Failed {
            return true;
        }
        next.ordinal() == self.ordinal() + 1
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunStage::Created => RunStatus::Created,
            RunStage::Running
            | RunStage::Ocr
            | RunStage::Packed
            | RunStage::Inferred
            | RunStage::Validated => RunStatus::Running,
            RunStage::Completed => RunStatus::Completed,
            RunStage::Failed => RunStatus::Failed,
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named steps recorded in the run snapshot's `stages` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Init,
    Ocr,
    Pack,
    Llm,
    Validate,
    Finalize,
}

impl StageName {
    pub const ALL: [StageName; 6] = [
        StageName::Init,
        StageName::Ocr,
        StageName::Pack,
        StageName::Llm,
        StageName::Validate,
        StageName::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Init => "init",
            StageName::Ocr => "ocr",
            StageName::Pack => "pack",
            StageName::Llm => "llm",
            StageName::Validate => "validate",
            StageName::Finalize => "finalize",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }
}

/// Per-document OCR status, independent of the run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OcrStatus {
    #[default]
    Pending,
    Ok,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Pending => "pending",
            OcrStatus::Ok => "ok",
            OcrStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OcrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OcrStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OcrStatus::Pending),
            "ok" => Ok(OcrStatus::Ok),
            "failed" => Ok(OcrStatus::Failed),
            _ => Err(format!("Invalid OCR status: '{}'", s)),
        }
    }
}

/// What an artifact reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RunManifest,
    RunLog,
    Original,
    OcrRaw,
    OcrCombined,
    OcrPage,
    OcrTable,
    OcrImage,
    OcrPageRender,
    OcrQuality,
    LlmRequest,
    LlmResponseRaw,
    LlmResponseParsed,
    LlmValidation,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 14] = [
        ArtifactKind::RunManifest,
        ArtifactKind::RunLog,
        ArtifactKind::Original,
        ArtifactKind::OcrRaw,
        ArtifactKind::OcrCombined,
        ArtifactKind::OcrPage,
        ArtifactKind::OcrTable,
        ArtifactKind::OcrImage,
        ArtifactKind::OcrPageRender,
        ArtifactKind::OcrQuality,
        ArtifactKind::LlmRequest,
        ArtifactKind::LlmResponseRaw,
        ArtifactKind::LlmResponseParsed,
        ArtifactKind::LlmValidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::RunManifest => "run_manifest",
            ArtifactKind::RunLog => "run_log",
            ArtifactKind::Original => "original",
            ArtifactKind::OcrRaw => "ocr_raw",
            ArtifactKind::OcrCombined => "ocr_combined",
            ArtifactKind::OcrPage => "ocr_page",
            ArtifactKind::OcrTable => "ocr_table",
            ArtifactKind::OcrImage => "ocr_image",
            ArtifactKind::OcrPageRender => "ocr_page_render",
            ArtifactKind::OcrQuality => "ocr_quality",
            ArtifactKind::LlmRequest => "llm_request",
            ArtifactKind::LlmResponseRaw => "llm_response_raw",
            ArtifactKind::LlmResponseParsed => "llm_response_parsed",
            ArtifactKind::LlmValidation => "llm_validation",
        }
    }

    /// Infer the kind of a file from its run-relative path.
    ///
    /// Returns the document id alongside the kind for paths under `documents/`.
    pub fn classify_path(relative_path: &str) -> Option<(ArtifactKind, Option<String>)> {
        let parts: Vec<&str> = relative_path.split('/').collect();
        match parts.as_slice() {
            ["run.json"] => Some((ArtifactKind::RunManifest, None)),
            ["logs", "run.log"] => Some((ArtifactKind::RunLog, None)),
            ["llm", "request.txt"] => Some((ArtifactKind::LlmRequest, None)),
            ["llm", "response_raw.txt"] => Some((ArtifactKind::LlmResponseRaw, None)),
            ["llm", "response_parsed.json"] => Some((ArtifactKind::LlmResponseParsed, None)),
            ["llm", "validation.json"] => Some((ArtifactKind::LlmValidation, None)),
            ["documents", doc_id, "original", _] => {
                Some((ArtifactKind::Original, Some((*doc_id).to_string())))
            }
            ["documents", doc_id, "ocr", rest @ ..] => {
                let kind = match rest {
                    ["raw_response.json"] => ArtifactKind::OcrRaw,
                    ["combined.md"] => ArtifactKind::OcrCombined,
                    ["quality.json"] => ArtifactKind::OcrQuality,
                    ["pages", _] => ArtifactKind::OcrPage,
                    ["tables", _] => ArtifactKind::OcrTable,
                    ["images", _] => ArtifactKind::OcrImage,
                    ["page_renders", _] => ArtifactKind::OcrPageRender,
                    _ => return None,
                };
                Some((kind, Some((*doc_id).to_string())))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Invalid artifact kind: '{}'", s))
    }
}

/// Deterministic document identifier: 1-based upload order, 7-digit zero padded.
pub fn doc_id_for(index: usize) -> String {
    format!("{:07}", index)
}
