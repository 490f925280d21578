//! Error taxonomy and classifier.
//!
//! Every failure in runvault resolves to exactly one [`ErrorCode`]. Provider
//! clients report failures as [`ProviderError`] variants; [`classify`] maps
//! those onto the taxonomy depending on which kind of call produced them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Fixed taxonomy of failure codes.
///
/// This is the CANONICAL definition. Persisted in `runs.error_code`,
/// `run.json` and every report as the SCREAMING_SNAKE_CASE string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FileUnsupported,
    OcrApiError,
    OcrParseError,
    LlmApiError,
    LlmInvalidJson,
    LlmSchemaInvalid,
    ContextTooLarge,
    StorageError,
    UnknownError,
    RestoreInvalidArchive,
    RestoreInvalidSignature,
    RestoreRunExists,
    RestoreFsError,
    RestoreDbError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::FileUnsupported,
        ErrorCode::OcrApiError,
        ErrorCode::OcrParseError,
        ErrorCode::LlmApiError,
        ErrorCode::LlmInvalidJson,
        ErrorCode::LlmSchemaInvalid,
        ErrorCode::ContextTooLarge,
        ErrorCode::StorageError,
        ErrorCode::UnknownError,
        ErrorCode::RestoreInvalidArchive,
        ErrorCode::RestoreInvalidSignature,
        ErrorCode::RestoreRunExists,
        ErrorCode::RestoreFsError,
        ErrorCode::RestoreDbError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileUnsupported => "FILE_UNSUPPORTED",
            ErrorCode::OcrApiError => "OCR_API_ERROR",
            ErrorCode::OcrParseError => "OCR_PARSE_ERROR",
            ErrorCode::LlmApiError => "LLM_API_ERROR",
            ErrorCode::LlmInvalidJson => "LLM_INVALID_JSON",
            ErrorCode::LlmSchemaInvalid => "LLM_SCHEMA_INVALID",
            ErrorCode::ContextTooLarge => "CONTEXT_TOO_LARGE",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::RestoreInvalidArchive => "RESTORE_INVALID_ARCHIVE",
            ErrorCode::RestoreInvalidSignature => "RESTORE_INVALID_SIGNATURE",
            ErrorCode::RestoreRunExists => "RESTORE_RUN_EXISTS",
            ErrorCode::RestoreFsError => "RESTORE_FS_ERROR",
            ErrorCode::RestoreDbError => "RESTORE_DB_ERROR",
        }
    }

    /// Short user-facing sentence for this failure category.
    pub fn friendly_message(&self) -> &'static str {
        match self {
            ErrorCode::FileUnsupported => "Uploaded file format is not supported.",
            ErrorCode::OcrApiError => "OCR service request failed. Please retry.",
            ErrorCode::OcrParseError => "OCR service response could not be parsed.",
            ErrorCode::LlmApiError => "LLM provider request failed. Please retry or switch model.",
            ErrorCode::LlmInvalidJson => "Model returned invalid JSON output.",
            ErrorCode::LlmSchemaInvalid => "Model output failed schema validation.",
            ErrorCode::ContextTooLarge => "Input content is too large for selected model.",
            ErrorCode::StorageError => "Storage operation failed while saving run data.",
            ErrorCode::UnknownError => "Unexpected error occurred during pipeline run.",
            ErrorCode::RestoreInvalidArchive => {
                "Restore bundle is invalid or unsafe. Verify archive source and try again."
            }
            ErrorCode::RestoreInvalidSignature => {
                "Restore bundle signature verification failed or signature is required."
            }
            ErrorCode::RestoreRunExists => {
                "Run already exists in local storage. Enable overwrite to restore it."
            }
            ErrorCode::RestoreFsError => "Restore failed due to filesystem access error.",
            ErrorCode::RestoreDbError => "Restore failed while writing metadata into SQLite.",
        }
    }

    pub fn is_restore(&self) -> bool {
        matches!(
            self,
            ErrorCode::RestoreInvalidArchive
                | ErrorCode::RestoreInvalidSignature
                | ErrorCode::RestoreRunExists
                | ErrorCode::RestoreFsError
                | ErrorCode::RestoreDbError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == upper)
            .ok_or_else(|| format!("Invalid error code: '{}'", s))
    }
}

/// Which external collaborator produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Ocr,
    Llm,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Ocr => "ocr",
            CallKind::Llm => "llm",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CallKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ocr" => Ok(CallKind::Ocr),
            "llm" | "inference" => Ok(CallKind::Llm),
            _ => Err(format!("Invalid call kind: '{}'", s)),
        }
    }
}

/// Failure reported by an OCR or inference client, or by local checks
/// wrapped around those calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("provider returned HTTP {status}")]
    Http { status: u16, body: Option<String> },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("response could not be parsed: {0}")]
    Parse(String),

    #[error("invalid JSON output: {0}")]
    InvalidJson(String),

    #[error("schema validation failed: {0}")]
    SchemaInvalid(String),

    #[error("packed input has {chars} chars, limit is {limit}")]
    ContextTooLarge { chars: usize, limit: usize },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn http(status: u16) -> Self {
        Self::Http { status, body: None }
    }

    pub fn http_with_body(status: u16, body: impl Into<String>) -> Self {
        Self::Http {
            status,
            body: Some(body.into()),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            ProviderError::UnsupportedFile(_) => "UnsupportedFile",
            ProviderError::Http { .. } => "Http",
            ProviderError::Timeout(_) => "Timeout",
            ProviderError::Network(_) => "Network",
            ProviderError::Parse(_) => "Parse",
            ProviderError::InvalidJson(_) => "InvalidJson",
            ProviderError::SchemaInvalid(_) => "SchemaInvalid",
            ProviderError::ContextTooLarge { .. } => "ContextTooLarge",
            ProviderError::Storage(_) => "Storage",
            ProviderError::Other(_) => "Other",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Expandable detail string shown next to the friendly message.
    pub fn technical_details(&self) -> String {
        let mut parts = vec![format!("{}: {}", self.variant_name(), self)];
        if let ProviderError::Http { status, body } = self {
            parts.push(format!("status_code={}", status));
            if let Some(body) = body.as_deref().filter(|b| !b.trim().is_empty()) {
                parts.push(format!("body={}", body.trim()));
            }
        }
        parts.join("; ")
    }
}

/// HTTP statuses worth a second attempt: rate limiting and server errors.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// Map a provider failure onto the taxonomy.
///
/// Total over every variant; the same error can map differently for OCR and
/// inference calls (a parse failure is `OCR_PARSE_ERROR` for one and
/// `LLM_INVALID_JSON` for the other).
pub fn classify(error: &ProviderError, kind: CallKind) -> ErrorCode {
    match (error, kind) {
        (ProviderError::UnsupportedFile(_), _) => ErrorCode::FileUnsupported,
        (ProviderError::ContextTooLarge { .. }, _) => ErrorCode::ContextTooLarge,
        (ProviderError::Storage(_), _) => ErrorCode::StorageError,
        (ProviderError::Other(_), _) => ErrorCode::UnknownError,

        (ProviderError::Http { .. }, CallKind::Ocr)
        | (ProviderError::Timeout(_), CallKind::Ocr)
        | (ProviderError::Network(_), CallKind::Ocr) => ErrorCode::OcrApiError,
        (ProviderError::Parse(_), CallKind::Ocr)
        | (ProviderError::InvalidJson(_), CallKind::Ocr)
        | (ProviderError::SchemaInvalid(_), CallKind::Ocr) => ErrorCode::OcrParseError,

        (ProviderError::Http { .. }, CallKind::Llm)
        | (ProviderError::Timeout(_), CallKind::Llm)
        | (ProviderError::Network(_), CallKind::Llm) => ErrorCode::LlmApiError,
        (ProviderError::Parse(_), CallKind::Llm) | (ProviderError::InvalidJson(_), CallKind::Llm) => {
            ErrorCode::LlmInvalidJson
        }
        (ProviderError::SchemaInvalid(_), CallKind::Llm) => ErrorCode::LlmSchemaInvalid,
    }
}

/// Whether a failed call may be attempted once more.
///
/// Transient transport failures only. Parse, schema and context-size
/// failures are deterministic for the same input and never qualify.
pub fn is_retryable(error: &ProviderError, kind: CallKind) -> bool {
    match kind {
        CallKind::Ocr | CallKind::Llm => match error {
            ProviderError::Http { status, .. } => is_retryable_status(*status),
            ProviderError::Timeout(_) | ProviderError::Network(_) => true,
            ProviderError::UnsupportedFile(_)
            | ProviderError::Parse(_)
            | ProviderError::InvalidJson(_)
            | ProviderError::SchemaInvalid(_)
            | ProviderError::ContextTooLarge { .. }
            | ProviderError::Storage(_)
            | ProviderError::Other(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip_strings() {
        for code in ErrorCode::ALL {
            let parsed: ErrorCode = code.as_str().parse().unwrap();
            assert_eq!(parsed, code);
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
        assert!("NOT_A_CODE".parse::<ErrorCode>().is_err());
    }

    #[test]
    fn test_friendly_messages_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::ALL {
            assert!(seen.insert(code.friendly_message()), "duplicate message for {}", code);
        }
    }

    #[test]
    fn test_classify_ocr() {
        assert_eq!(
            classify(&ProviderError::UnsupportedFile("a.xyz".into()), CallKind::Ocr),
            ErrorCode::FileUnsupported
        );
        assert_eq!(classify(&ProviderError::http(503), CallKind::Ocr), ErrorCode::OcrApiError);
        assert_eq!(
            classify(&ProviderError::Timeout("30s".into()), CallKind::Ocr),
            ErrorCode::OcrApiError
        );
        assert_eq!(
            classify(&ProviderError::Parse("missing pages".into()), CallKind::Ocr),
            ErrorCode::OcrParseError
        );
        assert_eq!(
            classify(&ProviderError::storage("disk full"), CallKind::Ocr),
            ErrorCode::StorageError
        );
        assert_eq!(classify(&ProviderError::other("boom"), CallKind::Ocr), ErrorCode::UnknownError);
    }

    #[test]
    fn test_classify_llm() {
        assert_eq!(classify(&ProviderError::http(400), CallKind::Llm), ErrorCode::LlmApiError);
        assert_eq!(
            classify(&ProviderError::InvalidJson("eof".into()), CallKind::Llm),
            ErrorCode::LlmInvalidJson
        );
        assert_eq!(
            classify(&ProviderError::SchemaInvalid("missing field".into()), CallKind::Llm),
            ErrorCode::LlmSchemaInvalid
        );
        assert_eq!(
            classify(&ProviderError::ContextTooLarge { chars: 10, limit: 5 }, CallKind::Llm),
            ErrorCode::ContextTooLarge
        );
        assert_eq!(
            classify(&ProviderError::Network("reset".into()), CallKind::Llm),
            ErrorCode::LlmApiError
        );
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(599));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(600));
    }

    #[test]
    fn test_is_retryable_by_variant() {
        for kind in [CallKind::Ocr, CallKind::Llm] {
            assert!(is_retryable(&ProviderError::http(503), kind));
            assert!(is_retryable(&ProviderError::http(429), kind));
            assert!(is_retryable(&ProviderError::Timeout("t".into()), kind));
            assert!(is_retryable(&ProviderError::Network("n".into()), kind));
            assert!(!is_retryable(&ProviderError::http(401), kind));
            assert!(!is_retryable(&ProviderError::InvalidJson("x".into()), kind));
            assert!(!is_retryable(&ProviderError::SchemaInvalid("x".into()), kind));
            assert!(!is_retryable(
                &ProviderError::ContextTooLarge { chars: 2, limit: 1 },
                kind
            ));
        }
    }

    #[test]
    fn test_technical_details_include_status_and_body() {
        let err = ProviderError::http_with_body(502, "  bad gateway ");
        let details = err.technical_details();
        assert!(details.starts_with("Http: provider returned HTTP 502"));
        assert!(details.contains("status_code=502"));
        assert!(details.contains("body=bad gateway"));

        let plain = ProviderError::Timeout("after 30s".into()).technical_details();
        assert_eq!(plain, "Timeout: request timed out: after 30s");
    }
}
