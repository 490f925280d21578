//! Diagnostics probe over the shared classifier and retry decision.

use super::print_json;
use anyhow::Result;
use clap::ValueEnum;
use runvault_protocol::{classify, is_retryable, CallKind, ErrorCode, ProviderError};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Ocr,
    Llm,
}

impl From<KindArg> for CallKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Ocr => CallKind::Ocr,
            KindArg::Llm => CallKind::Llm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ErrorArg {
    Timeout,
    Network,
    Parse,
    Unsupported,
    InvalidJson,
    Context,
    Storage,
    Other,
}

impl ErrorArg {
    fn to_error(self) -> ProviderError {
        let probe = "diagnostics probe".to_string();
        match self {
            ErrorArg::Timeout => ProviderError::Timeout(probe),
            ErrorArg::Network => ProviderError::Network(probe),
            ErrorArg::Parse => ProviderError::Parse(probe),
            ErrorArg::Unsupported => ProviderError::UnsupportedFile(probe),
            ErrorArg::InvalidJson => ProviderError::InvalidJson(probe),
            ErrorArg::Context => ProviderError::ContextTooLarge { chars: 0, limit: 0 },
            ErrorArg::Storage => ProviderError::Storage(probe),
            ErrorArg::Other => ProviderError::Other(probe),
        }
    }
}

pub struct ClassifyArgs {
    pub kind: KindArg,
    pub status: Option<u16>,
    pub error: Option<ErrorArg>,
}

#[derive(Debug, Serialize)]
struct ClassifyReport {
    kind: &'static str,
    error: String,
    code: ErrorCode,
    retryable: bool,
    friendly_message: &'static str,
}

pub fn run(args: ClassifyArgs) -> Result<bool> {
    let kind = CallKind::from(args.kind);
    let error = match (args.status, args.error) {
        (Some(status), _) => ProviderError::http(status),
        (None, Some(error)) => error.to_error(),
        (None, None) => anyhow::bail!("Either --status or --error is required"),
    };
    let code = classify(&error, kind);
    let report = ClassifyReport {
        kind: match args.kind {
            KindArg::Ocr => "ocr",
            KindArg::Llm => "llm",
        },
        error: error.to_string(),
        code,
        retryable: is_retryable(&error, kind),
        friendly_message: code.friendly_message(),
    };
    print_json(&report)?;
    Ok(true)
}
