//! Shared vocabulary for runvault.
//!
//! Everything that more than one crate needs to agree on lives here:
//! - **Error taxonomy**: the fixed `ErrorCode` set, tagged `ProviderError`
//!   variants and the classifier that maps one onto the other
//! - **Retry policy**: the single decision function consulted before any
//!   provider call is repeated
//! - **Run vocabulary**: run status, stage state machine, document status
//! - **Configuration**: defaults, environment resolution and home paths
//!
//! Nothing in this crate touches the filesystem except `paths` reading env vars.

pub mod config;
pub mod defaults;
pub mod error_code;
pub mod paths;
pub mod retry;
pub mod types;

pub use config::{ConfigError, RestoreLimits, RunvaultConfig};
pub use error_code::{classify, is_retryable, is_retryable_status, CallKind, ErrorCode, ProviderError};
pub use retry::{run_with_retry, RetryPolicy};
pub use types::{doc_id_for, ArtifactKind, OcrStatus, RunStage, RunStatus, StageName, StageStatus};
