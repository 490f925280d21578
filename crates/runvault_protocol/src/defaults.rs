//! Canonical default values shared across runvault crates.

/// Restore safety limits.
pub const DEFAULT_RESTORE_MAX_ENTRIES: usize = 1000;
pub const DEFAULT_RESTORE_MAX_TOTAL_UNCOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_RESTORE_MAX_SINGLE_FILE_BYTES: u64 = 128 * 1024 * 1024;
pub const DEFAULT_RESTORE_MAX_COMPRESSION_RATIO: f64 = 200.0;

pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;

pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 400_000;

pub const RUN_MANIFEST_FILE: &str = "run.json";
pub const BUNDLE_MANIFEST_FILE: &str = "bundle_manifest.json";
pub const BUNDLE_MANIFEST_VERSION: u32 = 1;
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha256";
pub const RUN_LOG_PATH: &str = "logs/run.log";
pub const BUNDLE_SUFFIX: &str = "_bundle.zip";

/// Top-level directories a run root may contain besides `run.json`.
pub const LAYOUT_ROOTS: [&str; 3] = ["logs", "documents", "llm"];

pub const CANCELLED_BY_USER_MESSAGE: &str = "Cancelled by user";
