//! runvault security primitives
//!
//! Provides:
//! - **Signing**: SHA-256 content digests and HMAC-SHA256 bundle signatures
//! - **Path guard**: relative-path validation and symlink-free containment

pub mod path_guard;
pub mod signing;

pub use path_guard::{
    normalize_relative, validate_identifier, validate_relative, ContainedRoot, PathGuardError,
};
pub use signing::{hmac_sha256_hex, is_sha256_hex, sha256, sha256_reader, verify_hmac_sha256_hex};
