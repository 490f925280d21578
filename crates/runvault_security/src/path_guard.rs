//! Path Guard - Validates Artifact Paths
//!
//! Prevents path traversal and symlink escapes for every read, write and
//! delete against a run's artifact tree.
//!
//! # Security Model
//!
//! - Relative paths are validated lexically before touching the filesystem
//! - ".." components are explicitly denied, "." and empty components too
//! - Every existing component between the root and the target is inspected
//!   with `symlink_metadata`; a symlink anywhere in the chain is rejected
//! - The root itself is canonicalized once at construction

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathGuardError {
    #[error("Path is empty")]
    Empty,

    #[error("Absolute paths are not allowed: {path}")]
    Absolute { path: String },

    #[error("Path traversal attempt: {path}")]
    Traversal { path: String },

    #[error("Invalid path component in '{path}': {reason}")]
    InvalidComponent { path: String, reason: String },

    #[error("Symlink in path chain: {path}")]
    Symlink { path: String },

    #[error("Path {path} is outside root {root}")]
    OutsideRoot { path: String, root: String },

    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Failed to inspect {path}: {message}")]
    Io { path: String, message: String },
}

impl PathGuardError {
    fn io(path: &Path, err: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Validate a `/`-separated relative path and return its components.
pub fn validate_relative(raw: &str) -> Result<Vec<&str>, PathGuardError> {
    if raw.is_empty() {
        return Err(PathGuardError::Empty);
    }
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(PathGuardError::Absolute {
            path: raw.to_string(),
        });
    }
    if raw.contains('\0') {
        return Err(PathGuardError::InvalidComponent {
            path: raw.to_string(),
            reason: "NUL byte".to_string(),
        });
    }
    if raw.contains('\\') {
        return Err(PathGuardError::InvalidComponent {
            path: raw.to_string(),
            reason: "backslash separator".to_string(),
        });
    }

    let parts: Vec<&str> = raw.split('/').collect();
    if parts[0].contains(':') {
        return Err(PathGuardError::Absolute {
            path: raw.to_string(),
        });
    }
    for part in &parts {
        match *part {
            ".." => {
                return Err(PathGuardError::Traversal {
                    path: raw.to_string(),
                })
            }
            "" | "." => {
                return Err(PathGuardError::InvalidComponent {
                    path: raw.to_string(),
                    reason: format!("'{}' component", part),
                })
            }
            _ => {}
        }
    }
    Ok(parts)
}

/// Validated relative path re-joined with `/`.
pub fn normalize_relative(raw: &str) -> Result<String, PathGuardError> {
    validate_relative(raw).map(|parts| parts.join("/"))
}

/// Session and run identifiers become directory names; they must be a
/// single normal component.
pub fn validate_identifier(value: &str) -> Result<(), PathGuardError> {
    let reason = if value.trim().is_empty() {
        Some("empty")
    } else if value == "." || value == ".." {
        Some("reserved name")
    } else if value.contains(['/', '\\', ':', '\0']) {
        Some("contains a path separator or reserved character")
    } else if value.len() > 255 {
        Some("longer than 255 bytes")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(PathGuardError::InvalidIdentifier {
            value: value.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// A canonical directory that resolved paths must stay under.
#[derive(Debug, Clone)]
pub struct ContainedRoot {
    root: PathBuf,
}

impl ContainedRoot {
    /// Canonicalize `root`, which must already exist.
    pub fn new(root: &Path) -> Result<Self, PathGuardError> {
        let root = root.canonicalize().map_err(|e| PathGuardError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path under the root, rejecting symlinks along the way.
    ///
    /// The target does not have to exist; checks stop at the first missing
    /// component since nothing deeper can be a link yet.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, PathGuardError> {
        let parts = validate_relative(relative)?;
        let mut current = self.root.clone();
        let mut probing = true;
        for part in parts {
            current.push(part);
            if probing {
                probing = Self::probe(&current)?;
            }
        }
        Ok(current)
    }

    /// Check an absolute path: it must sit under the root and every existing
    /// component below the root must be a real directory or file.
    pub fn check_absolute(&self, path: &Path) -> Result<(), PathGuardError> {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(PathGuardError::Traversal {
                path: path.display().to_string(),
            });
        }
        let rest = path
            .strip_prefix(&self.root)
            .map_err(|_| PathGuardError::OutsideRoot {
                path: path.display().to_string(),
                root: self.root.display().to_string(),
            })?;
        let mut current = self.root.clone();
        for component in rest.components() {
            match component {
                Component::Normal(part) => current.push(part),
                _ => {
                    return Err(PathGuardError::Traversal {
                        path: path.display().to_string(),
                    })
                }
            }
            if !Self::probe(&current)? {
                break;
            }
        }
        Ok(())
    }

    /// Whether `path` lies strictly below the root (lexical check).
    pub fn contains(&self, path: &Path) -> bool {
        path != self.root && path.starts_with(&self.root)
    }

    /// Returns whether the path exists; errors if it is a symlink.
    fn probe(path: &Path) -> Result<bool, PathGuardError> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!("Rejected symlink in artifact path: {}", path.display());
                Err(PathGuardError::Symlink {
                    path: path.display().to_string(),
                })
            }
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PathGuardError::io(path, e)),
        }
    }
}
