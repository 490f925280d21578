//! Bundle manifest: per-file size and SHA-256 over a run tree, optionally
//! signed with HMAC-SHA256 over a canonical JSON body.

use crate::artifacts::{RunRoot, StoreError};
use runvault_protocol::defaults::{BUNDLE_MANIFEST_FILE, BUNDLE_MANIFEST_VERSION, SIGNATURE_ALGORITHM};
use runvault_protocol::ErrorCode;
use runvault_security::{
    hmac_sha256_hex, is_sha256_hex, sha256_reader, validate_relative, verify_hmac_sha256_hex,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSignature {
    pub algorithm: String,
    pub hmac_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: u32,
    pub run_id: String,
    pub session_id: String,
    pub files: Vec<ManifestEntry>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<BundleSignature>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Failed to parse bundle_manifest.json: {0}")]
    InvalidJson(String),

    #[error("bundle_manifest.json root must be a JSON object")]
    NotAnObject,

    #[error("Unsupported bundle_manifest.json version: {0}")]
    UnsupportedVersion(String),

    #[error("bundle_manifest.json has a missing or invalid '{0}' field")]
    InvalidField(&'static str),

    #[error("bundle_manifest.json files[{index}] is invalid: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("bundle_manifest.json must not include itself in files[]")]
    SelfReference,

    #[error("bundle_manifest.json has duplicate path: {0}")]
    DuplicatePath(String),
}

impl ManifestError {
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::RestoreInvalidArchive
    }
}

/// Parsed manifest plus the raw JSON it came from. Signatures are checked
/// against the raw value so unknown fields stay covered by the HMAC.
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub manifest: BundleManifest,
    pub raw: Value,
}

/// Outcome of looking at a manifest's signature section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    Unsigned,
    Verified,
    MissingKey,
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    #[default]
    NotChecked,
    Verified,
    Failed,
    LegacyMissingManifest,
}

impl ManifestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestStatus::NotChecked => "not_checked",
            ManifestStatus::Verified => "verified",
            ManifestStatus::Failed => "failed",
            ManifestStatus::LegacyMissingManifest => "legacy_missing_manifest",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    #[default]
    NotChecked,
    Verified,
    Unsigned,
    SignedUnverifiedMissingKey,
    InvalidIgnored,
    Failed,
    MissingManifestUnsignedLegacy,
}

impl SignatureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureStatus::NotChecked => "not_checked",
            SignatureStatus::Verified => "verified",
            SignatureStatus::Unsigned => "unsigned",
            SignatureStatus::SignedUnverifiedMissingKey => "signed_unverified_missing_key",
            SignatureStatus::InvalidIgnored => "invalid_ignored",
            SignatureStatus::Failed => "failed",
            SignatureStatus::MissingManifestUnsignedLegacy => "missing_manifest_unsigned_legacy",
        }
    }
}

impl BundleManifest {
    /// Hash every file under the run root, sorted by relative path.
    ///
    /// A stale `bundle_manifest.json` in the tree is never listed.
    pub fn build(root: &RunRoot) -> Result<Self, StoreError> {
        let mut files = Vec::new();
        for file in root.list_files()? {
            if file.relative_path == BUNDLE_MANIFEST_FILE {
                continue;
            }
            let reader = root.open_file(&file.relative_path)?;
            let (sha256, size_bytes) = sha256_reader(reader).map_err(|e| StoreError::Io {
                path: file.relative_path.clone(),
                source: e,
            })?;
            files.push(ManifestEntry {
                relative_path: file.relative_path,
                size_bytes,
                sha256,
            });
        }
        Ok(Self {
            version: BUNDLE_MANIFEST_VERSION,
            run_id: root.run_id().to_string(),
            session_id: root.session_id().to_string(),
            files,
            signature: None,
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    /// Canonical body: no signature, sorted keys, compact, UTF-8.
    pub fn canonical_body(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        Ok(canonical_json(&value))
    }

    /// Attach an HMAC-SHA256 over the canonical body, replacing any previous signature.
    pub fn sign(&mut self, key: &str) -> Result<(), serde_json::Error> {
        let digest = hmac_sha256_hex(key.as_bytes(), self.canonical_body()?.as_bytes());
        self.signature = Some(BundleSignature {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            hmac_sha256: digest,
        });
        Ok(())
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse and validate a manifest document.
    pub fn parse(bytes: &[u8]) -> Result<ParsedManifest, ManifestError> {
        let raw: Value =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::InvalidJson(e.to_string()))?;
        let object = raw.as_object().ok_or(ManifestError::NotAnObject)?;

        match object.get("version") {
            Some(v) if v.as_u64() == Some(u64::from(BUNDLE_MANIFEST_VERSION)) => {}
            Some(v) => return Err(ManifestError::UnsupportedVersion(v.to_string())),
            None => return Err(ManifestError::InvalidField("version")),
        }
        let run_id = object
            .get("run_id")
            .and_then(Value::as_str)
            .ok_or(ManifestError::InvalidField("run_id"))?
            .to_string();
        let session_id = object
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or(ManifestError::InvalidField("session_id"))?
            .to_string();
        let entries = object
            .get("files")
            .and_then(Value::as_array)
            .ok_or(ManifestError::InvalidField("files"))?;

        let mut seen = BTreeSet::new();
        let mut files = Vec::with_capacity(entries.len());
        for (index, item) in entries.iter().enumerate() {
            let entry = parse_entry(index, item)?;
            if !seen.insert(entry.relative_path.clone()) {
                return Err(ManifestError::DuplicatePath(entry.relative_path));
            }
            files.push(entry);
        }

        let signature = match object.get("signature") {
            None | Some(Value::Null) => None,
            Some(value) => serde_json::from_value(value.clone()).ok(),
        };

        Ok(ParsedManifest {
            manifest: BundleManifest {
                version: BUNDLE_MANIFEST_VERSION,
                run_id,
                session_id,
                files,
                signature,
            },
            raw,
        })
    }
}

fn parse_entry(index: usize, item: &Value) -> Result<ManifestEntry, ManifestError> {
    let invalid = |reason: &str| ManifestError::InvalidEntry {
        index,
        reason: reason.to_string(),
    };
    let object = item.as_object().ok_or_else(|| invalid("not an object"))?;

    let relative_path = object
        .get("relative_path")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if relative_path.is_empty() {
        return Err(invalid("empty relative_path"));
    }
    if relative_path == BUNDLE_MANIFEST_FILE {
        return Err(ManifestError::SelfReference);
    }
    validate_relative(relative_path).map_err(|e| invalid(&e.to_string()))?;

    let size_bytes = object
        .get("size_bytes")
        .and_then(Value::as_u64)
        .ok_or_else(|| invalid(&format!("invalid size_bytes for '{}'", relative_path)))?;

    let sha256 = object.get("sha256").and_then(Value::as_str).unwrap_or_default();
    if !is_sha256_hex(sha256) {
        return Err(invalid(&format!("invalid sha256 for '{}'", relative_path)));
    }

    Ok(ManifestEntry {
        relative_path: relative_path.to_string(),
        size_bytes,
        sha256: sha256.to_string(),
    })
}

/// Inspect the signature section of a raw manifest.
pub fn check_signature(raw: &Value, key: Option<&str>) -> SignatureCheck {
    let signature = match raw.get("signature") {
        None | Some(Value::Null) => return SignatureCheck::Unsigned,
        Some(value) => value,
    };
    let Some(signature) = signature.as_object() else {
        return SignatureCheck::Invalid("signature must be a JSON object".to_string());
    };

    let algorithm = signature
        .get("algorithm")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if algorithm != SIGNATURE_ALGORITHM {
        let shown = if algorithm.is_empty() { "<empty>" } else { algorithm.as_str() };
        return SignatureCheck::Invalid(format!("unsupported signature algorithm: {}", shown));
    }

    let provided = signature
        .get("hmac_sha256")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if !is_sha256_hex(&provided) {
        return SignatureCheck::Invalid("signature value has invalid format".to_string());
    }

    let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
        return SignatureCheck::MissingKey;
    };
    let body = canonical_json(raw);
    if verify_hmac_sha256_hex(key.as_bytes(), body.as_bytes(), &provided) {
        SignatureCheck::Verified
    } else {
        SignatureCheck::Invalid("signature mismatch".to_string())
    }
}

/// Compact JSON with sorted keys. A top-level `signature` key is dropped.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Object(map) => {
            let mut body = map.clone();
            body.remove("signature");
            write_value(&mut out, &Value::Object(body));
        }
        other => write_value(&mut out, other),
    }
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, &Value::String(key.clone()));
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        // Scalars: serde_json's compact form already matches (non-ASCII unescaped).
        scalar => out.push_str(&scalar.to_string()),
    }
}
