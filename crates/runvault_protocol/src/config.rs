//! Environment-driven configuration.
//!
//! Each setting is read from `RUNVAULT_<NAME>` first and, for the restore
//! settings, from the unprefixed alias (`RESTORE_MAX_ENTRIES`, ...) second.

use crate::defaults::*;
use crate::paths;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Anti-zip-bomb ceilings enforced before any restore extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestoreLimits {
    pub max_entries: usize,
    pub max_total_uncompressed_bytes: u64,
    pub max_single_file_bytes: u64,
    pub max_compression_ratio: f64,
}

impl Default for RestoreLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_RESTORE_MAX_ENTRIES,
            max_total_uncompressed_bytes: DEFAULT_RESTORE_MAX_TOTAL_UNCOMPRESSED_BYTES,
            max_single_file_bytes: DEFAULT_RESTORE_MAX_SINGLE_FILE_BYTES,
            max_compression_ratio: DEFAULT_RESTORE_MAX_COMPRESSION_RATIO,
        }
    }
}

/// Canonical runtime configuration.
#[derive(Debug, Clone)]
pub struct RunvaultConfig {
    /// Root under which `sessions/<session_id>/runs/<run_id>` trees live
    pub data_dir: PathBuf,
    /// SQLite metadata store
    pub db_path: PathBuf,
    pub restore_limits: RestoreLimits,
    /// Default for restores that do not say otherwise
    pub require_signature: bool,
    /// Accept archives without a bundle manifest (with a warning)
    pub allow_legacy_archives: bool,
    /// Shared HMAC secret for bundle signatures
    pub signing_key: Option<String>,
    /// Bounded wait for per-run and single-flight locks
    pub lock_timeout: Duration,
    /// Timeout handed to every OCR/inference call
    pub provider_timeout: Duration,
    pub max_context_chars: usize,
}

impl Default for RunvaultConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::default_data_dir(),
            db_path: paths::default_db_path(),
            restore_limits: RestoreLimits::default(),
            require_signature: false,
            allow_legacy_archives: true,
            signing_key: None,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            provider_timeout: Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS),
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

impl RunvaultConfig {
    /// Configuration rooted at an explicit data directory, everything else default.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };
        let home = paths::home_from(&lookup);

        let data_dir = env
            .string("RUNVAULT_DATA_DIR", None)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("data"));
        let db_path = env
            .string("RUNVAULT_DB_PATH", None)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join("runvault.sqlite3"));

        let defaults = RestoreLimits::default();
        let restore_limits = RestoreLimits {
            max_entries: env
                .parse::<usize>("RUNVAULT_RESTORE_MAX_ENTRIES", Some("RESTORE_MAX_ENTRIES"))?
                .unwrap_or(defaults.max_entries),
            max_total_uncompressed_bytes: env
                .parse::<u64>(
                    "RUNVAULT_RESTORE_MAX_TOTAL_UNCOMPRESSED_BYTES",
                    Some("RESTORE_MAX_TOTAL_UNCOMPRESSED_BYTES"),
                )?
                .unwrap_or(defaults.max_total_uncompressed_bytes),
            max_single_file_bytes: env
                .parse::<u64>(
                    "RUNVAULT_RESTORE_MAX_SINGLE_FILE_BYTES",
                    Some("RESTORE_MAX_SINGLE_FILE_BYTES"),
                )?
                .unwrap_or(defaults.max_single_file_bytes),
            max_compression_ratio: env
                .parse::<f64>(
                    "RUNVAULT_RESTORE_MAX_COMPRESSION_RATIO",
                    Some("RESTORE_MAX_COMPRESSION_RATIO"),
                )?
                .unwrap_or(defaults.max_compression_ratio),
        };
        validate_limits(&restore_limits)?;

        let require_signature = env
            .flag("RUNVAULT_RESTORE_REQUIRE_SIGNATURE", Some("RESTORE_REQUIRE_SIGNATURE"))?
            .unwrap_or(false);
        let allow_legacy_archives = env
            .flag("RUNVAULT_RESTORE_ALLOW_LEGACY", None)?
            .unwrap_or(true);
        let signing_key = normalize_signing_key(
            env.string("RUNVAULT_BUNDLE_SIGNING_KEY", Some("BUNDLE_SIGNING_KEY")),
        );

        let lock_timeout = env
            .parse::<u64>("RUNVAULT_LOCK_TIMEOUT_SECS", None)?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS));
        let provider_timeout = env
            .parse::<u64>("RUNVAULT_PROVIDER_TIMEOUT_SECS", None)?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS));
        let max_context_chars = env
            .parse::<usize>("RUNVAULT_MAX_CONTEXT_CHARS", None)?
            .unwrap_or(DEFAULT_MAX_CONTEXT_CHARS);

        Ok(Self {
            data_dir,
            db_path,
            restore_limits,
            require_signature,
            allow_legacy_archives,
            signing_key,
            lock_timeout,
            provider_timeout,
            max_context_chars,
        })
    }
}

/// A key that is blank after trimming is treated as no key at all.
pub fn normalize_signing_key(raw: Option<String>) -> Option<String> {
    raw.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

fn validate_limits(limits: &RestoreLimits) -> Result<(), ConfigError> {
    if limits.max_entries < 1 {
        return Err(ConfigError::invalid(
            "RUNVAULT_RESTORE_MAX_ENTRIES",
            &limits.max_entries.to_string(),
            "must be at least 1",
        ));
    }
    if limits.max_total_uncompressed_bytes < 1 {
        return Err(ConfigError::invalid(
            "RUNVAULT_RESTORE_MAX_TOTAL_UNCOMPRESSED_BYTES",
            "0",
            "must be at least 1",
        ));
    }
    if limits.max_single_file_bytes < 1 {
        return Err(ConfigError::invalid(
            "RUNVAULT_RESTORE_MAX_SINGLE_FILE_BYTES",
            "0",
            "must be at least 1",
        ));
    }
    if !limits.max_compression_ratio.is_finite() || limits.max_compression_ratio < 1.0 {
        return Err(ConfigError::invalid(
            "RUNVAULT_RESTORE_MAX_COMPRESSION_RATIO",
            &limits.max_compression_ratio.to_string(),
            "must be a finite number >= 1.0",
        ));
    }
    Ok(())
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> EnvReader<'a, F> {
    fn raw(&self, key: &str, alias: Option<&str>) -> Option<(String, String)> {
        let primary = (self.lookup)(key).map(|v| (key.to_string(), v));
        primary.or_else(|| alias.and_then(|a| (self.lookup)(a).map(|v| (a.to_string(), v))))
    }

    fn string(&self, key: &str, alias: Option<&str>) -> Option<String> {
        self.raw(key, alias)
            .map(|(_, v)| v)
            .filter(|v| !v.trim().is_empty())
    }

    fn parse<T: std::str::FromStr>(
        &self,
        key: &str,
        alias: Option<&str>,
    ) -> Result<Option<T>, ConfigError> {
        match self.raw(key, alias) {
            None => Ok(None),
            Some((_, value)) if value.trim().is_empty() => Ok(None),
            Some((used, value)) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::invalid(&used, &value, "not a valid number")),
        }
    }

    fn flag(&self, key: &str, alias: Option<&str>) -> Result<Option<bool>, ConfigError> {
        match self.raw(key, alias) {
            None => Ok(None),
            Some((used, value)) => match value.trim().to_lowercase().as_str() {
                "" => Ok(None),
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::invalid(&used, &value, "expected a boolean")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<RunvaultConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunvaultConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("RUNVAULT_HOME", "/tmp/rv")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/rv/data"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/rv/runvault.sqlite3"));
        assert_eq!(config.restore_limits, RestoreLimits::default());
        assert!(!config.require_signature);
        assert!(config.allow_legacy_archives);
        assert_eq!(config.signing_key, None);
    }

    #[test]
    fn test_prefixed_wins_over_alias() {
        let config = config_from(&[
            ("RUNVAULT_RESTORE_MAX_ENTRIES", "10"),
            ("RESTORE_MAX_ENTRIES", "20"),
            ("RESTORE_MAX_COMPRESSION_RATIO", "50.5"),
        ])
        .unwrap();
        assert_eq!(config.restore_limits.max_entries, 10);
        assert_eq!(config.restore_limits.max_compression_ratio, 50.5);
    }

    #[test]
    fn test_ratio_below_one_rejected() {
        let err = config_from(&[("RESTORE_MAX_COMPRESSION_RATIO", "0.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_entries_rejected() {
        assert!(config_from(&[("RESTORE_MAX_ENTRIES", "0")]).is_err());
        assert!(config_from(&[("RESTORE_MAX_ENTRIES", "lots")]).is_err());
    }

    #[test]
    fn test_signing_key_blank_is_none() {
        let config = config_from(&[("BUNDLE_SIGNING_KEY", "   ")]).unwrap();
        assert_eq!(config.signing_key, None);
        let config = config_from(&[("BUNDLE_SIGNING_KEY", " s3cret ")]).unwrap();
        assert_eq!(config.signing_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_flags() {
        let config = config_from(&[
            ("RESTORE_REQUIRE_SIGNATURE", "true"),
            ("RUNVAULT_RESTORE_ALLOW_LEGACY", "0"),
        ])
        .unwrap();
        assert!(config.require_signature);
        assert!(!config.allow_legacy_archives);
        assert!(config_from(&[("RESTORE_REQUIRE_SIGNATURE", "maybe")]).is_err());
    }
}
