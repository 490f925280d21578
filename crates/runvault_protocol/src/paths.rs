use std::path::PathBuf;

/// Resolve the runvault home directory.
///
/// Priority:
/// 1) RUNVAULT_HOME
/// 2) ~/.runvault
/// 3) ./.runvault
pub fn runvault_home() -> PathBuf {
    home_from(|key| std::env::var(key).ok())
}

/// Same resolution as [`runvault_home`] with an injectable env lookup.
pub fn home_from<F>(lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(override_path) = lookup("RUNVAULT_HOME").filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(override_path);
    }
    match dirs::home_dir() {
        Some(home) => home.join(".runvault"),
        None => PathBuf::from(".").join(".runvault"),
    }
}

/// Default data root: ~/.runvault/data
pub fn default_data_dir() -> PathBuf {
    runvault_home().join("data")
}

/// Default metadata store: ~/.runvault/runvault.sqlite3
pub fn default_db_path() -> PathBuf {
    runvault_home().join("runvault.sqlite3")
}

/// Default logs directory: ~/.runvault/logs
pub fn default_logs_dir() -> PathBuf {
    runvault_home().join("logs")
}
