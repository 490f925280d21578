//! Process-level advisory locking.
//!
//! Two operations must never touch the same run at once (orchestrate, export,
//! restore, delete). [`RunLock`] serializes them with an exclusive `fs2` lock
//! on a sibling lock file. [`single_flight`] wraps shared setup so that only
//! one process performs it while others wait, up to a deadline.
//!
//! Uses the `fs2` crate for cross-platform file locking (MSRV 1.75 compatible).

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a contended lock.
pub const DEFAULT_LOCK_POLL: Duration = Duration::from_millis(50);

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Locked by another process: {0}")]
    Locked(PathBuf),

    #[error("Timed out after {waited:?} waiting for lock: {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// A guard that holds an exclusive lock.
///
/// The lock is automatically released when the guard is dropped.
pub struct RunLock {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl RunLock {
    /// Get the path to the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Try to take the lock without waiting.
    pub fn try_acquire(lock_path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(lock_path)?;

        // Fully qualified: std::fs::File::try_lock_exclusive (1.89+) has a different error type
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("Acquired lock: {}", lock_path.display());
                let sidecar_path = write_lock_sidecar(lock_path, "exclusive");
                Ok(Self {
                    _file: file,
                    lock_path: lock_path.to_path_buf(),
                    sidecar_path,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(LockError::Locked(lock_path.to_path_buf()))
            }
            Err(e) => Err(LockError::AcquireFailed(e)),
        }
    }

    /// Take the lock, polling until `timeout` elapses.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> Result<Self, LockError> {
        Self::acquire_with_poll(lock_path, timeout, DEFAULT_LOCK_POLL)
    }

    pub fn acquire_with_poll(
        lock_path: &Path,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Self, LockError> {
        let started = Instant::now();
        loop {
            match Self::try_acquire(lock_path) {
                Ok(guard) => return Ok(guard),
                Err(LockError::Locked(_)) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        warn!("Gave up waiting for lock {} after {:?}", lock_path.display(), waited);
                        return Err(LockError::Timeout {
                            path: lock_path.to_path_buf(),
                            waited,
                        });
                    }
                    thread::sleep(poll.min(timeout.saturating_sub(waited)).max(Duration::from_millis(1)));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!("Releasing lock: {}", self.lock_path.display());
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("Failed to remove lock sidecar {}: {}", path.display(), e);
            }
        }
        // File is unlocked when closed (fs2 uses flock/LockFileEx)
    }
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Run `setup` while holding the lock at `lock_path`.
///
/// Concurrent callers wait at most `timeout` for the holder to finish, then
/// fail with [`LockError::Timeout`] instead of blocking forever.
pub fn single_flight<T, F>(lock_path: &Path, timeout: Duration, setup: F) -> Result<T, LockError>
where
    F: FnOnce() -> T,
{
    let guard = RunLock::acquire(lock_path, timeout)?;
    info!("Running single-flight setup under {}", guard.lock_path().display());
    let result = setup();
    drop(guard);
    Ok(result)
}

/// Get the lock file path for a target path.
///
/// Examples:
/// - `/data/runvault.sqlite3` → `/data/runvault.sqlite3.lock`
/// - `/data/sessions/s/runs/r` → `/data/sessions/s/runs/r.lock`
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut lock_path = target.to_path_buf();
    match lock_path.extension() {
        Some(ext) => {
            let new_ext = format!("{}.lock", ext.to_string_lossy());
            lock_path.set_extension(new_ext);
        }
        None => {
            lock_path.set_extension("lock");
        }
    }
    lock_path
}

#[derive(Serialize)]
struct LockSidecar {
    pid: u32,
    exe: Option<String>,
    timestamp: String,
    mode: &'static str,
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let ext = lock_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("lock");
    lock_path.with_extension(format!("{ext}.json"))
}

fn write_lock_sidecar(lock_path: &Path, mode: &'static str) -> Option<PathBuf> {
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
        mode,
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&sidecar)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!("Failed to write lock sidecar {}: {}", sidecar_path.display(), e);
            None
        }
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, LockError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(LockError::CreateFailed)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(LockError::CreateFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_for() {
        let lock = lock_path_for(Path::new("/data/runvault.sqlite3"));
        assert_eq!(lock, PathBuf::from("/data/runvault.sqlite3.lock"));

        let lock_no_ext = lock_path_for(Path::new("/data/sessions/s/runs/abc"));
        assert_eq!(lock_no_ext, PathBuf::from("/data/sessions/s/runs/abc.lock"));
    }

    #[test]
    fn test_try_acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("run.lock");

        let guard = RunLock::try_acquire(&lock_path).unwrap();
        assert!(guard.lock_path().exists());
        assert!(temp.path().join("run.lock.json").exists());
        drop(guard);
        assert!(!temp.path().join("run.lock.json").exists());

        let _again = RunLock::try_acquire(&lock_path).unwrap();
    }

    #[test]
    fn test_lock_contention() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("run.lock");

        let _guard = RunLock::try_acquire(&lock_path).unwrap();
        let result = RunLock::try_acquire(&lock_path);
        assert!(matches!(result, Err(LockError::Locked(_))));
    }

    #[test]
    fn test_acquire_times_out() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("setup.lock");

        let _guard = RunLock::try_acquire(&lock_path).unwrap();
        let started = Instant::now();
        let result = RunLock::acquire_with_poll(
            &lock_path,
            Duration::from_millis(120),
            Duration::from_millis(20),
        );
        assert!(matches!(result, Err(LockError::Timeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_single_flight_runs_setup_once_per_call() {
        let temp = TempDir::new().unwrap();
        let lock_path = temp.path().join("nested/setup.lock");
        let mut runs = 0;
        let value = single_flight(&lock_path, Duration::from_secs(1), || {
            runs += 1;
            42
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(runs, 1);
        assert!(lock_path.exists());
    }
}
