//! Logging setup for the runvault binary.
//!
//! Library crates only emit `tracing` events; this crate installs the
//! subscriber. Events go to a size-capped log file set under the logs
//! directory and, filtered, to stderr.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "runvault=info,runvault_db=info";
const KEEP_LOG_FILES: usize = 5;
const LOG_FILE_LIMIT_BYTES: u64 = 10 * 1024 * 1024;

pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warnings only
    pub verbose: bool,
    /// Overrides the default `~/.runvault/logs`
    pub log_dir: Option<PathBuf>,
}

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
///
/// Returns the path of the active log file.
pub fn init_logging(config: LogConfig<'_>) -> Result<PathBuf> {
    let log_dir = config
        .log_dir
        .unwrap_or_else(runvault_protocol::paths::default_logs_dir);
    let set = LogFileSet::new(&log_dir, config.app_name, KEEP_LOG_FILES);
    let writer = LogWriter::open(set, LOG_FILE_LIMIT_BYTES)
        .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;
    let active = writer.active_path();

    let console_filter = if config.verbose {
        filter_from_env()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(filter_from_env()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(active)
}

/// Naming for `<app>.log` and its numbered predecessors `<app>.log.N`.
#[derive(Debug, Clone)]
struct LogFileSet {
    dir: PathBuf,
    stem: String,
    keep: usize,
}

impl LogFileSet {
    fn new(dir: &Path, app_name: &str, keep: usize) -> Self {
        let stem: String = app_name
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        Self {
            dir: dir.to_path_buf(),
            stem,
            keep: keep.max(1),
        }
    }

    fn active(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    fn numbered(&self, n: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.stem, n))
    }

    /// Shift `<app>.log` to `.1`, `.1` to `.2` and so on, dropping the oldest.
    /// With `keep == 1` the active file is truncated instead.
    fn shift(&self) -> io::Result<()> {
        let oldest = self.keep - 1;
        if oldest == 0 {
            return File::create(self.active()).map(drop);
        }
        remove_if_present(&self.numbered(oldest))?;
        for n in (1..oldest).rev() {
            rename_if_present(&self.numbered(n), &self.numbered(n + 1))?;
        }
        rename_if_present(&self.active(), &self.numbered(1))
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Open file plus the byte count written to it so far.
#[derive(Debug)]
struct ActiveLog {
    set: LogFileSet,
    limit: u64,
    file: File,
    written: u64,
}

impl ActiveLog {
    fn open(set: LogFileSet, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(&set.dir)?;
        let (file, written) = open_append(&set.active())?;
        let mut log = Self {
            set,
            limit,
            file,
            written,
        };
        if log.written > log.limit {
            log.roll()?;
        }
        Ok(log)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.set.shift()?;
        let (file, written) = open_append(&self.set.active())?;
        self.file = file;
        self.written = written;
        Ok(())
    }

    fn append(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

fn open_append(path: &Path) -> io::Result<(File, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    Ok((file, len))
}

/// Cloneable `MakeWriter` over one shared [`ActiveLog`].
#[derive(Debug, Clone)]
struct LogWriter {
    shared: Arc<Mutex<ActiveLog>>,
}

impl LogWriter {
    fn open(set: LogFileSet, limit: u64) -> io::Result<Self> {
        Ok(Self {
            shared: Arc::new(Mutex::new(ActiveLog::open(set, limit)?)),
        })
    }

    fn active_path(&self) -> PathBuf {
        match self.shared.lock() {
            Ok(log) => log.set.active(),
            Err(poisoned) => poisoned.into_inner().set.active(),
        }
    }

    fn locked(&self) -> io::Result<MutexGuard<'_, ActiveLog>> {
        self.shared
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))
    }
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.locked()?.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.locked()?.file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
