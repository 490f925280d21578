//! Path-safe artifact tree.
//!
//! Every run owns `<data_root>/sessions/<session_id>/runs/<run_id>`. Reads,
//! writes and deletes go through [`RunRoot`], which resolves each relative
//! path through the data root's [`ContainedRoot`]. A symlink anywhere between
//! the data root and the target is rejected, on every call.

mod mime;

pub use mime::guess_mime;

use runvault_protocol::ErrorCode;
use runvault_security::{normalize_relative, validate_identifier, ContainedRoot, PathGuardError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

const SESSIONS_DIR: &str = "sessions";
const RUNS_DIR: &str = "runs";
const STAGING_DIR: &str = ".staging";
const BACKUPS_DIR: &str = "backups";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Path(#[from] PathGuardError),

    #[error("Run root {path} does not match layout sessions/{session_id}/runs/{run_id}")]
    Layout {
        path: String,
        session_id: String,
        run_id: String,
    },

    #[error("Artifacts root not found: {0}")]
    MissingRoot(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path is not a file: {0}")]
    NotAFile(String),

    #[error("Invalid JSON in {path}: {message}")]
    InvalidJson { path: String, message: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::StorageError
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A file found under a run root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    /// `/`-separated, relative to the run root
    pub relative_path: String,
    pub size_bytes: u64,
}

/// Immediate child of a directory in a run tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub is_dir: bool,
}

/// The configured data root.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    guard: ContainedRoot,
}

impl ArtifactStore {
    /// Open (creating if needed) the data root.
    pub fn open(data_root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(data_root).map_err(|e| StoreError::io(data_root, e))?;
        let guard = ContainedRoot::new(data_root)?;
        debug!("Artifact store rooted at {}", guard.root().display());
        Ok(Self { guard })
    }

    /// Canonical data root.
    pub fn data_root(&self) -> &Path {
        self.guard.root()
    }

    /// Default destination for backups taken before deletion.
    pub fn backups_dir(&self) -> PathBuf {
        self.guard.root().join(BACKUPS_DIR)
    }

    /// Handle on a run root. The directory does not have to exist.
    pub fn run_root(&self, session_id: &str, run_id: &str) -> StoreResult<RunRoot> {
        validate_identifier(session_id)?;
        validate_identifier(run_id)?;
        let relative = format!("{SESSIONS_DIR}/{session_id}/{RUNS_DIR}/{run_id}");
        let path = self.guard.resolve(&relative)?;
        Ok(RunRoot {
            guard: self.guard.clone(),
            relative,
            path,
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
        })
    }

    /// Create a run root with its `logs/` directory.
    pub fn create_run_root(&self, session_id: &str, run_id: &str) -> StoreResult<RunRoot> {
        let root = self.run_root(session_id, run_id)?;
        root.ensure_dir("logs")?;
        info!("Created run root {}", root.path().display());
        Ok(root)
    }

    /// Check a recorded `artifacts_root_path` against the expected layout.
    ///
    /// The path must sit under the data root with no symlinked component and
    /// be exactly `sessions/<session_id>/runs/<run_id>`.
    pub fn recorded_run_root(
        &self,
        recorded: &Path,
        session_id: &str,
        run_id: &str,
    ) -> StoreResult<RunRoot> {
        let root = self.run_root(session_id, run_id)?;
        self.guard.check_absolute(recorded)?;
        if recorded != root.path() {
            return Err(StoreError::Layout {
                path: recorded.display().to_string(),
                session_id: session_id.to_string(),
                run_id: run_id.to_string(),
            });
        }
        Ok(root)
    }

    /// Fresh staging directory under the data root, removed on drop.
    ///
    /// Living on the same filesystem as the run roots lets a staged tree be
    /// renamed into place.
    pub fn staging_dir(&self) -> StoreResult<tempfile::TempDir> {
        let base = self.guard.resolve(STAGING_DIR)?;
        fs::create_dir_all(&base).map_err(|e| StoreError::io(&base, e))?;
        tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(&base)
            .map_err(|e| StoreError::io(&base, e))
    }
}

/// One run's artifact tree.
#[derive(Debug, Clone)]
pub struct RunRoot {
    guard: ContainedRoot,
    relative: String,
    path: PathBuf,
    session_id: String,
    run_id: String,
}

impl RunRoot {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).is_ok()
    }

    /// Per-run advisory lock file, next to the run root.
    pub fn lock_path(&self) -> PathBuf {
        runvault_db::lock_path_for(&self.path)
    }

    /// Absolute path for a run-relative path.
    pub fn resolve(&self, relative: &str) -> StoreResult<PathBuf> {
        let relative = normalize_relative(relative)?;
        Ok(self.guard.resolve(&format!("{}/{}", self.relative, relative))?)
    }

    fn resolve_root(&self) -> StoreResult<PathBuf> {
        Ok(self.guard.resolve(&self.relative)?)
    }

    pub fn is_file(&self, relative: &str) -> bool {
        self.resolve(relative)
            .ok()
            .and_then(|path| fs::symlink_metadata(path).ok())
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    pub fn ensure_dir(&self, relative: &str) -> StoreResult<PathBuf> {
        let path = self.resolve(relative)?;
        fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    fn prepare(&self, relative: &str) -> StoreResult<PathBuf> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        Ok(path)
    }

    pub fn write_bytes(&self, relative: &str, data: &[u8]) -> StoreResult<PathBuf> {
        let path = self.prepare(relative)?;
        fs::write(&path, data).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }

    pub fn write_text(&self, relative: &str, text: &str) -> StoreResult<PathBuf> {
        self.write_bytes(relative, text.as_bytes())
    }

    /// Pretty-printed JSON.
    pub fn write_json<T: Serialize + ?Sized>(&self, relative: &str, value: &T) -> StoreResult<PathBuf> {
        let payload = serde_json::to_vec_pretty(value).map_err(|e| StoreError::InvalidJson {
            path: relative.to_string(),
            message: e.to_string(),
        })?;
        self.write_bytes(relative, &payload)
    }

    /// Write through a temp file in the same directory, then rename.
    pub fn write_atomic(&self, relative: &str, data: &[u8]) -> StoreResult<PathBuf> {
        let path = self.prepare(relative)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::NotAFile(path.display().to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
        tmp.write_all(data).map_err(|e| StoreError::io(&path, e))?;
        tmp.as_file().sync_all().map_err(|e| StoreError::io(&path, e))?;
        tmp.persist(&path).map_err(|e| StoreError::io(&path, e.error))?;
        Ok(path)
    }

    pub fn append_text(&self, relative: &str, text: &str) -> StoreResult<()> {
        let path = self.prepare(relative)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(text.as_bytes())
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Copy an external file into the tree. Returns bytes copied.
    pub fn copy_in(&self, relative: &str, source: &Path) -> StoreResult<u64> {
        let path = self.prepare(relative)?;
        fs::copy(source, &path).map_err(|e| StoreError::io(source, e))
    }

    /// Open an existing regular file for reading.
    pub fn open_file(&self, relative: &str) -> StoreResult<File> {
        let path = self.resolve(relative)?;
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_file() => File::open(&path).map_err(|e| StoreError::io(&path, e)),
            Ok(_) => Err(StoreError::NotAFile(path.display().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn read_bytes(&self, relative: &str) -> StoreResult<Vec<u8>> {
        let mut file = self.open_file(relative)?;
        let mut buf = Vec::new();
        io::Read::read_to_end(&mut file, &mut buf).map_err(|e| StoreError::Io {
            path: relative.to_string(),
            source: e,
        })?;
        Ok(buf)
    }

    pub fn read_text(&self, relative: &str) -> StoreResult<String> {
        let bytes = self.read_bytes(relative)?;
        String::from_utf8(bytes).map_err(|e| StoreError::Io {
            path: relative.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })
    }

    pub fn read_json<T: DeserializeOwned>(&self, relative: &str) -> StoreResult<T> {
        let bytes = self.read_bytes(relative)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::InvalidJson {
            path: relative.to_string(),
            message: e.to_string(),
        })
    }

    /// Every regular file under the root, sorted by relative path.
    ///
    /// Fails on the first symlink found anywhere in the tree.
    pub fn list_files(&self) -> StoreResult<Vec<ArtifactFile>> {
        let root = self.resolve_root()?;
        match fs::symlink_metadata(&root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StoreError::MissingRoot(root.display().to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::MissingRoot(root.display().to_string()))
            }
            Err(e) => return Err(StoreError::io(&root, e)),
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                StoreError::io(&path, io::Error::from(e))
            })?;
            if entry.file_type().is_symlink() {
                return Err(PathGuardError::Symlink {
                    path: entry.path().display().to_string(),
                }
                .into());
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let relative_path = relative_string(&root, entry.path())?;
            let size_bytes = entry
                .metadata()
                .map_err(|e| StoreError::io(entry.path(), io::Error::from(e)))?
                .len();
            files.push(ArtifactFile {
                relative_path,
                size_bytes,
            });
        }
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(files)
    }

    /// Children of a directory inside the run, sorted by name. Missing
    /// directories yield an empty list.
    pub fn list_children(&self, relative_dir: &str) -> StoreResult<Vec<ChildEntry>> {
        let dir = self.resolve(relative_dir)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let file_type = entry.file_type().map_err(|e| StoreError::io(&entry.path(), e))?;
            if file_type.is_symlink() {
                return Err(PathGuardError::Symlink {
                    path: entry.path().display().to_string(),
                }
                .into());
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            children.push(ChildEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Symlink scan of the whole tree. Returns the number of files.
    pub fn verify_tree(&self) -> StoreResult<usize> {
        self.guard.check_absolute(&self.path)?;
        Ok(self.list_files()?.len())
    }

    /// Remove the tree after a full safety scan. Returns whether it existed.
    pub fn delete_tree(&self) -> StoreResult<bool> {
        if !self.exists() {
            return Ok(false);
        }
        let files = self.verify_tree()?;
        fs::remove_dir_all(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        info!("Deleted run tree {} ({} files)", self.path.display(), files);
        Ok(true)
    }
}

fn relative_string(root: &Path, path: &Path) -> StoreResult<String> {
    let rest = path.strip_prefix(root).map_err(|_| PathGuardError::OutsideRoot {
        path: path.display().to_string(),
        root: root.display().to_string(),
    })?;
    let mut parts = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(PathGuardError::InvalidComponent {
                        path: path.display().to_string(),
                        reason: "not valid UTF-8".to_string(),
                    }
                    .into())
                }
            },
            _ => {
                return Err(PathGuardError::Traversal {
                    path: path.display().to_string(),
                }
                .into())
            }
        }
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, ArtifactStore) {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(&temp.path().join("data")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_run_root_layout() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        assert!(root.path().ends_with("sessions/s1/runs/r1"));
        assert!(root.path().join("logs").is_dir());
        assert!(root.lock_path().ends_with("sessions/s1/runs/r1.lock"));
    }

    #[test]
    fn test_run_root_rejects_bad_identifiers() {
        let (_temp, store) = store();
        assert!(store.run_root("..", "r1").is_err());
        assert!(store.run_root("s1", "a/b").is_err());
        assert!(store.run_root("s1", "").is_err());
    }

    #[test]
    fn test_write_read_and_list() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        root.write_json("run.json", &json!({"run_id": "r1"})).unwrap();
        root.append_text("logs/run.log", "one\n").unwrap();
        root.append_text("logs/run.log", "two\n").unwrap();
        root.write_text("documents/0000001/ocr/pages/0001.md", "# Page").unwrap();

        assert_eq!(root.read_text("logs/run.log").unwrap(), "one\ntwo\n");
        let value: serde_json::Value = root.read_json("run.json").unwrap();
        assert_eq!(value["run_id"], "r1");

        let files: Vec<String> = root
            .list_files()
            .unwrap()
            .into_iter()
            .map(|f| f.relative_path)
            .collect();
        assert_eq!(
            files,
            vec!["documents/0000001/ocr/pages/0001.md", "logs/run.log", "run.json"]
        );
    }

    #[test]
    fn test_read_errors_are_typed() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        assert!(matches!(root.read_text("llm/response_raw.txt"), Err(StoreError::NotFound(_))));
        assert!(matches!(root.read_text("logs"), Err(StoreError::NotAFile(_))));
        root.write_text("llm/response_parsed.json", "{not json").unwrap();
        assert!(matches!(
            root.read_json::<serde_json::Value>("llm/response_parsed.json"),
            Err(StoreError::InvalidJson { .. })
        ));
    }

    #[test]
    fn test_traversal_rejected() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        assert!(matches!(
            root.write_text("../r2/run.json", "x"),
            Err(StoreError::Path(PathGuardError::Traversal { .. }))
        ));
        assert!(root.resolve("/etc/passwd").is_err());
    }

    #[test]
    fn test_write_atomic_replaces() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        root.write_atomic("run.json", b"{\"v\":1}").unwrap();
        root.write_atomic("run.json", b"{\"v\":2}").unwrap();
        assert_eq!(root.read_text("run.json").unwrap(), "{\"v\":2}");
        assert_eq!(root.list_files().unwrap().len(), 1);
    }

    #[test]
    fn test_recorded_root_must_match_layout() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        let ok = store.recorded_run_root(root.path(), "s1", "r1").unwrap();
        assert_eq!(ok.path(), root.path());

        let other = store.create_run_root("s1", "r2").unwrap();
        assert!(matches!(
            store.recorded_run_root(other.path(), "s1", "r1"),
            Err(StoreError::Layout { .. })
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_rejected_everywhere() {
        let (temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(&outside, root.path().join("documents")).unwrap();

        assert!(matches!(
            root.read_text("documents/secret.txt"),
            Err(StoreError::Path(PathGuardError::Symlink { .. }))
        ));
        assert!(matches!(
            root.list_files(),
            Err(StoreError::Path(PathGuardError::Symlink { .. }))
        ));
        assert!(root.delete_tree().is_err());
        assert!(outside.join("secret.txt").exists());
    }

    #[test]
    fn test_delete_tree() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        root.write_text("run.json", "{}").unwrap();
        assert!(root.delete_tree().unwrap());
        assert!(!root.exists());
        assert!(!root.delete_tree().unwrap());
    }

    #[test]
    fn test_list_children() {
        let (_temp, store) = store();
        let root = store.create_run_root("s1", "r1").unwrap();
        root.write_text("documents/0000002/original/b.pdf", "b").unwrap();
        root.write_text("documents/0000001/original/a.pdf", "a").unwrap();
        let children = root.list_children("documents").unwrap();
        assert_eq!(
            children.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["0000001", "0000002"]
        );
        assert!(children.iter().all(|c| c.is_dir));
        assert!(root.list_children("llm").unwrap().is_empty());
    }
}
