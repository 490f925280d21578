//! Metadata store for runvault.
//!
//! One SQLite file holds sessions, runs, documents, LLM outputs and artifact
//! references. The orchestrator writes to it as a run progresses; restore
//! reconciles a whole run in one transaction; retention deletes runs.
//!
//! # Usage
//!
//! ```rust,ignore
//! use runvault_db::{MetadataStore, NewRun};
//!
//! let store = MetadataStore::open("~/.runvault/runvault.sqlite3")?;
//! store.create_session("s1")?;
//! let run = store.create_run(&new_run)?;
//! store.update_run_status(&run.run_id, RunStatus::Completed, None, None)?;
//! ```

mod error;
pub mod lock;
mod schema;
mod types;

pub use error::{DbError, Result};
pub use lock::{lock_path_for, single_flight, LockError, RunLock};
pub use schema::SCHEMA_VERSION;
pub use types::*;

use chrono::{SecondsFormat, Utc};
use runvault_protocol::{ArtifactKind, OcrStatus, RunStatus};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RUN_COLUMNS: &str = "run_id, session_id, created_at, provider, model, prompt_name, \
     prompt_version, schema_version, status, error_code, error_message, timings_json, \
     usage_json, usage_normalized_json, cost_json, artifacts_root_path";

const DOCUMENT_COLUMNS: &str = "id, run_id, doc_id, original_filename, original_mime, \
     original_path, ocr_status, ocr_model, pages_count, ocr_artifacts_path, ocr_error";

/// Current UTC time in the format every timestamp column uses.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Normalize an RFC 3339 timestamp to the stored UTC format.
pub fn normalize_timestamp(raw: &str) -> Option<String> {
    chrono::DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// SQLite-backed metadata store.
///
/// This is the only way to access run metadata. Methods take `&self`; the
/// store is used from one thread per process.
pub struct MetadataStore {
    conn: Connection,
    path: PathBuf,
}

impl MetadataStore {
    /// Open or create a store at the given path.
    ///
    /// Schema creation runs under a single-flight lock so concurrent
    /// processes do not race on first open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, BOOTSTRAP_TIMEOUT)
    }

    pub fn open_with_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = lock_path_for(path);
        let conn = single_flight(&lock_path, timeout, || -> Result<Connection> {
            let conn = Connection::open(path)?;
            configure(&conn)?;
            migrate(&conn)?;
            Ok(conn)
        })??;

        info!("Opened metadata store: {}", path.display());
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Sessions ===

    /// Insert the session if missing and return it. Idempotent.
    pub fn create_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.conn.execute(
            "INSERT INTO sessions (session_id, created_at) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO NOTHING",
            params![session_id, now_timestamp()],
        )?;
        self.get_session(session_id)?
            .ok_or_else(|| DbError::not_found(format!("session {}", session_id)))
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let session = self
            .conn
            .query_row(
                "SELECT session_id, created_at FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok(SessionRecord {
                        session_id: row.get(0)?,
                        created_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    // === Runs ===

    pub fn create_run(&self, new_run: &NewRun) -> Result<RunRecord> {
        self.create_session(&new_run.session_id)?;
        self.conn.execute(
            "INSERT INTO runs (run_id, session_id, created_at, provider, model, prompt_name,
                prompt_version, schema_version, status, artifacts_root_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                new_run.run_id,
                new_run.session_id,
                now_timestamp(),
                new_run.provider,
                new_run.model,
                new_run.prompt_name,
                new_run.prompt_version,
                new_run.schema_version,
                RunStatus::Created.as_str(),
                new_run.artifacts_root_path,
            ],
        )?;
        debug!("Created run {} in session {}", new_run.run_id, new_run.session_id);
        self.get_run(&new_run.run_id)?
            .ok_or_else(|| DbError::not_found(format!("run {}", new_run.run_id)))
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let sql = format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, params![run_id], RawRun::from_row)
            .optional()?;
        raw.map(RawRun::into_record).transpose()
    }

    pub fn run_exists(&self, run_id: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Runs matching the filter, oldest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(session_id) = &filter.session_id {
            values.push(session_id.clone());
            clauses.push(format!("session_id = ?{}", values.len()));
        }
        if let Some(created_before) = &filter.created_before {
            values.push(created_before.clone());
            clauses.push(format!("created_at <= ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM runs", RUN_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, run_id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_from_iter(values.iter()), RawRun::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRun::into_record).collect()
    }

    pub fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?2, error_code = ?3, error_message = ?4 WHERE run_id = ?1",
            params![run_id, status.as_str(), error_code, error_message],
        )?;
        if updated == 0 {
            return Err(DbError::not_found(format!("run {}", run_id)));
        }
        Ok(())
    }

    pub fn update_run_metrics(&self, run_id: &str, metrics: &RunMetrics) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET timings_json = ?2, usage_json = ?3, usage_normalized_json = ?4,
                cost_json = ?5 WHERE run_id = ?1",
            params![
                run_id,
                serde_json::to_string(&metrics.timings)?,
                serde_json::to_string(&metrics.usage)?,
                serde_json::to_string(&metrics.usage_normalized)?,
                serde_json::to_string(&metrics.cost)?,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::not_found(format!("run {}", run_id)));
        }
        Ok(())
    }

    /// Remove a run and everything hanging off it. Returns whether it existed.
    pub fn delete_run(&self, run_id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM artifact_refs WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM llm_outputs WHERE run_id = ?1", params![run_id])?;
        tx.execute("DELETE FROM documents WHERE run_id = ?1", params![run_id])?;
        let deleted = tx.execute("DELETE FROM runs WHERE run_id = ?1", params![run_id])?;
        tx.commit()?;
        if deleted > 0 {
            info!("Deleted metadata for run {}", run_id);
        }
        Ok(deleted > 0)
    }

    // === Documents ===

    pub fn create_document(&self, doc: &NewDocument) -> Result<DocumentRecord> {
        self.conn.execute(
            "INSERT INTO documents (run_id, doc_id, original_filename, original_mime,
                original_path, ocr_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                doc.run_id,
                doc.doc_id,
                doc.original_filename,
                doc.original_mime,
                doc.original_path,
                OcrStatus::Pending.as_str(),
            ],
        )?;
        self.get_document(&doc.run_id, &doc.doc_id)?.ok_or_else(|| {
            DbError::not_found(format!("document {}/{}", doc.run_id, doc.doc_id))
        })
    }

    pub fn get_document(&self, run_id: &str, doc_id: &str) -> Result<Option<DocumentRecord>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE run_id = ?1 AND doc_id = ?2",
            DOCUMENT_COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![run_id, doc_id], RawDocument::from_row)
            .optional()?;
        raw.map(RawDocument::into_record).transpose()
    }

    pub fn update_document_ocr(&self, run_id: &str, doc_id: &str, update: &OcrUpdate) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE documents SET ocr_status = ?3, ocr_model = ?4, pages_count = ?5,
                ocr_artifacts_path = ?6, ocr_error = ?7
             WHERE run_id = ?1 AND doc_id = ?2",
            params![
                run_id,
                doc_id,
                update.ocr_status.as_str(),
                update.ocr_model,
                update.pages_count,
                update.ocr_artifacts_path,
                update.ocr_error,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::not_found(format!("document {}/{}", run_id, doc_id)));
        }
        Ok(())
    }

    pub fn list_documents(&self, run_id: &str) -> Result<Vec<DocumentRecord>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE run_id = ?1 ORDER BY doc_id ASC",
            DOCUMENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![run_id], RawDocument::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawDocument::into_record).collect()
    }

    // === LLM outputs ===

    pub fn upsert_llm_output(&self, output: &LlmOutputRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO llm_outputs (run_id, response_json_path, response_valid,
                schema_validation_errors_path)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET
                response_json_path = excluded.response_json_path,
                response_valid = excluded.response_valid,
                schema_validation_errors_path = excluded.schema_validation_errors_path",
            params![
                output.run_id,
                output.response_json_path,
                output.response_valid as i64,
                output.schema_validation_errors_path,
            ],
        )?;
        Ok(())
    }

    pub fn get_llm_output(&self, run_id: &str) -> Result<Option<LlmOutputRecord>> {
        let output = self
            .conn
            .query_row(
                "SELECT run_id, response_json_path, response_valid, schema_validation_errors_path
                 FROM llm_outputs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(LlmOutputRecord {
                        run_id: row.get(0)?,
                        response_json_path: row.get(1)?,
                        response_valid: row.get::<_, i64>(2)? != 0,
                        schema_validation_errors_path: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(output)
    }

    // === Artifact references ===

    pub fn add_artifact_ref(&self, artifact: &ArtifactRefRecord) -> Result<()> {
        insert_artifact_ref(&self.conn, artifact)
    }

    pub fn list_artifact_refs(&self, run_id: &str) -> Result<Vec<ArtifactRefRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, doc_id, kind, relative_path, metadata_json
             FROM artifact_refs WHERE run_id = ?1 ORDER BY relative_path ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(run_id, doc_id, kind, relative_path, metadata)| {
                Ok(ArtifactRefRecord {
                    run_id,
                    doc_id,
                    kind: kind.parse::<ArtifactKind>().map_err(DbError::invalid_state)?,
                    relative_path,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }

    // === Restore ===

    /// Replace everything stored for a run with the restored view, atomically.
    pub fn reconcile_restored_run(&self, restored: &RestoredRun) -> Result<()> {
        let run = &restored.run;
        if run.session_id != restored.session.session_id {
            return Err(DbError::constraint(format!(
                "run {} belongs to session {}, not {}",
                run.run_id, run.session_id, restored.session.session_id
            )));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO sessions (session_id, created_at) VALUES (?1, ?2)
             ON CONFLICT(session_id) DO NOTHING",
            params![restored.session.session_id, restored.session.created_at],
        )?;
        tx.execute(
            "INSERT INTO runs (run_id, session_id, created_at, provider, model, prompt_name,
                prompt_version, schema_version, status, error_code, error_message, timings_json,
                usage_json, usage_normalized_json, cost_json, artifacts_root_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(run_id) DO UPDATE SET
                session_id = excluded.session_id,
                created_at = excluded.created_at,
                provider = excluded.provider,
                model = excluded.model,
                prompt_name = excluded.prompt_name,
                prompt_version = excluded.prompt_version,
                schema_version = excluded.schema_version,
                status = excluded.status,
                error_code = excluded.error_code,
                error_message = excluded.error_message,
                timings_json = excluded.timings_json,
                usage_json = excluded.usage_json,
                usage_normalized_json = excluded.usage_normalized_json,
                cost_json = excluded.cost_json,
                artifacts_root_path = excluded.artifacts_root_path",
            params![
                run.run_id,
                run.session_id,
                run.created_at,
                run.provider,
                run.model,
                run.prompt_name,
                run.prompt_version,
                run.schema_version,
                run.status.as_str(),
                run.error_code,
                run.error_message,
                serde_json::to_string(&run.timings)?,
                serde_json::to_string(&run.usage)?,
                serde_json::to_string(&run.usage_normalized)?,
                serde_json::to_string(&run.cost)?,
                run.artifacts_root_path,
            ],
        )?;

        tx.execute("DELETE FROM documents WHERE run_id = ?1", params![run.run_id])?;
        for restored_doc in &restored.documents {
            let doc = &restored_doc.document;
            let ocr = &restored_doc.ocr;
            tx.execute(
                "INSERT INTO documents (run_id, doc_id, original_filename, original_mime,
                    original_path, ocr_status, ocr_model, pages_count, ocr_artifacts_path, ocr_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.run_id,
                    doc.doc_id,
                    doc.original_filename,
                    doc.original_mime,
                    doc.original_path,
                    ocr.ocr_status.as_str(),
                    ocr.ocr_model,
                    ocr.pages_count,
                    ocr.ocr_artifacts_path,
                    ocr.ocr_error,
                ],
            )?;
        }

        tx.execute("DELETE FROM llm_outputs WHERE run_id = ?1", params![run.run_id])?;
        if let Some(output) = &restored.llm_output {
            tx.execute(
                "INSERT INTO llm_outputs (run_id, response_json_path, response_valid,
                    schema_validation_errors_path)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    run.run_id,
                    output.response_json_path,
                    output.response_valid as i64,
                    output.schema_validation_errors_path,
                ],
            )?;
        }

        tx.execute("DELETE FROM artifact_refs WHERE run_id = ?1", params![run.run_id])?;
        for artifact in &restored.artifact_refs {
            insert_artifact_ref(&tx, artifact)?;
        }

        tx.commit()?;
        info!(
            "Reconciled restored run {} ({} documents, {} artifacts)",
            run.run_id,
            restored.documents.len(),
            restored.artifact_refs.len()
        );
        Ok(())
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("SQLite journal mode: {}", mode);
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(schema::SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

fn insert_artifact_ref(conn: &Connection, artifact: &ArtifactRefRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO artifact_refs (run_id, doc_id, kind, relative_path, metadata_json)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(run_id, relative_path) DO UPDATE SET
            doc_id = excluded.doc_id,
            kind = excluded.kind,
            metadata_json = excluded.metadata_json",
        params![
            artifact.run_id,
            artifact.doc_id,
            artifact.kind.as_str(),
            artifact.relative_path,
            serde_json::to_string(&artifact.metadata)?,
        ],
    )?;
    Ok(())
}

struct RawRun {
    run_id: String,
    session_id: String,
    created_at: String,
    provider: String,
    model: String,
    prompt_name: String,
    prompt_version: String,
    schema_version: String,
    status: String,
    error_code: Option<String>,
    error_message: Option<String>,
    timings: String,
    usage: String,
    usage_normalized: String,
    cost: String,
    artifacts_root_path: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            session_id: row.get(1)?,
            created_at: row.get(2)?,
            provider: row.get(3)?,
            model: row.get(4)?,
            prompt_name: row.get(5)?,
            prompt_version: row.get(6)?,
            schema_version: row.get(7)?,
            status: row.get(8)?,
            error_code: row.get(9)?,
            error_message: row.get(10)?,
            timings: row.get(11)?,
            usage: row.get(12)?,
            usage_normalized: row.get(13)?,
            cost: row.get(14)?,
            artifacts_root_path: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            status: self.status.parse().map_err(DbError::invalid_state)?,
            timings: parse_json_column(&self.timings)?,
            usage: parse_json_column(&self.usage)?,
            usage_normalized: parse_json_column(&self.usage_normalized)?,
            cost: parse_json_column(&self.cost)?,
            run_id: self.run_id,
            session_id: self.session_id,
            created_at: self.created_at,
            provider: self.provider,
            model: self.model,
            prompt_name: self.prompt_name,
            prompt_version: self.prompt_version,
            schema_version: self.schema_version,
            error_code: self.error_code,
            error_message: self.error_message,
            artifacts_root_path: self.artifacts_root_path,
        })
    }
}

struct RawDocument {
    id: i64,
    run_id: String,
    doc_id: String,
    original_filename: String,
    original_mime: Option<String>,
    original_path: String,
    ocr_status: String,
    ocr_model: Option<String>,
    pages_count: Option<i64>,
    ocr_artifacts_path: Option<String>,
    ocr_error: Option<String>,
}

impl RawDocument {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            doc_id: row.get(2)?,
            original_filename: row.get(3)?,
            original_mime: row.get(4)?,
            original_path: row.get(5)?,
            ocr_status: row.get(6)?,
            ocr_model: row.get(7)?,
            pages_count: row.get(8)?,
            ocr_artifacts_path: row.get(9)?,
            ocr_error: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<DocumentRecord> {
        Ok(DocumentRecord {
            ocr_status: self.ocr_status.parse().map_err(DbError::invalid_state)?,
            id: self.id,
            run_id: self.run_id,
            doc_id: self.doc_id,
            original_filename: self.original_filename,
            original_mime: self.original_mime,
            original_path: self.original_path,
            ocr_model: self.ocr_model,
            pages_count: self.pages_count,
            ocr_artifacts_path: self.ocr_artifacts_path,
            ocr_error: self.ocr_error,
        })
    }
}

fn parse_json_column(raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn new_run(run_id: &str, session_id: &str) -> NewRun {
        NewRun {
            run_id: run_id.to_string(),
            session_id: session_id.to_string(),
            provider: "openai".to_string(),
            model: "gpt-test".to_string(),
            prompt_name: "deposit_review".to_string(),
            prompt_version: "v1".to_string(),
            schema_version: "v1".to_string(),
            artifacts_root_path: format!("/data/sessions/{}/runs/{}", session_id, run_id),
        }
    }

    #[test]
    fn test_open_creates_schema_on_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested/runvault.sqlite3");
        let store = MetadataStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path.as_path());

        let version: i64 = store
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        drop(store);
        // Reopen is idempotent
        MetadataStore::open(&path).unwrap();
    }

    #[test]
    fn test_run_lifecycle() {
        let store = MetadataStore::open_in_memory().unwrap();
        let run = store.create_run(&new_run("r1", "s1")).unwrap();
        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.cost, json!({}));
        assert!(store.get_session("s1").unwrap().is_some());

        store
            .update_run_status("r1", RunStatus::Failed, Some("OCR_API_ERROR"), Some("503"))
            .unwrap();
        store
            .update_run_metrics(
                "r1",
                &RunMetrics {
                    timings: json!({"t_total_ms": 12.5}),
                    ..RunMetrics::default()
                },
            )
            .unwrap();

        let run = store.get_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some("OCR_API_ERROR"));
        assert_eq!(run.timings["t_total_ms"], json!(12.5));

        assert!(matches!(
            store.update_run_status("missing", RunStatus::Completed, None, None),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_documents_and_outputs() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.create_run(&new_run("r1", "s1")).unwrap();
        let doc = store
            .create_document(&NewDocument {
                run_id: "r1".to_string(),
                doc_id: "0000001".to_string(),
                original_filename: "lease.pdf".to_string(),
                original_mime: Some("application/pdf".to_string()),
                original_path: "documents/0000001/original/lease.pdf".to_string(),
            })
            .unwrap();
        assert_eq!(doc.ocr_status, OcrStatus::Pending);

        store
            .update_document_ocr(
                "r1",
                "0000001",
                &OcrUpdate {
                    ocr_status: OcrStatus::Ok,
                    ocr_model: Some("ocr-latest".to_string()),
                    pages_count: Some(3),
                    ocr_artifacts_path: Some("documents/0000001/ocr".to_string()),
                    ocr_error: None,
                },
            )
            .unwrap();
        let docs = store.list_documents("r1").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].pages_count, Some(3));

        store
            .upsert_llm_output(&LlmOutputRecord {
                run_id: "r1".to_string(),
                response_json_path: "llm/response_parsed.json".to_string(),
                response_valid: false,
                schema_validation_errors_path: Some("llm/validation.json".to_string()),
            })
            .unwrap();
        store
            .upsert_llm_output(&LlmOutputRecord {
                run_id: "r1".to_string(),
                response_json_path: "llm/response_parsed.json".to_string(),
                response_valid: true,
                schema_validation_errors_path: None,
            })
            .unwrap();
        let output = store.get_llm_output("r1").unwrap().unwrap();
        assert!(output.response_valid);
        assert_eq!(output.schema_validation_errors_path, None);
    }

    #[test]
    fn test_list_runs_filters_by_created_at() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.create_run(&new_run("old", "s1")).unwrap();
        store.create_run(&new_run("new", "s1")).unwrap();
        store
            .conn
            .execute(
                "UPDATE runs SET created_at = '2020-01-01T00:00:00.000000Z' WHERE run_id = 'old'",
                [],
            )
            .unwrap();

        let old = store
            .list_runs(&RunFilter {
                created_before: Some("2021-01-01T00:00:00.000000Z".to_string()),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].run_id, "old");

        let all = store.list_runs(&RunFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, "old");
    }

    #[test]
    fn test_delete_run_cascades() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.create_run(&new_run("r1", "s1")).unwrap();
        store
            .add_artifact_ref(&ArtifactRefRecord {
                run_id: "r1".to_string(),
                doc_id: None,
                kind: ArtifactKind::RunManifest,
                relative_path: "run.json".to_string(),
                metadata: json!({"size_bytes": 10}),
            })
            .unwrap();
        assert_eq!(store.list_artifact_refs("r1").unwrap().len(), 1);

        assert!(store.delete_run("r1").unwrap());
        assert!(!store.delete_run("r1").unwrap());
        assert!(store.get_run("r1").unwrap().is_none());
        assert!(store.list_artifact_refs("r1").unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_replaces_children() {
        let store = MetadataStore::open_in_memory().unwrap();
        let mut run = store.create_run(&new_run("r1", "s1")).unwrap();
        store
            .create_document(&NewDocument {
                run_id: "r1".to_string(),
                doc_id: "0000009".to_string(),
                original_filename: "stale.pdf".to_string(),
                original_mime: None,
                original_path: "documents/0000009/original/stale.pdf".to_string(),
            })
            .unwrap();

        run.status = RunStatus::Completed;
        let restored = RestoredRun {
            session: SessionRecord {
                session_id: "s1".to_string(),
                created_at: now_timestamp(),
            },
            run,
            documents: vec![RestoredDocument {
                document: NewDocument {
                    run_id: "r1".to_string(),
                    doc_id: "0000001".to_string(),
                    original_filename: "lease.pdf".to_string(),
                    original_mime: Some("application/pdf".to_string()),
                    original_path: "documents/0000001/original/lease.pdf".to_string(),
                },
                ocr: OcrUpdate {
                    ocr_status: OcrStatus::Ok,
                    pages_count: Some(2),
                    ..OcrUpdate::default()
                },
            }],
            llm_output: None,
            artifact_refs: vec![],
        };
        store.reconcile_restored_run(&restored).unwrap();

        let docs = store.list_documents("r1").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].doc_id, "0000001");
        assert_eq!(store.get_run("r1").unwrap().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_normalize_timestamp() {
        assert_eq!(
            normalize_timestamp("2024-05-01T12:00:00+02:00").as_deref(),
            Some("2024-05-01T10:00:00.000000Z")
        );
        assert_eq!(normalize_timestamp("yesterday"), None);
    }
}
