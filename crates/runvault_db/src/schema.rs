//! Schema definitions for the metadata store.

/// Bumped whenever the DDL below changes shape.
pub const SCHEMA_VERSION: i64 = 1;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt_name TEXT NOT NULL,
    prompt_version TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('created', 'running', 'completed', 'failed')),
    error_code TEXT,
    error_message TEXT,
    timings_json TEXT NOT NULL DEFAULT '{}',
    usage_json TEXT NOT NULL DEFAULT '{}',
    usage_normalized_json TEXT NOT NULL DEFAULT '{}',
    cost_json TEXT NOT NULL DEFAULT '{}',
    artifacts_root_path TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_session_id ON runs(session_id);
CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at);

CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    doc_id TEXT NOT NULL,
    original_filename TEXT NOT NULL,
    original_mime TEXT,
    original_path TEXT NOT NULL,
    ocr_status TEXT NOT NULL CHECK (ocr_status IN ('pending', 'ok', 'failed')),
    ocr_model TEXT,
    pages_count INTEGER,
    ocr_artifacts_path TEXT,
    ocr_error TEXT,
    UNIQUE (run_id, doc_id)
);

CREATE INDEX IF NOT EXISTS idx_documents_run_id ON documents(run_id);

CREATE TABLE IF NOT EXISTS llm_outputs (
    run_id TEXT PRIMARY KEY REFERENCES runs(run_id) ON DELETE CASCADE,
    response_json_path TEXT NOT NULL,
    response_valid INTEGER NOT NULL CHECK (response_valid IN (0, 1)),
    schema_validation_errors_path TEXT
);

CREATE TABLE IF NOT EXISTS artifact_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
    doc_id TEXT,
    kind TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    UNIQUE (run_id, relative_path)
);

CREATE INDEX IF NOT EXISTS idx_artifact_refs_run_id ON artifact_refs(run_id);
"#;
