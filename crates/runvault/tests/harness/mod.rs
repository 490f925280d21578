//! Shared fixtures for runvault integration tests.
//!
//! A `TestHarness` owns a temp directory holding one data root and one
//! SQLite database. Scripted OCR, LLM and validator collaborators let tests
//! drive real runs through the orchestrator without any network.

#![allow(dead_code)]

use runvault::bundle::{export_by_id, ExportOptions};
use runvault::runner::{
    LlmClient, LlmRequest, LlmResult, NamedArtifact, OcrClient, OcrRequest, OcrResult, OutputValidator,
    ValidationOutcome,
};
use runvault::{ArtifactStore, CancellationToken, Orchestrator, RestoreService, RunOutcome, RunRequest};
use runvault_db::MetadataStore;
use runvault_protocol::{ProviderError, RetryPolicy, RunvaultConfig};
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const PAGE_ONE: &str = "# Lease agreement\n\nThe tenant agrees to pay rent monthly. \
    Payment is due on the first business day of every month and late fees apply after five days. \
    The landlord is responsible for structural repairs and the tenant for routine maintenance.";
pub const PAGE_TWO: &str = "## Termination\n\nEither party may terminate with sixty days written notice. \
    Deposits are returned within thirty days of move-out, less documented deductions for damage \
    beyond normal wear and tear, itemized in writing and delivered to the forwarding address.";

pub const GOOD_ANSWER: &str = r#"{"summary": "Standard residential lease", "risks": ["late fees"]}"#;

pub struct TestHarness {
    pub temp: TempDir,
    pub config: RunvaultConfig,
    pub artifacts: ArtifactStore,
    pub db: MetadataStore,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut RunvaultConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config =
            RunvaultConfig::for_data_dir(temp.path().join("data"), temp.path().join("runvault.sqlite3"));
        config.lock_timeout = Duration::from_millis(500);
        adjust(&mut config);
        let artifacts = ArtifactStore::open(&config.data_dir).unwrap();
        let db = MetadataStore::open(&config.db_path).unwrap();
        Self {
            temp,
            config,
            artifacts,
            db,
        }
    }

    /// Write an input document outside the data root.
    pub fn input_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let dir = self.temp.path().join("inputs");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    pub fn request(&self, input_files: Vec<PathBuf>) -> RunRequest {
        RunRequest {
            session_id: Some("session-1".to_string()),
            input_files,
            provider: "openrouter".to_string(),
            model: "test-model".to_string(),
            prompt_name: "lease_review".to_string(),
            prompt_version: "v2".to_string(),
            schema_version: None,
            system_prompt: "Review the lease.".to_string(),
            schema: json!({"type": "object", "required": ["summary"]}),
            ocr_options: json!({"model": "ocr-hint"}),
            llm_params: json!({"temperature": 0}),
        }
    }

    pub fn run(
        &self,
        request: &RunRequest,
        ocr: &dyn OcrClient,
        llm: &dyn LlmClient,
        validator: &dyn OutputValidator,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        Orchestrator::new(&self.artifacts, &self.db, &self.config, ocr, llm, validator)
            .with_retry_policy(RetryPolicy::without_delay())
            .run(request, cancel)
            .unwrap()
    }

    /// A completed two-document run.
    pub fn completed_run(&self) -> RunOutcome {
        let request = self.request(vec![
            self.input_file("lease.pdf", b"%PDF-1.7 lease"),
            self.input_file("addendum.png", b"\x89PNG addendum"),
        ]);
        let outcome = self.run(
            &request,
            &ScriptedOcr::ok(),
            &ScriptedLlm::answering(GOOD_ANSWER),
            &StaticValidator::accept(),
            &CancellationToken::new(),
        );
        assert!(outcome.is_success(), "{:?}", outcome);
        outcome
    }

    /// Export a run into `<temp>/exports`, asserting success.
    pub fn export(&self, run_id: &str) -> PathBuf {
        let report = export_by_id(
            &self.artifacts,
            &self.db,
            run_id,
            &ExportOptions {
                output_dir: Some(self.temp.path().join("exports")),
                signing_key: self.config.signing_key.clone(),
                lock_timeout: self.config.lock_timeout,
            },
        );
        assert!(report.is_success(), "{:?}", report);
        PathBuf::from(report.archive_path.unwrap())
    }

    pub fn restorer(&self) -> RestoreService<'_> {
        RestoreService::new(&self.artifacts, &self.db, &self.config)
    }

    /// Second connection on the same database, for fault injection and backdating.
    pub fn raw_connection(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.config.db_path).unwrap()
    }

    pub fn backdate(&self, run_id: &str, created_at: &str) {
        let conn = self.raw_connection();
        let updated = conn
            .execute(
                "UPDATE runs SET created_at = ?1 WHERE run_id = ?2",
                rusqlite::params![created_at, run_id],
            )
            .unwrap();
        assert_eq!(updated, 1);
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }
}

// === Scripted collaborators ===

pub struct ScriptedOcr {
    failures: RefCell<VecDeque<ProviderError>>,
    pub pages: Vec<String>,
    pub calls: Cell<u32>,
}

impl ScriptedOcr {
    pub fn ok() -> Self {
        Self::failing(Vec::new())
    }

    /// Fail the first calls with `errors`, in order, then succeed.
    pub fn failing(errors: Vec<ProviderError>) -> Self {
        Self {
            failures: RefCell::new(errors.into()),
            pages: vec![PAGE_ONE.to_string(), PAGE_TWO.to_string()],
            calls: Cell::new(0),
        }
    }

    pub fn with_pages(mut self, pages: Vec<String>) -> Self {
        self.pages = pages;
        self
    }
}

impl OcrClient for ScriptedOcr {
    fn process_document(&self, request: &OcrRequest) -> Result<OcrResult, ProviderError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(err) = self.failures.borrow_mut().pop_front() {
            return Err(err);
        }
        assert!(request.input_path.is_file());
        Ok(OcrResult {
            model: "ocr-2".to_string(),
            pages: self.pages.clone(),
            raw_response: json!({"doc_id": request.doc_id, "pages": self.pages.len()}),
            tables: vec![NamedArtifact::new("table_1.csv", "term,value\nrent,1200\n")],
            images: Vec::new(),
            page_renders: vec![NamedArtifact::new("page_0001.png", vec![0x89, b'P', b'N', b'G'])],
        })
    }
}

pub struct ScriptedLlm {
    script: RefCell<VecDeque<Result<LlmResult, ProviderError>>>,
    fallback: String,
    pub calls: Cell<u32>,
    pub last_user_content: RefCell<Option<String>>,
}

impl ScriptedLlm {
    pub fn answering(text: &str) -> Self {
        Self::scripted(Vec::new(), text)
    }

    /// Play back `script` first, then answer with `fallback`.
    pub fn scripted(script: Vec<Result<LlmResult, ProviderError>>, fallback: &str) -> Self {
        Self {
            script: RefCell::new(script.into()),
            fallback: fallback.to_string(),
            calls: Cell::new(0),
            last_user_content: RefCell::new(None),
        }
    }

    pub fn failing(errors: Vec<ProviderError>) -> Self {
        Self::scripted(errors.into_iter().map(Err).collect(), GOOD_ANSWER)
    }
}

impl LlmClient for ScriptedLlm {
    fn generate_structured(&self, request: &LlmRequest) -> Result<LlmResult, ProviderError> {
        self.calls.set(self.calls.get() + 1);
        *self.last_user_content.borrow_mut() = Some(request.user_content.clone());
        if let Some(step) = self.script.borrow_mut().pop_front() {
            return step;
        }
        Ok(LlmResult {
            raw_text: self.fallback.clone(),
            usage: json!({"prompt_tokens": 120, "completion_tokens": 30}),
            usage_normalized: json!({"input_tokens": 120, "output_tokens": 30}),
            cost: json!({"total_usd": 0.0012}),
            timings: Value::Null,
        })
    }
}

pub struct StaticValidator(pub ValidationOutcome);

impl StaticValidator {
    pub fn accept() -> Self {
        Self(ValidationOutcome::valid())
    }

    pub fn reject(schema_errors: &[&str]) -> Self {
        Self(ValidationOutcome {
            valid: false,
            schema_errors: schema_errors.iter().map(|e| e.to_string()).collect(),
            invariant_errors: Vec::new(),
        })
    }
}

impl OutputValidator for StaticValidator {
    fn validate(&self, _parsed: &Value, _schema: &Value) -> ValidationOutcome {
        self.0.clone()
    }
}

// === Archive surgery ===

pub fn read_entries(archive_path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = ZipArchive::new(File::open(archive_path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).unwrap();
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            (entry.name().to_string(), bytes)
        })
        .collect()
}

pub fn write_entries(archive_path: &Path, entries: &[(String, Vec<u8>)]) {
    let mut zip = ZipWriter::new(File::create(archive_path).unwrap());
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, bytes) in entries {
        zip.start_file(name.as_str(), options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.finish().unwrap();
}

/// Copy `source` to `dest`, passing every entry through `edit`.
/// `edit` returns `None` to drop the entry.
pub fn rewrite_archive(
    source: &Path,
    dest: &Path,
    mut edit: impl FnMut(&str, Vec<u8>) -> Option<Vec<u8>>,
) -> PathBuf {
    let entries: Vec<(String, Vec<u8>)> = read_entries(source)
        .into_iter()
        .filter_map(|(name, bytes)| edit(&name, bytes).map(|b| (name, b)))
        .collect();
    write_entries(dest, &entries);
    dest.to_path_buf()
}

pub fn entry_names(archive_path: &Path) -> Vec<String> {
    read_entries(archive_path).into_iter().map(|(name, _)| name).collect()
}
