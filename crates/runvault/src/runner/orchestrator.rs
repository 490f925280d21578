//! Drives one run from `created` to `completed` or `failed`.
//!
//! Every transition rewrites `run.json`. Once the run row exists, failures
//! never escape as errors: they end the run as `failed` with a taxonomy code,
//! and the failure bookkeeping itself is best-effort.

use super::pack::{pack_documents, request_text, DocumentMarkdown};
use super::quality::evaluate_pages;
use super::snapshot::{DocumentEntry, RunSnapshot, SnapshotInputs, SnapshotMetrics, SnapshotValidation};
use super::{
    CancellationToken, LlmClient, LlmRequest, LlmResult, NamedArtifact, OcrClient, OcrRequest, OcrResult,
    OutputValidator, RunError, ValidationOutcome,
};
use crate::artifacts::{guess_mime, ArtifactStore, RunRoot};
use runvault_db::{
    now_timestamp, ArtifactRefRecord, LlmOutputRecord, MetadataStore, NewDocument, NewRun, OcrUpdate, RunLock,
    RunMetrics,
};
use runvault_protocol::defaults::{CANCELLED_BY_USER_MESSAGE, RUN_LOG_PATH};
use runvault_protocol::{
    classify, doc_id_for, run_with_retry, ArtifactKind, CallKind, ErrorCode, OcrStatus, ProviderError, RetryPolicy,
    RunStage, RunStatus, RunvaultConfig, StageName, StageStatus,
};
use runvault_security::validate_identifier;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt::Display;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Everything needed to start a run. Prompt assets are passed in, not loaded.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// A fresh session is created when absent.
    pub session_id: Option<String>,
    pub input_files: Vec<PathBuf>,
    pub provider: String,
    pub model: String,
    pub prompt_name: String,
    pub prompt_version: String,
    /// Defaults to `prompt_version`.
    pub schema_version: Option<String>,
    pub system_prompt: String,
    pub schema: Value,
    /// Passed to the OCR client; `model` is recorded on each document.
    pub ocr_options: Value,
    pub llm_params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub stage: RunStage,
    pub failed_stage: Option<StageName>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub artifacts_root_path: String,
    pub documents: Vec<DocumentEntry>,
    pub parsed_output: Option<Value>,
    pub validation: Option<ValidationOutcome>,
    pub metrics: SnapshotMetrics,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

#[derive(Debug)]
struct StageFailure {
    stage: StageName,
    code: ErrorCode,
    message: String,
    /// Recorded without the stage prefix.
    bare: bool,
}

impl StageFailure {
    fn new(stage: StageName, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stage,
            code,
            message: message.into(),
            bare: false,
        }
    }

    fn storage(stage: StageName, err: impl Display) -> Self {
        Self::new(stage, ErrorCode::StorageError, err.to_string())
    }

    fn provider(stage: StageName, kind: CallKind, err: &ProviderError) -> Self {
        Self::new(stage, classify(err, kind), err.to_string())
    }

    fn cancelled(stage: StageName) -> Self {
        Self {
            bare: true,
            ..Self::new(stage, ErrorCode::UnknownError, CANCELLED_BY_USER_MESSAGE)
        }
    }

    fn recorded_message(&self) -> String {
        if self.bare {
            self.message.clone()
        } else {
            format!("{}: {}", self.stage, self.message)
        }
    }
}

type StageResult<T> = Result<T, StageFailure>;

enum DocFailure {
    Provider(ProviderError),
    Fatal(StageFailure),
}

struct ActiveRun {
    root: RunRoot,
    snapshot: RunSnapshot,
    started: Instant,
    timings: Map<String, Value>,
    parsed: Option<Value>,
    validation: Option<ValidationOutcome>,
}

impl ActiveRun {
    fn run_id(&self) -> &str {
        self.root.run_id()
    }

    fn close_timings(&mut self) {
        self.timings
            .insert("t_total_ms".to_string(), json!(elapsed_ms(self.started)));
        self.snapshot.metrics.timings = Value::Object(self.timings.clone());
    }

    fn metrics(&self) -> RunMetrics {
        RunMetrics {
            timings: self.snapshot.metrics.timings.clone(),
            usage: self.snapshot.metrics.usage.clone(),
            usage_normalized: self.snapshot.metrics.usage_normalized.clone(),
            cost: self.snapshot.metrics.cost.clone(),
        }
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            session_id: self.snapshot.session_id.clone(),
            run_id: self.snapshot.run_id.clone(),
            status: self.snapshot.status,
            stage: self.snapshot.stage,
            failed_stage: self.snapshot.failed_stage,
            error_code: self.snapshot.error_code,
            error_message: self.snapshot.error_message.clone(),
            artifacts_root_path: self.root.path().display().to_string(),
            documents: self.snapshot.artifacts.documents,
            parsed_output: self.parsed,
            validation: self.validation,
            metrics: self.snapshot.metrics,
        }
    }
}

pub struct Orchestrator<'a> {
    artifacts: &'a ArtifactStore,
    db: &'a MetadataStore,
    ocr: &'a dyn OcrClient,
    llm: &'a dyn LlmClient,
    validator: &'a dyn OutputValidator,
    retry: RetryPolicy,
    provider_timeout: Duration,
    lock_timeout: Duration,
    max_context_chars: usize,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        artifacts: &'a ArtifactStore,
        db: &'a MetadataStore,
        config: &RunvaultConfig,
        ocr: &'a dyn OcrClient,
        llm: &'a dyn LlmClient,
        validator: &'a dyn OutputValidator,
    ) -> Self {
        Self {
            artifacts,
            db,
            ocr,
            llm,
            validator,
            retry: RetryPolicy::default(),
            provider_timeout: config.provider_timeout,
            lock_timeout: config.lock_timeout,
            max_context_chars: config.max_context_chars,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create a run and drive it to a terminal state.
    ///
    /// `Err` only when the run could not be created. Every later failure is
    /// reported as a `failed` outcome.
    pub fn run(&self, request: &RunRequest, cancel: &CancellationToken) -> Result<RunOutcome, RunError> {
        validate_request(request)?;
        let session_id = match &request.session_id {
            Some(id) => id.trim().to_string(),
            None => Uuid::new_v4().to_string(),
        };
        let run_id = Uuid::new_v4().to_string();

        let schema_version = request
            .schema_version
            .clone()
            .unwrap_or_else(|| request.prompt_version.clone());
        let root = self.artifacts.create_run_root(&session_id, &run_id)?;
        let created = RunLock::acquire(&root.lock_path(), self.lock_timeout)
            .map_err(RunError::from)
            .and_then(|lock| {
                let record = self.db.create_run(&NewRun {
                    run_id: run_id.clone(),
                    session_id: session_id.clone(),
                    provider: request.provider.clone(),
                    model: request.model.clone(),
                    prompt_name: request.prompt_name.clone(),
                    prompt_version: request.prompt_version.clone(),
                    schema_version: schema_version.clone(),
                    artifacts_root_path: root.path().display().to_string(),
                })?;
                Ok((lock, record))
            });
        let (_lock, record) = match created {
            Ok(created) => created,
            Err(e) => {
                discard_root(&root, &e);
                return Err(e);
            }
        };
        info!(
            "Created run {} in session {} with {} files",
            run_id,
            session_id,
            request.input_files.len()
        );

        let inputs = SnapshotInputs {
            provider: request.provider.clone(),
            model: request.model.clone(),
            prompt_name: request.prompt_name.clone(),
            prompt_version: request.prompt_version.clone(),
            schema_version,
            ocr_options: request.ocr_options.clone(),
            llm_params: request.llm_params.clone(),
        };
        let snapshot = RunSnapshot::new(&root, inputs, &record.created_at);
        let mut run = ActiveRun {
            root,
            snapshot,
            started: Instant::now(),
            timings: Map::new(),
            parsed: None,
            validation: None,
        };

        match self.drive(&mut run, request, cancel) {
            Ok(()) => info!("Run {} completed", run.run_id()),
            Err(failure) => self.fail(&mut run, failure),
        }
        Ok(run.into_outcome())
    }

    fn drive(&self, run: &mut ActiveRun, request: &RunRequest, cancel: &CancellationToken) -> StageResult<()> {
        run.snapshot
            .write(&run.root)
            .map_err(|e| StageFailure::storage(StageName::Init, e))?;

        run.snapshot.set_stage(StageName::Init, StageStatus::Running);
        self.transition(run, RunStage::Running, StageName::Init)?;
        self.db
            .update_run_status(run.run_id(), RunStatus::Running, None, None)
            .map_err(|e| StageFailure::storage(StageName::Init, e))?;
        self.log(run, &format!("Run started with {} files", request.input_files.len()));
        self.mark(run, StageName::Init, StageStatus::Completed)?;

        ensure_not_cancelled(cancel, StageName::Ocr)?;
        run.snapshot.set_stage(StageName::Ocr, StageStatus::Running);
        self.transition(run, RunStage::Ocr, StageName::Ocr)?;
        let documents = self.run_ocr(run, request)?;
        self.mark(run, StageName::Ocr, StageStatus::Completed)?;

        ensure_not_cancelled(cancel, StageName::Pack)?;
        self.mark(run, StageName::Pack, StageStatus::Running)?;
        let packed = self.pack(run, request, &documents)?;
        run.snapshot.set_stage(StageName::Pack, StageStatus::Completed);
        self.transition(run, RunStage::Packed, StageName::Pack)?;

        ensure_not_cancelled(cancel, StageName::Llm)?;
        self.mark(run, StageName::Llm, StageStatus::Running)?;
        let parsed = self.infer(run, request, packed)?;
        run.snapshot.set_stage(StageName::Llm, StageStatus::Completed);
        self.transition(run, RunStage::Inferred, StageName::Llm)?;

        ensure_not_cancelled(cancel, StageName::Validate)?;
        self.mark(run, StageName::Validate, StageStatus::Running)?;
        self.validate(run, request, parsed)?;
        run.snapshot.set_stage(StageName::Validate, StageStatus::Completed);
        self.transition(run, RunStage::Validated, StageName::Validate)?;

        self.finalize(run)
    }

    fn transition(&self, run: &mut ActiveRun, next: RunStage, stage: StageName) -> StageResult<()> {
        let from = run.snapshot.stage;
        if !run.snapshot.advance(next) {
            return Err(StageFailure::new(
                stage,
                ErrorCode::UnknownError,
                format!("Illegal transition from {} to {}", from, next),
            ));
        }
        debug!("Run {}: {} -> {}", run.run_id(), from, next);
        run.snapshot
            .write(&run.root)
            .map_err(|e| StageFailure::storage(stage, e))
    }

    fn mark(&self, run: &mut ActiveRun, stage: StageName, status: StageStatus) -> StageResult<()> {
        run.snapshot.set_stage(stage, status);
        run.snapshot
            .write(&run.root)
            .map_err(|e| StageFailure::storage(stage, e))
    }

    fn log(&self, run: &ActiveRun, message: &str) {
        let line = format!("{} {}\n", now_timestamp(), message);
        if let Err(e) = run.root.append_text(RUN_LOG_PATH, &line) {
            warn!("Run {}: failed to append run log: {}", run.run_id(), e);
        }
    }

    // === OCR ===

    /// OCR every document, continuing past per-document failures. The stage
    /// fails afterwards with the code of the first failed document.
    fn run_ocr(&self, run: &mut ActiveRun, request: &RunRequest) -> StageResult<Vec<DocumentMarkdown>> {
        let started = Instant::now();
        let mut packed = Vec::with_capacity(request.input_files.len());
        let mut first_failure: Option<(ErrorCode, String)> = None;

        for (index, source) in request.input_files.iter().enumerate() {
            let doc_id = doc_id_for(index + 1);
            let entry = self.ingest_document(run, &doc_id, source)?;

            match self.ocr_document(run, &entry, request) {
                Ok(markdown) => {
                    self.log(run, &format!("Doc {}: OCR ok", doc_id));
                    packed.push(DocumentMarkdown { doc_id, markdown });
                }
                Err(DocFailure::Provider(err)) => {
                    let code = classify(&err, CallKind::Ocr);
                    let message = err.to_string();
                    warn!("Run {}: doc {} OCR failed ({}): {}", run.run_id(), doc_id, code, message);
                    self.record_ocr_failure(run, &entry, request, &message)?;
                    self.log(run, &format!("Doc {}: OCR failed ({})", doc_id, message));
                    if first_failure.is_none() {
                        first_failure = Some((code, format!("doc {}: {}", doc_id, message)));
                    }
                }
                Err(DocFailure::Fatal(failure)) => return Err(failure),
            }
            run.snapshot
                .write(&run.root)
                .map_err(|e| StageFailure::storage(StageName::Ocr, e))?;
        }

        run.timings
            .insert("t_ocr_total_ms".to_string(), json!(elapsed_ms(started)));
        run.snapshot.metrics.timings = Value::Object(run.timings.clone());

        match first_failure {
            Some((code, detail)) => Err(StageFailure::new(
                StageName::Ocr,
                code,
                format!("One or more documents failed OCR ({})", detail),
            )),
            None => Ok(packed),
        }
    }

    fn ingest_document(&self, run: &mut ActiveRun, doc_id: &str, source: &std::path::Path) -> StageResult<DocumentEntry> {
        let filename = source
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .filter(|name| validate_identifier(name).is_ok())
            .ok_or_else(|| {
                StageFailure::new(
                    StageName::Ocr,
                    ErrorCode::FileUnsupported,
                    format!("Input file name is not usable: {}", source.display()),
                )
            })?;
        let original_path = format!("documents/{}/original/{}", doc_id, filename);
        run.root
            .copy_in(&original_path, source)
            .map_err(|e| StageFailure::storage(StageName::Ocr, e))?;
        let original_mime = guess_mime(&filename).map(str::to_string);

        self.db
            .create_document(&NewDocument {
                run_id: run.run_id().to_string(),
                doc_id: doc_id.to_string(),
                original_filename: filename.clone(),
                original_mime: original_mime.clone(),
                original_path: original_path.clone(),
            })
            .map_err(|e| StageFailure::storage(StageName::Ocr, e))?;

        let entry = DocumentEntry {
            doc_id: doc_id.to_string(),
            original_filename: filename,
            original_mime,
            original_path,
            ocr_status: OcrStatus::Pending,
            ocr_model: None,
            pages_count: None,
            ocr_artifacts_path: format!("documents/{}/ocr", doc_id),
            ocr_error: None,
            quality_warnings: Vec::new(),
        };
        run.snapshot.artifacts.documents.push(entry.clone());
        Ok(entry)
    }

    fn ocr_document(&self, run: &mut ActiveRun, entry: &DocumentEntry, request: &RunRequest) -> Result<String, DocFailure> {
        let fatal = |e: &dyn Display| DocFailure::Fatal(StageFailure::storage(StageName::Ocr, e));
        let ocr_request = OcrRequest {
            doc_id: entry.doc_id.clone(),
            input_path: run.root.resolve(&entry.original_path).map_err(|e| fatal(&e))?,
            filename: entry.original_filename.clone(),
            mime: entry.original_mime.clone(),
            options: request.ocr_options.clone(),
            timeout: self.provider_timeout,
        };

        let result = run_with_retry(
            &self.retry,
            CallKind::Ocr,
            |_| self.ocr.process_document(&ocr_request),
            |attempt, err| {
                warn!(
                    "Run {}: retrying OCR for doc {} (attempt {}) after: {}",
                    run.root.run_id(),
                    entry.doc_id,
                    attempt + 1,
                    err
                )
            },
        )
        .map_err(DocFailure::Provider)?;

        for attachment in result.tables.iter().chain(&result.images).chain(&result.page_renders) {
            if let Err(e) = validate_identifier(&attachment.name) {
                return Err(DocFailure::Provider(ProviderError::Parse(format!(
                    "OCR attachment has an unusable name: {}",
                    e
                ))));
            }
        }

        let combined = self.write_ocr_artifacts(&run.root, entry, &result).map_err(|e| fatal(&e))?;
        let quality = evaluate_pages(&result.pages);
        run.root
            .write_json(&format!("{}/quality.json", entry.ocr_artifacts_path), &quality)
            .map_err(|e| fatal(&e))?;

        let model = Some(result.model.trim().to_string())
            .filter(|m| !m.is_empty())
            .or_else(|| ocr_model_hint(request));
        let pages_count = result.pages.len() as i64;
        self.db
            .update_document_ocr(
                run.run_id(),
                &entry.doc_id,
                &OcrUpdate {
                    ocr_status: OcrStatus::Ok,
                    ocr_model: model.clone(),
                    pages_count: Some(pages_count),
                    ocr_artifacts_path: Some(entry.ocr_artifacts_path.clone()),
                    ocr_error: None,
                },
            )
            .map_err(|e| fatal(&e))?;

        if let Some(doc) = run.snapshot.document_mut(&entry.doc_id) {
            doc.ocr_status = OcrStatus::Ok;
            doc.ocr_model = model;
            doc.pages_count = Some(pages_count);
            doc.quality_warnings = quality.warnings;
        }
        Ok(combined)
    }

    /// Write raw response, pages, combined markdown and attachments. Returns the combined markdown.
    fn write_ocr_artifacts(
        &self,
        root: &RunRoot,
        entry: &DocumentEntry,
        result: &OcrResult,
    ) -> Result<String, crate::artifacts::StoreError> {
        let dir = &entry.ocr_artifacts_path;
        root.write_json(&format!("{}/raw_response.json", dir), &result.raw_response)?;
        for (index, page) in result.pages.iter().enumerate() {
            root.write_text(&format!("{}/pages/{:04}.md", dir, index + 1), page)?;
        }
        let combined = result.pages.join("\n\n");
        root.write_text(&format!("{}/combined.md", dir), &combined)?;

        let groups: [(&str, &[NamedArtifact]); 3] = [
            ("tables", &result.tables),
            ("images", &result.images),
            ("page_renders", &result.page_renders),
        ];
        for (subdir, attachments) in groups {
            for attachment in attachments {
                root.write_bytes(&format!("{}/{}/{}", dir, subdir, attachment.name), &attachment.bytes)?;
            }
        }
        Ok(combined)
    }

    fn record_ocr_failure(
        &self,
        run: &mut ActiveRun,
        entry: &DocumentEntry,
        request: &RunRequest,
        message: &str,
    ) -> StageResult<()> {
        let model = ocr_model_hint(request);
        self.db
            .update_document_ocr(
                run.run_id(),
                &entry.doc_id,
                &OcrUpdate {
                    ocr_status: OcrStatus::Failed,
                    ocr_model: model.clone(),
                    pages_count: None,
                    ocr_artifacts_path: Some(entry.ocr_artifacts_path.clone()),
                    ocr_error: Some(message.to_string()),
                },
            )
            .map_err(|e| StageFailure::storage(StageName::Ocr, e))?;
        if let Some(doc) = run.snapshot.document_mut(&entry.doc_id) {
            doc.ocr_status = OcrStatus::Failed;
            doc.ocr_model = model;
            doc.ocr_error = Some(message.to_string());
        }
        Ok(())
    }

    // === Pack ===

    fn pack(&self, run: &mut ActiveRun, request: &RunRequest, documents: &[DocumentMarkdown]) -> StageResult<String> {
        let packed = pack_documents(documents);
        let paths = run.snapshot.artifacts.llm.clone();
        run.root
            .write_text(&paths.request_path, &request_text(&request.system_prompt, &packed))
            .map_err(|e| StageFailure::storage(StageName::Pack, e))?;

        let chars = packed.chars().count();
        if chars > self.max_context_chars {
            let err = ProviderError::ContextTooLarge {
                chars,
                limit: self.max_context_chars,
            };
            return Err(StageFailure::provider(StageName::Pack, CallKind::Llm, &err));
        }
        debug!("Run {}: packed {} documents ({} chars)", run.run_id(), documents.len(), chars);
        Ok(packed)
    }

    // === Inference ===

    fn infer(&self, run: &mut ActiveRun, request: &RunRequest, packed: String) -> StageResult<Value> {
        let paths = run.snapshot.artifacts.llm.clone();
        let llm_request = LlmRequest {
            run_id: run.run_id().to_string(),
            system_prompt: request.system_prompt.clone(),
            user_content: packed,
            schema: request.schema.clone(),
            model: request.model.clone(),
            params: request.llm_params.clone(),
            timeout: self.provider_timeout,
        };

        let started = Instant::now();
        let outcome = run_with_retry(
            &self.retry,
            CallKind::Llm,
            |_| self.llm.generate_structured(&llm_request),
            |attempt, err| warn!("Run {}: retrying LLM call (attempt {}) after: {}", run.root.run_id(), attempt + 1, err),
        );
        let result: LlmResult = match outcome {
            Ok(result) => result,
            Err(err) => {
                if let Err(e) = run.root.write_text(&paths.response_raw_path, &err.to_string()) {
                    warn!("Run {}: failed to write raw response: {}", run.run_id(), e);
                }
                return Err(StageFailure::provider(StageName::Llm, CallKind::Llm, &err));
            }
        };

        run.root
            .write_text(&paths.response_raw_path, &result.raw_text)
            .map_err(|e| StageFailure::storage(StageName::Llm, e))?;

        let llm_ms = result
            .timings
            .get("t_llm_total_ms")
            .and_then(Value::as_f64)
            .unwrap_or_else(|| elapsed_ms(started));
        run.timings.insert("t_llm_total_ms".to_string(), json!(llm_ms));
        run.snapshot.metrics = SnapshotMetrics {
            timings: Value::Object(run.timings.clone()),
            usage: object_or_empty(result.usage),
            usage_normalized: object_or_empty(result.usage_normalized),
            cost: object_or_empty(result.cost),
        };

        let parsed = match serde_json::from_str::<Value>(&result.raw_text) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => return Err(self.invalid_json(run, "Model output is not a JSON object".to_string())),
            Err(e) => return Err(self.invalid_json(run, format!("JSON parse error: {}", e))),
        };
        run.root
            .write_json(&paths.response_parsed_path, &parsed)
            .map_err(|e| StageFailure::storage(StageName::Llm, e))?;
        run.parsed = Some(parsed.clone());
        Ok(parsed)
    }

    fn invalid_json(&self, run: &mut ActiveRun, message: String) -> StageFailure {
        let validation = ValidationOutcome {
            valid: false,
            schema_errors: vec![message.clone()],
            invariant_errors: Vec::new(),
        };
        if let Err(failure) = self.store_validation(run, &validation, StageName::Llm) {
            error!("Run {}: {}", run.run_id(), failure.message);
        }
        StageFailure::provider(StageName::Llm, CallKind::Llm, &ProviderError::InvalidJson(message))
    }

    // === Validation ===

    fn validate(&self, run: &mut ActiveRun, request: &RunRequest, parsed: Value) -> StageResult<()> {
        let outcome = self.validator.validate(&parsed, &request.schema);
        self.store_validation(run, &outcome, StageName::Validate)?;
        let valid = outcome.valid;
        let errors = outcome.errors();
        run.validation = Some(outcome);
        if !valid {
            self.log(run, "Validation failed");
            let err = ProviderError::SchemaInvalid(errors.join("; "));
            return Err(StageFailure::new(
                StageName::Validate,
                classify(&err, CallKind::Llm),
                errors.join("; "),
            ));
        }
        Ok(())
    }

    /// Write `validation.json`, the llm_outputs row and the snapshot summary.
    fn store_validation(&self, run: &mut ActiveRun, outcome: &ValidationOutcome, stage: StageName) -> StageResult<()> {
        let paths = run.snapshot.artifacts.llm.clone();
        run.root
            .write_json(&paths.validation_path, outcome)
            .map_err(|e| StageFailure::storage(stage, e))?;
        self.db
            .upsert_llm_output(&LlmOutputRecord {
                run_id: run.run_id().to_string(),
                response_json_path: paths.response_parsed_path.clone(),
                response_valid: outcome.valid,
                schema_validation_errors_path: (!outcome.valid).then(|| paths.validation_path.clone()),
            })
            .map_err(|e| StageFailure::storage(stage, e))?;
        run.snapshot.validation = SnapshotValidation {
            valid: outcome.valid,
            errors: outcome.errors(),
        };
        Ok(())
    }

    // === Finalize ===

    fn finalize(&self, run: &mut ActiveRun) -> StageResult<()> {
        run.snapshot.set_stage(StageName::Finalize, StageStatus::Running);
        run.close_timings();
        self.db
            .update_run_metrics(run.run_id(), &run.metrics())
            .map_err(|e| StageFailure::storage(StageName::Finalize, e))?;
        self.log(run, "Run completed");
        run.snapshot.set_stage(StageName::Finalize, StageStatus::Completed);
        self.transition(run, RunStage::Completed, StageName::Finalize)?;
        self.record_artifact_refs(&run.root)
            .map_err(|e| StageFailure::storage(StageName::Finalize, e))?;
        self.db
            .update_run_status(run.run_id(), RunStatus::Completed, None, None)
            .map_err(|e| StageFailure::storage(StageName::Finalize, e))
    }

    fn record_artifact_refs(&self, root: &RunRoot) -> Result<usize, RunError> {
        let mut recorded = 0;
        for file in root.list_files()? {
            let Some((kind, doc_id)) = ArtifactKind::classify_path(&file.relative_path) else {
                continue;
            };
            self.db.add_artifact_ref(&ArtifactRefRecord {
                run_id: root.run_id().to_string(),
                doc_id,
                kind,
                relative_path: file.relative_path,
                metadata: json!({ "size_bytes": file.size_bytes }),
            })?;
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Persist failure state. Secondary failures are logged and swallowed.
    fn fail(&self, run: &mut ActiveRun, failure: StageFailure) {
        let message = failure.recorded_message();
        error!(
            "Run {} failed at stage {} ({}): {}",
            run.run_id(),
            failure.stage,
            failure.code,
            message
        );
        run.snapshot.record_failure(failure.stage, failure.code, &message);
        run.close_timings();
        self.log(run, &format!("Run failed at stage {}: {}", failure.stage, failure.code));

        if let Err(e) = self.db.update_run_metrics(run.run_id(), &run.metrics()) {
            error!("Run {}: failed to persist metrics after failure: {}", run.run_id(), e);
        }
        if let Err(e) = self.db.update_run_status(
            run.run_id(),
            RunStatus::Failed,
            Some(failure.code.as_str()),
            Some(&message),
        ) {
            error!("Run {}: failed to persist failed status: {}", run.run_id(), e);
        }
        if let Err(e) = run.snapshot.write(&run.root) {
            error!("Run {}: failed to write failure snapshot: {}", run.run_id(), e);
        }
        if let Err(e) = self.record_artifact_refs(&run.root) {
            error!("Run {}: failed to record artifact refs: {}", run.run_id(), e);
        }
    }
}

fn validate_request(request: &RunRequest) -> Result<(), RunError> {
    if request.input_files.is_empty() {
        return Err(RunError::InvalidRequest("At least one input file is required".to_string()));
    }
    for path in &request.input_files {
        if !path.is_file() {
            return Err(RunError::InvalidRequest(format!("Input file not found: {}", path.display())));
        }
    }
    if let Some(session_id) = &request.session_id {
        validate_identifier(session_id.trim()).map_err(|e| RunError::InvalidRequest(e.to_string()))?;
    }
    Ok(())
}

fn ensure_not_cancelled(cancel: &CancellationToken, next: StageName) -> StageResult<()> {
    if cancel.is_cancelled() {
        info!("Cancellation requested before stage {}", next);
        return Err(StageFailure::cancelled(next));
    }
    Ok(())
}

fn ocr_model_hint(request: &RunRequest) -> Option<String> {
    request
        .ocr_options
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn object_or_empty(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        Value::Object(Map::new())
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Remove a run root whose run row was never created.
fn discard_root(root: &RunRoot, reason: &dyn Display) {
    warn!("Run {}: creation failed, removing {}: {}", root.run_id(), root.path().display(), reason);
    if let Err(e) = root.delete_tree() {
        error!("Run {}: failed to remove orphaned run root: {}", root.run_id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_messages_are_stage_prefixed() {
        let failure = StageFailure::new(StageName::Llm, ErrorCode::LlmApiError, "HTTP 503");
        assert_eq!(failure.recorded_message(), "llm: HTTP 503");
        let cancelled = StageFailure::cancelled(StageName::Pack);
        assert_eq!(cancelled.recorded_message(), "Cancelled by user");
        assert_eq!(cancelled.code, ErrorCode::UnknownError);
    }

    #[test]
    fn test_context_limit_classifies_as_context_too_large() {
        let err = ProviderError::ContextTooLarge { chars: 10, limit: 5 };
        let failure = StageFailure::provider(StageName::Pack, CallKind::Llm, &err);
        assert_eq!(failure.code, ErrorCode::ContextTooLarge);
    }

    #[test]
    fn test_validate_request() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("a.pdf");
        std::fs::write(&file, b"%PDF").unwrap();
        let mut request = RunRequest {
            session_id: None,
            input_files: vec![],
            provider: "p".into(),
            model: "m".into(),
            prompt_name: "n".into(),
            prompt_version: "v1".into(),
            schema_version: None,
            system_prompt: String::new(),
            schema: json!({}),
            ocr_options: json!({}),
            llm_params: json!({}),
        };
        assert!(validate_request(&request).is_err());
        request.input_files = vec![temp.path().join("missing.pdf")];
        assert!(validate_request(&request).is_err());
        request.input_files = vec![file];
        assert!(validate_request(&request).is_ok());
        request.session_id = Some("../escape".into());
        assert!(validate_request(&request).is_err());
    }
}
