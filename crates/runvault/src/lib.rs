//! runvault: run lifecycle and artifact integrity for document-analysis runs.
//!
//! - `artifacts`: path-safe access to run trees under the data root
//! - `bundle`: deterministic export and integrity-checked restore
//! - `retention`: confirmed deletes and age-based sweeps
//! - `runner`: the stage orchestrator and its collaborator traits

pub mod artifacts;
pub mod bundle;
pub mod retention;
pub mod runner;

pub use artifacts::{ArtifactStore, RunRoot, StoreError};
pub use bundle::{export_run, RestoreOptions, RestoreReport, RestoreService};
pub use retention::{DeleteOptions, DeleteReport, RetentionOptions, RetentionReport, RetentionService};
pub use runner::{CancellationToken, Orchestrator, RunOutcome, RunRequest};
