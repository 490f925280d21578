use super::{print_json, Workspace};
use anyhow::{Context, Result};
use runvault::retention::{RetentionOptions, RetentionService};
use std::path::PathBuf;

pub struct PurgeArgs {
    pub days: i64,
    pub dry_run: bool,
    pub export_before_delete: bool,
    pub export_dir: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

pub fn run(workspace: &Workspace, args: PurgeArgs) -> Result<bool> {
    let service = RetentionService::new(&workspace.artifacts, &workspace.db, &workspace.config);
    let options = RetentionOptions {
        dry_run: args.dry_run,
        export_before_delete: args.export_before_delete,
        export_dir: args.export_dir,
        report_path: args.report,
    };
    let report = service
        .purge_older_than(args.days, &options)
        .context("Retention sweep failed")?;
    print_json(&report)?;
    Ok(report.failed_runs == 0)
}
