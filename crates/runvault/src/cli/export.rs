use super::{print_json, Workspace};
use anyhow::Result;
use runvault::bundle::{export_by_id, ExportOptions};
use std::path::PathBuf;

pub struct ExportArgs {
    pub run_id: String,
    pub output_dir: Option<PathBuf>,
}

pub fn run(workspace: &Workspace, args: ExportArgs) -> Result<bool> {
    let options = ExportOptions {
        output_dir: args.output_dir,
        signing_key: workspace.config.signing_key.clone(),
        lock_timeout: workspace.config.lock_timeout,
    };
    let report = export_by_id(&workspace.artifacts, &workspace.db, args.run_id.trim(), &options);
    print_json(&report)?;
    Ok(report.is_success())
}
