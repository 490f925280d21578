use super::{print_json, Workspace};
use anyhow::Result;
use runvault::retention::{DeleteOptions, RetentionService};
use std::path::PathBuf;

pub struct DeleteArgs {
    pub run_id: String,
    pub confirm: String,
    pub backup_first: bool,
    pub backup_dir: Option<PathBuf>,
}

pub fn run(workspace: &Workspace, args: DeleteArgs) -> Result<bool> {
    let service = RetentionService::new(&workspace.artifacts, &workspace.db, &workspace.config);
    let options = DeleteOptions {
        backup_first: args.backup_first,
        backup_dir: args.backup_dir,
    };
    let report = service.delete_run(&args.run_id, &args.confirm, &options);
    print_json(&report)?;
    Ok(report.deleted)
}
