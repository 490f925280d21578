use super::{print_json, Workspace};
use anyhow::Result;
use runvault::bundle::{RestoreOptions, RestoreService};
use std::path::PathBuf;

pub struct RestoreArgs {
    pub archive: PathBuf,
    pub overwrite: bool,
    pub no_rollback: bool,
    pub verify_only: bool,
    pub require_signature: bool,
}

pub fn run(workspace: &Workspace, args: RestoreArgs) -> Result<bool> {
    let options = RestoreOptions {
        overwrite_existing: args.overwrite,
        rollback_on_metadata_failure: !args.no_rollback,
        verify_only: args.verify_only,
        // The flag only tightens; without it the configured default applies.
        require_signature: args.require_signature.then_some(true),
    };
    let service = RestoreService::new(&workspace.artifacts, &workspace.db, &workspace.config);
    let report = service.restore(&args.archive, &options);
    print_json(&report)?;
    Ok(report.is_success())
}
