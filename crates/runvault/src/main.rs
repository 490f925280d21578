//! runvault command-line entry point.
//!
//! Export, restore, delete and purge runs, and probe the error classifier.
//! Reports go to stdout as JSON; logs go to stderr and the rolling log file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use runvault_logging::{init_logging, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

mod cli;

use cli::classify::{ErrorArg, KindArg};
use cli::Workspace;

#[derive(Parser, Debug)]
#[command(name = "runvault", version, about = "Run backup, restore and retention for document-analysis runs")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Data root holding run trees (overrides RUNVAULT_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// SQLite metadata database (overrides RUNVAULT_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export a run to <run_id>_bundle.zip
    Export {
        run_id: String,

        /// Directory for the archive (default: next to the run root)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Verify and restore a run bundle
    Restore {
        archive: PathBuf,

        /// Replace an existing run with the same id
        #[arg(long)]
        overwrite: bool,

        /// Keep restored files when the metadata write fails
        #[arg(long)]
        no_rollback: bool,

        /// Run every check without writing anything
        #[arg(long)]
        verify_only: bool,

        /// Fail unless the bundle carries a valid signature
        #[arg(long)]
        require_signature: bool,
    },

    /// Delete a run's metadata and artifacts
    Delete {
        run_id: String,

        /// Must repeat the run id exactly
        #[arg(long)]
        confirm: String,

        /// Export the run before deleting it
        #[arg(long)]
        backup_first: bool,

        /// Directory for the backup archive (default: <data_dir>/backups)
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },

    /// Delete every run created at least N days ago
    Purge {
        #[arg(long, allow_negative_numbers = true)]
        days: i64,

        /// List candidates without deleting
        #[arg(long)]
        dry_run: bool,

        /// Export each run before deleting it
        #[arg(long)]
        export_before_delete: bool,

        /// Directory for exports (default: <data_dir>/backups)
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Also write the JSON report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show the error code and retry decision for a provider failure
    Classify {
        #[arg(long, value_enum)]
        kind: KindArg,

        /// HTTP status returned by the provider
        #[arg(long, conflicts_with = "error")]
        status: Option<u16>,

        /// Failure category
        #[arg(long, value_enum)]
        error: Option<ErrorArg>,
    },
}

fn run_command(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Classify { kind, status, error } => {
            cli::classify::run(cli::classify::ClassifyArgs { kind, status, error })
        }
        Commands::Export { run_id, output_dir } => {
            let workspace = Workspace::open(cli.data_dir, cli.db)?;
            cli::export::run(&workspace, cli::export::ExportArgs { run_id, output_dir })
        }
        Commands::Restore {
            archive,
            overwrite,
            no_rollback,
            verify_only,
            require_signature,
        } => {
            let workspace = Workspace::open(cli.data_dir, cli.db)?;
            cli::restore::run(
                &workspace,
                cli::restore::RestoreArgs {
                    archive,
                    overwrite,
                    no_rollback,
                    verify_only,
                    require_signature,
                },
            )
        }
        Commands::Delete {
            run_id,
            confirm,
            backup_first,
            backup_dir,
        } => {
            let workspace = Workspace::open(cli.data_dir, cli.db)?;
            cli::delete::run(
                &workspace,
                cli::delete::DeleteArgs {
                    run_id,
                    confirm,
                    backup_first,
                    backup_dir,
                },
            )
        }
        Commands::Purge {
            days,
            dry_run,
            export_before_delete,
            export_dir,
            report,
        } => {
            let workspace = Workspace::open(cli.data_dir, cli.db)?;
            cli::purge::run(
                &workspace,
                cli::purge::PurgeArgs {
                    days,
                    dry_run,
                    export_before_delete,
                    export_dir,
                    report,
                },
            )
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(LogConfig {
        app_name: "runvault",
        verbose: cli.verbose,
        log_dir: None,
    }) {
        eprintln!("Warning: failed to initialize logging: {:#}", err);
    }

    match run_command(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!("Command failed: {:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}
