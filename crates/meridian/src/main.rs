//! Meridian launcher.
//!
//! `run` starts the core runtime (recovery, router, worker pool) against a
//! data directory; `update` snapshots the data directory before handing off
//! to the external updater; `rollback` restores the latest snapshot.

use anyhow::Result;
use clap::{Parser, Subcommand};
use meridian_protocol::{DataDir, MeridianConfig};
use std::path::PathBuf;
use std::process::ExitCode;

mod planner;
mod runtime;
mod update;

#[derive(Parser, Debug)]
#[command(name = "meridian", about = "Local-first autonomous agent runtime")]
struct Cli {
    /// Data directory (default: $MERIDIAN_HOME, else ~/.meridian)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Project root for relative workspace paths
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Verbose logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the runtime
    Run {
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Back up the data directory, then apply an update
    Update {
        /// Only report whether an update is available
        #[arg(long)]
        check: bool,
    },
    /// Restore the most recent pre-update backup
    Rollback,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    let data_dir = DataDir::resolve(cli.data_dir.clone());
    data_dir.ensure()?;

    meridian_logging::init_logging(meridian_logging::LogConfig {
        app_name: "meridian",
        log_dir: data_dir.logs_dir(),
        verbose: cli.verbose,
    })?;

    let mut config = MeridianConfig::load(&data_dir.config_file())?;
    // A relative workspace path is anchored at the project root when given.
    if let (Some(root), Some(workspace)) = (&cli.project_root, &config.workspace_path) {
        if workspace.is_relative() {
            config.workspace_path = Some(root.join(workspace));
        }
    }

    match cli.command {
        Commands::Run { workers } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(runtime::run(data_dir, config, workers))
        }
        Commands::Update { check } => {
            if check {
                return update::check();
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(update::update(&data_dir))
        }
        Commands::Rollback => update::rollback(&data_dir),
    }
}
