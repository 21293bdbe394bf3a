use clap::Parser;
use qsync_config::shared::SyncerConfig;
use qsync_telemetry::init_tracing_with_job;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use crate::config::load_syncer_config;
use crate::core::start_checker_with_config;
use crate::pidfile::Pidfile;

mod config;
mod core;
mod pidfile;

/// Exit status of a run that ended on an error.
const FATAL_EXIT_CODE: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "qsync-checker")]
#[command(
    about = "Checks that tables replicated through a queue hold the same data on provider and subscriber",
    long_about = None
)]
struct Args {
    /// Path of the job's YAML configuration file
    config: PathBuf,

    /// Tables to check, every replicated table when none are given
    tables: Vec<String>,

    /// Keep waiting with a warning when the ticker or the consumer exceed their timeouts
    #[arg(long)]
    force: bool,

    /// Maximum time in seconds a table may stay locked, overrides the configuration
    #[arg(long)]
    lock_timeout: Option<f64>,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let config = load_syncer_config(&args.config, args.lock_timeout)?;

    // The job name tags every log line, several jobs usually share a host.
    let _log_flusher =
        init_tracing_with_job(env!("CARGO_BIN_NAME"), Some(config.job_name.clone()))?;

    let _pidfile = config.repair_pidfile().map(Pidfile::create).transpose()?;

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config, args.tables, args.force));

    Ok(ExitCode::from(exit_code))
}

async fn async_main(config: SyncerConfig, tables: Vec<String>, force: bool) -> u8 {
    match start_checker_with_config(config, tables, force).await {
        Ok(report) => {
            info!(
                bad_tables = report.bad_tables(),
                "consistency checker finished"
            );
            report.exit_code()
        }
        Err(err) => {
            error!("an error occurred in the consistency checker: {err:#}");
            FATAL_EXIT_CODE
        }
    }
}
