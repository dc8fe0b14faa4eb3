//! Terraform Cloud state backup job
//!
//! Backs up the current state of every workspace in an organization to S3.

// tfstate-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod utils;

use anyhow::{Context, Result};
use backup::model::RunSummary;
use config::{AppConfig, FailurePolicy, LoggingConfig, RawEnvConfig};
use std::env;
use std::process::ExitCode;
use tracing::{error, info, warn};

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
/// The run completed but counts as degraded under the failure policy.
const EXIT_DEGRADED: u8 = 2;

enum Mode {
    Backup,
    List,
}

/// Main entry point for the backup job
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let raw = RawEnvConfig::from_env();
    utils::logging::setup_logging(&LoggingConfig::from_raw(&raw));

    match run_app(&raw).await {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app(raw: &RawEnvConfig) -> Result<ExitCode> {
    let mode = match env::args().nth(1).as_deref().map(str::trim) {
        None | Some("backup") => Mode::Backup,
        Some("list") => Mode::List,
        Some(other) => anyhow::bail!("Unknown mode '{}'. Expected 'backup' or 'list'.", other),
    };

    let app_config = AppConfig::from_raw(raw).context("Invalid configuration")?;

    match mode {
        Mode::Backup => {
            let policy = app_config.backup.failure_policy;
            let outcome = backup::run_backup_flow(&app_config).await;
            let status = backup_exit_status(&outcome, policy);
            let summary = outcome?;
            if status == EXIT_DEGRADED {
                warn!(failed = summary.failed(), policy = ?policy, "backup run degraded");
            }
            return Ok(ExitCode::from(status));
        }
        Mode::List => {
            let workspaces = backup::run_list_flow(&app_config).await?;
            for ws in &workspaces {
                info!(workspace_id = %ws.id, workspace_name = %ws.name, "workspace has state");
            }
            info!(count = workspaces.len(), "workspaces with state files");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Fatal errors exit 1, a run degraded under `policy` exits 2, anything else 0.
fn backup_exit_status<E>(outcome: &std::result::Result<RunSummary, E>, policy: FailurePolicy) -> u8 {
    match outcome {
        Err(_) => EXIT_FATAL,
        Ok(summary) if summary.is_degraded(policy) => EXIT_DEGRADED,
        Ok(_) => EXIT_OK,
    }
}
