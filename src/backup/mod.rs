pub(crate) mod archive;
pub(crate) mod catalog;
pub(crate) mod logic;
pub(crate) mod model;
pub(crate) mod object_key;
pub(crate) mod resolver;
pub(crate) mod s3_upload;
pub(crate) mod tfc_api;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::utils::retry::RetryPolicy;
use logic::BackupOrchestrator;
use model::{RunSummary, Workspace};
use s3_upload::S3ArtifactStore;
use tfc_api::TfcClient;

async fn build_orchestrator(app_config: &AppConfig) -> Result<BackupOrchestrator> {
    let api = TfcClient::new(&app_config.api).context("Failed to build the state API client")?;
    let store = S3ArtifactStore::from_config(&app_config.storage).await;

    Ok(BackupOrchestrator::new(
        app_config.organization.clone(),
        &app_config.backup,
        RetryPolicy::from_config(&app_config.retry),
        app_config.api.page_size,
        Arc::new(api),
        Arc::new(store),
    ))
}

/// Public entry point for a backup run.
pub async fn run_backup_flow(app_config: &AppConfig) -> Result<RunSummary> {
    let orchestrator = build_orchestrator(app_config).await?;
    orchestrator
        .run()
        .await
        .with_context(|| format!("Backup of organization {} aborted", app_config.organization))
}

/// Discovery only: the workspaces that currently have state. Nothing is uploaded.
pub async fn run_list_flow(app_config: &AppConfig) -> Result<Vec<Workspace>> {
    let orchestrator = build_orchestrator(app_config).await?;
    orchestrator
        .catalog()
        .list_backupable_workspaces(&app_config.organization)
        .await
        .with_context(|| format!("Failed to list workspaces of {}", app_config.organization))
}
