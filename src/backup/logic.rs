// tfstate-backup/src/backup/logic.rs
use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::archive::{self, ArchiveArtifact};
use super::catalog::WorkspaceCatalog;
use super::model::{OutcomeCollector, RunOutcome, RunSummary, Stage, Workspace, WorkspaceReport};
use super::object_key::{KeyFormatter, ObjectKey, RunTimestamp};
use super::resolver::{StateLocator, StateVersionResolver};
use super::s3_upload::{ArtifactStore, Uploader};
use super::tfc_api::{StateApi, redact_url};
use crate::config::BackupConfig;
use crate::errors::{AppError, Result};
use crate::utils::retry::RetryPolicy;

const TIMEOUT_REASON: &str = "timeout: run deadline expired";

/// Where a workspace pipeline currently is. Terminal states are `RunOutcome`s.
#[derive(Debug)]
enum PipelineState {
    Discovered,
    Resolving,
    Fetching(StateLocator),
    Packaging(Bytes),
    Uploading { key: ObjectKey, artifact: ArchiveArtifact },
}

impl PipelineState {
    fn stage(&self) -> Stage {
        match self {
            PipelineState::Discovered => Stage::Discovered,
            PipelineState::Resolving => Stage::Resolving,
            PipelineState::Fetching(_) => Stage::Fetching,
            PipelineState::Packaging(_) => Stage::Packaging,
            PipelineState::Uploading { .. } => Stage::Uploading,
        }
    }
}

enum Step {
    Continue(PipelineState),
    Finish(RunOutcome),
}

fn fail(stage: Stage, err: AppError) -> Step {
    Step::Finish(RunOutcome::Failed {
        stage,
        reason: err.to_string(),
    })
}

/// Everything one workspace needs to go from discovered to uploaded.
#[derive(Clone)]
struct Pipeline {
    organization: String,
    api: Arc<dyn StateApi>,
    resolver: StateVersionResolver,
    uploader: Uploader,
    retry: RetryPolicy,
    keys: KeyFormatter,
    clock: fn() -> RunTimestamp,
}

impl Pipeline {
    async fn run(&self, workspace: &Workspace, cancel: &CancellationToken) -> RunOutcome {
        let mut state = PipelineState::Discovered;
        loop {
            let stage = state.stage();
            debug!(workspace_id = %workspace.id, stage = %stage, "entering stage");

            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Finish(RunOutcome::Failed {
                    stage,
                    reason: TIMEOUT_REASON.to_string(),
                }),
                step = self.advance(workspace, state) => step,
            };

            match step {
                Step::Continue(next) => state = next,
                Step::Finish(outcome) => return outcome,
            }
        }
    }

    /// Performs the work of `state` and moves to the next one. Stages only ever move forward.
    async fn advance(&self, workspace: &Workspace, state: PipelineState) -> Step {
        match state {
            PipelineState::Discovered => Step::Continue(PipelineState::Resolving),

            // Download URLs are short-lived, so the lookup done during discovery is not reused.
            PipelineState::Resolving => match self.resolver.resolve(workspace).await {
                Ok(locator) if locator.present() => Step::Continue(PipelineState::Fetching(locator)),
                Ok(_) => Step::Finish(RunOutcome::Skipped),
                Err(err) => fail(Stage::Resolving, err),
            },

            PipelineState::Fetching(locator) => match self.fetch(&locator).await {
                Ok(content) => Step::Continue(PipelineState::Packaging(content)),
                Err(err) => fail(Stage::Fetching, err),
            },

            PipelineState::Packaging(content) => match self.package(workspace, content).await {
                Ok(artifact) => {
                    let key = self
                        .keys
                        .key_for(workspace, &self.organization, (self.clock)());
                    Step::Continue(PipelineState::Uploading { key, artifact })
                }
                Err(err) => fail(Stage::Packaging, err),
            },

            PipelineState::Uploading { key, artifact } => {
                match self.uploader.upload(&key, &artifact).await {
                    Ok(()) => Step::Finish(RunOutcome::BackedUp {
                        key: key.to_string(),
                        content_bytes: artifact.content_len,
                        archive_bytes: artifact.bytes.len(),
                        sha256: artifact.sha256,
                    }),
                    Err(err) => fail(Stage::Uploading, err),
                }
            }
        }
    }

    /// Compression and read-back verification run on the blocking pool.
    async fn package(&self, workspace: &Workspace, content: Bytes) -> Result<ArchiveArtifact> {
        let workspace_id = workspace.id.clone();
        tokio::task::spawn_blocking(move || archive::package(&workspace_id, &content))
            .await
            .map_err(|e| AppError::Archive(format!("packaging task did not complete: {}", e)))?
    }

    async fn fetch(&self, locator: &StateLocator) -> Result<Bytes> {
        let url = locator.retrieval_url.as_deref().ok_or_else(|| {
            AppError::MalformedResponse(format!(
                "no download URL for workspace {}",
                locator.workspace_id
            ))
        })?;

        let content = self
            .retry
            .run("download state", || self.api.download_state(url))
            .await?;

        debug!(
            workspace_id = %locator.workspace_id,
            url = %redact_url(url),
            bytes = content.len(),
            "downloaded state"
        );
        Ok(content)
    }
}

/// Runs one backup pass over every workspace of an organization.
pub struct BackupOrchestrator {
    catalog: WorkspaceCatalog,
    pipeline: Pipeline,
    concurrency: usize,
    run_timeout: Option<Duration>,
}

impl BackupOrchestrator {
    /// # Arguments
    /// * `organization` - Organization whose workspaces are backed up.
    /// * `backup` - Concurrency, deadline and key layout.
    /// * `retry` - Applied to every network call.
    /// * `page_size` - Workspaces requested per listing page.
    /// * `api` / `store` - State API and object store the run talks to.
    pub fn new(
        organization: impl Into<String>,
        backup: &BackupConfig,
        retry: RetryPolicy,
        page_size: u32,
        api: Arc<dyn StateApi>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let concurrency = backup.concurrency.max(1);
        let resolver = StateVersionResolver::new(api.clone(), retry.clone());
        let catalog = WorkspaceCatalog::new(
            api.clone(),
            resolver.clone(),
            retry.clone(),
            page_size,
            concurrency,
        );

        BackupOrchestrator {
            catalog,
            pipeline: Pipeline {
                organization: organization.into(),
                api,
                resolver,
                uploader: Uploader::new(store, retry.clone()),
                retry,
                keys: KeyFormatter::new(backup.key_prefix.clone(), backup.key_include_workspace_name),
                clock: RunTimestamp::now,
            },
            concurrency,
            run_timeout: backup.run_timeout,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> RunTimestamp) -> Self {
        self.pipeline.clock = clock;
        self
    }

    pub fn catalog(&self) -> &WorkspaceCatalog {
        &self.catalog
    }

    /// Discovers workspaces and backs up each one with state.
    ///
    /// Only a failure to list the organization, or a deadline that expires before
    /// the listing completes, is returned as an error. Everything that goes wrong
    /// for a single workspace ends up in the summary instead.
    pub async fn run(&self) -> Result<RunSummary> {
        let organization = self.pipeline.organization.as_str();
        let deadline = self.run_timeout.map(|t| Instant::now() + t);
        info!(
            organization,
            concurrency = self.concurrency,
            run_timeout_secs = self.run_timeout.map(|t| t.as_secs()),
            "starting backup run"
        );

        let discovery = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.catalog.discover(organization))
                .await
                .map_err(|_| AppError::Timeout("run deadline expired during workspace discovery".into()))??,
            None => self.catalog.discover(organization).await?,
        };

        let collector = OutcomeCollector::default();
        for workspace in discovery.without_state {
            let report = WorkspaceReport::skipped(workspace);
            report.log();
            collector.record(report);
        }
        for (workspace, err) in discovery.unresolved {
            let report = WorkspaceReport::failed(workspace, Stage::Resolving, err.to_string());
            report.log();
            collector.record(report);
        }

        let cancel = CancellationToken::new();
        let deadline_guard = deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                cancel.cancel();
            })
        });

        self.run_pipelines(discovery.backupable, &collector, &cancel).await;

        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        let summary = collector.summary();
        info!(
            organization,
            backed_up = summary.backed_up(),
            skipped = summary.skipped(),
            failed = summary.failed(),
            "backup run finished"
        );
        Ok(summary)
    }

    /// Bounded worker pool: at most `concurrency` pipelines in flight.
    async fn run_pipelines(
        &self,
        workspaces: Vec<Workspace>,
        collector: &OutcomeCollector,
        cancel: &CancellationToken,
    ) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for workspace in workspaces {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                let report = WorkspaceReport::failed(workspace, Stage::Discovered, TIMEOUT_REASON);
                report.log();
                collector.record(report);
                continue;
            };

            let pipeline = self.pipeline.clone();
            let collector = collector.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(pipeline.run(&workspace, &cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| RunOutcome::Failed {
                        stage: Stage::Discovered,
                        reason: "pipeline panicked".to_string(),
                    });
                drop(permit);

                let report = WorkspaceReport::new(workspace, outcome);
                report.log();
                collector.record(report);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("backup task did not complete: {}", e);
            }
        }
    }
}
