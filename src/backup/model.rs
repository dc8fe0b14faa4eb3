// tfstate-backup/src/backup/model.rs
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, info};

use crate::config::FailurePolicy;

/// A workspace as listed by the state API. Fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
}

impl Workspace {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Workspace {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Pipeline stage a workspace was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovered,
    Resolving,
    Fetching,
    Packaging,
    Uploading,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovered => "discovered",
            Stage::Resolving => "resolving",
            Stage::Fetching => "fetching",
            Stage::Packaging => "packaging",
            Stage::Uploading => "uploading",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    BackedUp {
        key: String,
        content_bytes: usize,
        archive_bytes: usize,
        sha256: String,
    },
    /// The workspace has no state snapshot yet.
    Skipped,
    Failed { stage: Stage, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceReport {
    pub workspace: Workspace,
    pub outcome: RunOutcome,
}

impl WorkspaceReport {
    pub fn new(workspace: Workspace, outcome: RunOutcome) -> Self {
        WorkspaceReport { workspace, outcome }
    }

    pub fn skipped(workspace: Workspace) -> Self {
        Self::new(workspace, RunOutcome::Skipped)
    }

    pub fn failed(workspace: Workspace, stage: Stage, reason: impl Into<String>) -> Self {
        Self::new(
            workspace,
            RunOutcome::Failed {
                stage,
                reason: reason.into(),
            },
        )
    }

    /// One structured line per workspace outcome.
    pub fn log(&self) {
        let ws = &self.workspace;
        match &self.outcome {
            RunOutcome::BackedUp {
                key,
                content_bytes,
                archive_bytes,
                sha256,
            } => info!(
                workspace_id = %ws.id,
                workspace_name = %ws.name,
                outcome = "backed_up",
                key = %key,
                content_bytes,
                archive_bytes,
                sha256 = %sha256,
                "workspace state backed up"
            ),
            RunOutcome::Skipped => info!(
                workspace_id = %ws.id,
                workspace_name = %ws.name,
                outcome = "skipped",
                "workspace has no state snapshot, skipping"
            ),
            RunOutcome::Failed { stage, reason } => error!(
                workspace_id = %ws.id,
                workspace_name = %ws.name,
                outcome = "failed",
                stage = %stage,
                reason = %reason,
                "workspace backup failed"
            ),
        }
    }
}

/// Collects one report per workspace from concurrently running pipelines.
#[derive(Debug, Clone, Default)]
pub struct OutcomeCollector {
    reports: Arc<Mutex<Vec<WorkspaceReport>>>,
}

impl OutcomeCollector {
    pub fn record(&self, report: WorkspaceReport) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }

    pub fn summary(&self) -> RunSummary {
        let reports = self
            .reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        RunSummary::from_reports(reports)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub reports: Vec<WorkspaceReport>,
}

impl RunSummary {
    /// Reports are ordered by workspace id so output does not depend on scheduling.
    pub fn from_reports(mut reports: Vec<WorkspaceReport>) -> Self {
        reports.sort_by(|a, b| a.workspace.id.cmp(&b.workspace.id));
        RunSummary { reports }
    }

    pub fn backed_up(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::BackedUp { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RunOutcome::Failed { .. }))
    }

    pub fn outcome_of(&self, workspace_id: &str) -> Option<&RunOutcome> {
        self.reports
            .iter()
            .find(|r| r.workspace.id == workspace_id)
            .map(|r| &r.outcome)
    }

    pub fn is_degraded(&self, policy: FailurePolicy) -> bool {
        match policy {
            FailurePolicy::Any => self.failed() > 0,
            FailurePolicy::Total => self.failed() > 0 && self.backed_up() == 0,
            FailurePolicy::Never => false,
        }
    }

    fn count(&self, pred: impl Fn(&RunOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }
}
