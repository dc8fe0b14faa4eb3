// tfstate-backup/src/backup/object_key.rs
use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;

use super::model::Workspace;

/// Whole-second UTC instant captured once per workspace backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunTimestamp(DateTime<Utc>);

impl RunTimestamp {
    pub fn now() -> Self {
        RunTimestamp(Utc::now().trunc_subsecs(0))
    }

    pub fn from_unix(secs: i64) -> Option<Self> {
        DateTime::from_timestamp(secs, 0).map(RunTimestamp)
    }

    pub fn unix(&self) -> i64 {
        self.0.timestamp()
    }

    /// Partition date, `YYYY-MM-DD` in UTC.
    pub fn date(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
}

/// Destination of one archive:
/// `{prefix}/{YYYY-MM-DD}/terraform-{organization}/{unix_ts}_{workspace}-backup.zip`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub prefix: String,
    pub date: String,
    pub organization: String,
    pub run_timestamp: i64,
    pub workspace_label: String,
}

impl ObjectKey {
    pub const EXTENSION: &'static str = ".zip";

    pub fn partition(&self) -> String {
        format!("{}/{}/terraform-{}", self.prefix, self.date, self.organization)
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}-backup{}",
            self.run_timestamp,
            self.workspace_label,
            Self::EXTENSION
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition(), self.file_name())
    }
}

/// Pure: the same inputs always give the same key.
pub fn format_key(
    prefix: &str,
    workspace_label: &str,
    organization: &str,
    run_timestamp: RunTimestamp,
) -> ObjectKey {
    ObjectKey {
        prefix: prefix.to_string(),
        date: run_timestamp.date(),
        organization: organization.to_string(),
        run_timestamp: run_timestamp.unix(),
        workspace_label: workspace_label.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct KeyFormatter {
    prefix: String,
    include_workspace_name: bool,
}

impl KeyFormatter {
    pub fn new(prefix: impl Into<String>, include_workspace_name: bool) -> Self {
        KeyFormatter {
            prefix: prefix.into(),
            include_workspace_name,
        }
    }

    pub fn key_for(
        &self,
        workspace: &Workspace,
        organization: &str,
        run_timestamp: RunTimestamp,
    ) -> ObjectKey {
        let label = if self.include_workspace_name {
            format!("{}_{}", workspace.name, workspace.id)
        } else {
            workspace.id.clone()
        };
        format_key(&self.prefix, &label, organization, run_timestamp)
    }
}
