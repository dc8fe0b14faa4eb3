// tfstate-backup/src/backup/resolver.rs
use std::sync::Arc;
use tracing::debug;

use super::model::Workspace;
use super::tfc_api::StateApi;
use crate::errors::Result;
use crate::utils::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLocator {
    pub workspace_id: String,
    /// Short-lived download URL; `None` when the workspace has no state yet.
    pub retrieval_url: Option<String>,
}

impl StateLocator {
    pub fn present(&self) -> bool {
        self.retrieval_url.is_some()
    }
}

/// Looks up the current state version of a workspace.
#[derive(Clone)]
pub struct StateVersionResolver {
    api: Arc<dyn StateApi>,
    retry: RetryPolicy,
}

impl StateVersionResolver {
    pub fn new(api: Arc<dyn StateApi>, retry: RetryPolicy) -> Self {
        StateVersionResolver { api, retry }
    }

    /// A workspace that never had state resolves to a locator with `present() == false`.
    /// Any other failure is returned to the caller once retries are exhausted.
    pub async fn resolve(&self, workspace: &Workspace) -> Result<StateLocator> {
        let retrieval_url = self
            .retry
            .run("resolve current state version", || {
                self.api.current_state_version(&workspace.id)
            })
            .await?;

        debug!(
            workspace_id = %workspace.id,
            present = retrieval_url.is_some(),
            "resolved current state version"
        );

        Ok(StateLocator {
            workspace_id: workspace.id.clone(),
            retrieval_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{FakeState, FakeStateApi, fast_retry};
    use crate::errors::AppError;

    #[tokio::test]
    async fn test_present_state_yields_url() -> anyhow::Result<()> {
        let api = Arc::new(FakeStateApi::new().with_workspace("ws-1", "a", FakeState::present("{}")));
        let resolver = StateVersionResolver::new(api, fast_retry(3));

        let locator = resolver.resolve(&Workspace::new("ws-1", "a")).await?;
        assert!(locator.present());
        assert_eq!(locator.workspace_id, "ws-1");
        assert_eq!(
            locator.retrieval_url.as_deref(),
            Some(FakeStateApi::download_url_for("ws-1").as_str())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_state_is_not_an_error() -> anyhow::Result<()> {
        let api = Arc::new(FakeStateApi::new().with_workspace("ws-3", "c", FakeState::NoState));
        let resolver = StateVersionResolver::new(api.clone(), fast_retry(3));

        let locator = resolver.resolve(&Workspace::new("ws-3", "c")).await?;
        assert!(!locator.present());
        assert_eq!(api.resolve_calls("ws-3"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() -> anyhow::Result<()> {
        let api = Arc::new(
            FakeStateApi::new()
                .with_workspace("ws-1", "a", FakeState::present("{}"))
                .with_resolve_failures("ws-1", 429, 2),
        );
        let resolver = StateVersionResolver::new(api.clone(), fast_retry(3));

        let locator = resolver.resolve(&Workspace::new("ws-1", "a")).await?;
        assert!(locator.present());
        assert_eq!(api.resolve_calls("ws-1"), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_payload_fails_without_retry() {
        let api = Arc::new(FakeStateApi::new().with_workspace("ws-1", "a", FakeState::MalformedVersion));
        let resolver = StateVersionResolver::new(api.clone(), fast_retry(3));

        let result = resolver.resolve(&Workspace::new("ws-1", "a")).await;
        assert!(matches!(result, Err(AppError::MalformedResponse(_))));
        assert_eq!(api.resolve_calls("ws-1"), 1);
    }
}
