// tfstate-backup/src/backup/catalog.rs
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::model::Workspace;
use super::resolver::StateVersionResolver;
use super::tfc_api::StateApi;
use crate::errors::{AppError, Result};
use crate::utils::retry::RetryPolicy;

/// Workspaces of an organization split by whether they have state to back up.
#[derive(Debug, Default)]
pub struct Discovery {
    pub backupable: Vec<Workspace>,
    pub without_state: Vec<Workspace>,
    /// Workspaces whose state lookup failed.
    pub unresolved: Vec<(Workspace, AppError)>,
}

#[derive(Clone)]
pub struct WorkspaceCatalog {
    api: Arc<dyn StateApi>,
    resolver: StateVersionResolver,
    retry: RetryPolicy,
    page_size: u32,
    probe_concurrency: usize,
}

impl WorkspaceCatalog {
    pub fn new(
        api: Arc<dyn StateApi>,
        resolver: StateVersionResolver,
        retry: RetryPolicy,
        page_size: u32,
        probe_concurrency: usize,
    ) -> Self {
        WorkspaceCatalog {
            api,
            resolver,
            retry,
            page_size: page_size.max(1),
            probe_concurrency: probe_concurrency.max(1),
        }
    }

    /// Every workspace in the organization, following pagination to the end.
    /// Any page that cannot be fetched fails the whole listing.
    pub async fn list_workspaces(&self, organization: &str) -> Result<Vec<Workspace>> {
        let mut workspaces = Vec::new();
        let mut page_number = 1u32;

        loop {
            let page = self
                .retry
                .run("list workspaces", || {
                    self.api
                        .list_workspaces_page(organization, page_number, self.page_size)
                })
                .await?;

            debug!(
                organization,
                page_number,
                count = page.workspaces.len(),
                "fetched workspace page"
            );
            workspaces.extend(page.workspaces);

            match page.next_page {
                Some(next) if next > page_number => page_number = next,
                Some(next) => {
                    return Err(AppError::MalformedResponse(format!(
                        "workspace listing pagination did not advance (page {} pointed to {})",
                        page_number, next
                    )));
                }
                None => break,
            }
        }

        info!(organization, count = workspaces.len(), "listed workspaces");
        Ok(workspaces)
    }

    /// Lists the organization and probes every workspace for current state.
    pub async fn discover(&self, organization: &str) -> Result<Discovery> {
        let workspaces = self.list_workspaces(organization).await?;

        let probes: Vec<_> = stream::iter(workspaces)
            .map(|workspace| async move {
                let probe = self.resolver.resolve(&workspace).await;
                (workspace, probe)
            })
            .buffered(self.probe_concurrency)
            .collect()
            .await;

        let mut discovery = Discovery::default();
        for (workspace, probe) in probes {
            match probe {
                Ok(locator) if locator.present() => discovery.backupable.push(workspace),
                Ok(_) => discovery.without_state.push(workspace),
                Err(err) => {
                    warn!(
                        workspace_id = %workspace.id,
                        workspace_name = %workspace.name,
                        error = %err,
                        "failed to look up current state version"
                    );
                    discovery.unresolved.push((workspace, err));
                }
            }
        }

        let names: Vec<&str> = discovery.backupable.iter().map(|w| w.name.as_str()).collect();
        info!(
            organization,
            with_state = discovery.backupable.len(),
            without_state = discovery.without_state.len(),
            unresolved = discovery.unresolved.len(),
            workspaces = ?names,
            "discovered workspaces with state"
        );
        Ok(discovery)
    }

    /// Workspaces that have at least one state snapshot.
    pub async fn list_backupable_workspaces(&self, organization: &str) -> Result<Vec<Workspace>> {
        Ok(self.discover(organization).await?.backupable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{FakeState, FakeStateApi, fast_retry};

    fn catalog(api: Arc<FakeStateApi>, page_size: u32) -> WorkspaceCatalog {
        let resolver = StateVersionResolver::new(api.clone(), fast_retry(3));
        WorkspaceCatalog::new(api, resolver, fast_retry(3), page_size, 4)
    }

    fn ids(workspaces: &[Workspace]) -> Vec<&str> {
        workspaces.iter().map(|w| w.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_pagination_followed_to_completion() -> anyhow::Result<()> {
        let mut api = FakeStateApi::new();
        for i in 1..=7 {
            api = api.with_workspace(&format!("ws-{}", i), &format!("name-{}", i), FakeState::present("{}"));
        }
        let api = Arc::new(api);

        let listed = catalog(api.clone(), 3).list_workspaces("acme").await?;
        assert_eq!(ids(&listed), vec!["ws-1", "ws-2", "ws-3", "ws-4", "ws-5", "ws-6", "ws-7"]);
        assert_eq!(api.list_calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_workspaces_without_state_are_excluded() -> anyhow::Result<()> {
        let api = Arc::new(
            FakeStateApi::new()
                .with_workspace("ws-1", "a", FakeState::present("{}"))
                .with_workspace("ws-2", "b", FakeState::present("{}"))
                .with_workspace("ws-3", "c", FakeState::NoState),
        );

        let backupable = catalog(api, 100).list_backupable_workspaces("acme").await?;
        assert_eq!(ids(&backupable), vec!["ws-1", "ws-2"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_discovery_partitions_lookup_results() -> anyhow::Result<()> {
        let api = Arc::new(
            FakeStateApi::new()
                .with_workspace("ws-1", "a", FakeState::present("{}"))
                .with_workspace("ws-2", "b", FakeState::MalformedVersion)
                .with_workspace("ws-3", "c", FakeState::NoState)
                .with_workspace("ws-4", "d", FakeState::present("{}")),
        );

        let discovery = catalog(api, 2).discover("acme").await?;
        assert_eq!(ids(&discovery.backupable), vec!["ws-1", "ws-4"]);
        assert_eq!(ids(&discovery.without_state), vec!["ws-3"]);
        assert_eq!(discovery.unresolved.len(), 1);
        assert_eq!(discovery.unresolved[0].0.id, "ws-2");
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let api = Arc::new(
            FakeStateApi::new()
                .with_workspace("ws-1", "a", FakeState::present("{}"))
                .with_list_failure(500),
        );

        let result = catalog(api.clone(), 100).discover("acme").await;
        assert!(matches!(result, Err(AppError::Status { status: 500, .. })));
        // Retried up to the attempt cap, then given up.
        assert_eq!(api.list_calls(), 3);
        assert_eq!(api.resolve_calls("ws-1"), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_listing_not_retried() {
        let api = Arc::new(FakeStateApi::new().with_list_failure(401));

        let result = catalog(api.clone(), 100).list_workspaces("acme").await;
        assert!(matches!(result, Err(AppError::Status { status: 401, .. })));
        assert_eq!(api.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_pagination_that_does_not_advance_is_rejected() {
        let api = Arc::new(
            FakeStateApi::new()
                .with_workspace("ws-1", "a", FakeState::present("{}"))
                .with_stuck_pagination(),
        );

        let result = catalog(api.clone(), 100).list_workspaces("acme").await;
        assert!(matches!(result, Err(AppError::MalformedResponse(_))));
        assert_eq!(api.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_organization() -> anyhow::Result<()> {
        let api = Arc::new(FakeStateApi::new());
        let discovery = catalog(api, 100).discover("acme").await?;
        assert!(discovery.backupable.is_empty());
        assert!(discovery.without_state.is_empty());
        assert!(discovery.unresolved.is_empty());
        Ok(())
    }
}
