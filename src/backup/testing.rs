use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::model::Workspace;
use super::s3_upload::ArtifactStore;
use super::tfc_api::{StateApi, WorkspacePage};
use crate::errors::{AppError, Result};
use crate::utils::retry::RetryPolicy;

const DOWNLOAD_HOST: &str = "https://archivist.test/state/";

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

/// Scripted behaviour for one workspace.
#[derive(Debug, Clone)]
pub enum FakeState {
    Present(Bytes),
    NoState,
    /// Current-state-version answers with a document missing its attributes.
    MalformedVersion,
    /// Every download answers with this HTTP status.
    FetchFails(u16),
    /// Downloads never complete.
    FetchHangs,
}

impl FakeState {
    pub fn present(content: &str) -> Self {
        FakeState::Present(Bytes::copy_from_slice(content.as_bytes()))
    }
}

#[derive(Default)]
pub struct FakeStateApi {
    workspaces: Vec<Workspace>,
    states: HashMap<String, FakeState>,
    list_failure: Option<u16>,
    stuck_pagination: bool,
    resolve_failures: Mutex<HashMap<String, (u16, u32)>>,
    list_calls: AtomicU32,
    resolve_calls: Mutex<HashMap<String, u32>>,
    fetch_calls: Mutex<HashMap<String, u32>>,
}

impl FakeStateApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn download_url_for(workspace_id: &str) -> String {
        format!("{}{}?sig=abc", DOWNLOAD_HOST, workspace_id)
    }

    pub fn with_workspace(mut self, id: &str, name: &str, state: FakeState) -> Self {
        self.workspaces.push(Workspace::new(id, name));
        self.states.insert(id.to_string(), state);
        self
    }

    /// Every listing page answers with `status`.
    pub fn with_list_failure(mut self, status: u16) -> Self {
        self.list_failure = Some(status);
        self
    }

    /// Listing keeps pointing at the page it just returned.
    pub fn with_stuck_pagination(mut self) -> Self {
        self.stuck_pagination = true;
        self
    }

    /// The first `times` lookups for the workspace answer with `status`.
    pub fn with_resolve_failures(self, id: &str, status: u16, times: u32) -> Self {
        self.resolve_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), (status, times));
        self
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn resolve_calls(&self, id: &str) -> u32 {
        *self.resolve_calls.lock().unwrap().get(id).unwrap_or(&0)
    }

    pub fn fetch_calls(&self, id: &str) -> u32 {
        *self.fetch_calls.lock().unwrap().get(id).unwrap_or(&0)
    }

    fn bump(counter: &Mutex<HashMap<String, u32>>, id: &str) {
        *counter.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;
    }
}

#[async_trait]
impl StateApi for FakeStateApi {
    async fn list_workspaces_page(
        &self,
        organization: &str,
        page_number: u32,
        page_size: u32,
    ) -> Result<WorkspacePage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.list_failure {
            return Err(AppError::status(
                &format!("https://api.test/organizations/{}/workspaces", organization),
                status,
                "listing unavailable",
            ));
        }

        let size = page_size.max(1) as usize;
        let start = (page_number.max(1) as usize - 1) * size;
        let end = (start + size).min(self.workspaces.len());
        let workspaces = self.workspaces.get(start..end).unwrap_or_default().to_vec();

        let next_page = if self.stuck_pagination {
            Some(page_number)
        } else if end < self.workspaces.len() {
            Some(page_number + 1)
        } else {
            None
        };

        Ok(WorkspacePage {
            workspaces,
            next_page,
        })
    }

    async fn current_state_version(&self, workspace_id: &str) -> Result<Option<String>> {
        Self::bump(&self.resolve_calls, workspace_id);

        if let Some((status, remaining)) = self.resolve_failures.lock().unwrap().get_mut(workspace_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::status("https://api.test/current-state-version", *status, ""));
            }
        }

        match self.states.get(workspace_id) {
            None => Err(AppError::status("https://api.test/current-state-version", 403, "")),
            Some(FakeState::NoState) => Ok(None),
            Some(FakeState::MalformedVersion) => {
                Err(AppError::MalformedResponse("current state version: missing field `attributes`".into()))
            }
            Some(_) => Ok(Some(Self::download_url_for(workspace_id))),
        }
    }

    async fn download_state(&self, url: &str) -> Result<Bytes> {
        let id = url
            .strip_prefix(DOWNLOAD_HOST)
            .and_then(|rest| rest.split('?').next())
            .unwrap_or_default()
            .to_string();
        Self::bump(&self.fetch_calls, &id);

        match self.states.get(&id) {
            Some(FakeState::Present(content)) => Ok(content.clone()),
            Some(FakeState::FetchFails(status)) => Err(AppError::status(url, *status, "")),
            Some(FakeState::FetchHangs) => std::future::pending().await,
            _ => Err(AppError::status(url, 404, "")),
        }
    }
}

#[derive(Default)]
pub struct FakeArtifactStore {
    objects: Mutex<BTreeMap<String, Bytes>>,
    failures: Mutex<Vec<(String, bool, u32)>>,
    put_calls: AtomicU32,
}

impl FakeArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `times` puts whose key contains `fragment` fail.
    pub fn with_put_failures(self, fragment: &str, retryable: bool, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .push((fragment.to_string(), retryable, times));
        self
    }

    pub fn objects(&self) -> BTreeMap<String, Bytes> {
        self.objects.lock().unwrap().clone()
    }

    pub fn put_calls(&self) -> u32 {
        self.put_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifactStore {
    async fn put_object(&self, key: &str, body: Bytes, _content_type: &str) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        for (fragment, retryable, remaining) in self.failures.lock().unwrap().iter_mut() {
            if key.contains(fragment.as_str()) && *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::Storage {
                    message: format!("injected failure for {}", key),
                    retryable: *retryable,
                });
            }
        }

        self.objects.lock().unwrap().insert(key.to_string(), body);
        Ok(())
    }
}
