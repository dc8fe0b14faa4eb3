// tfstate-backup/src/backup/tfc_api.rs
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use super::model::Workspace;
use crate::config::ApiConfig;
use crate::errors::{AppError, Result};

const JSON_API_MEDIA_TYPE: &str = "application/vnd.api+json";

/// One page of the organization's workspace listing.
#[derive(Debug, Clone, Default)]
pub struct WorkspacePage {
    pub workspaces: Vec<Workspace>,
    pub next_page: Option<u32>,
}

/// Calls made against the state-management API.
#[async_trait]
pub trait StateApi: Send + Sync {
    async fn list_workspaces_page(
        &self,
        organization: &str,
        page_number: u32,
        page_size: u32,
    ) -> Result<WorkspacePage>;

    /// Download URL of the workspace's current state, or `None` when it has none.
    async fn current_state_version(&self, workspace_id: &str) -> Result<Option<String>>;

    async fn download_state(&self, url: &str) -> Result<Bytes>;
}

#[derive(Debug, Deserialize)]
struct WorkspaceListDocument {
    data: Vec<WorkspaceResource>,
    #[serde(default)]
    meta: Option<ListMeta>,
}

#[derive(Debug, Deserialize)]
struct WorkspaceResource {
    id: String,
    attributes: WorkspaceAttributes,
}

#[derive(Debug, Deserialize)]
struct WorkspaceAttributes {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListMeta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Pagination {
    #[serde(default)]
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StateVersionDocument {
    data: StateVersionResource,
}

#[derive(Debug, Deserialize)]
struct StateVersionResource {
    attributes: StateVersionAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StateVersionAttributes {
    #[serde(default)]
    hosted_state_download_url: Option<String>,
}

pub fn parse_workspace_page(body: &[u8]) -> Result<WorkspacePage> {
    let doc: WorkspaceListDocument = serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedResponse(format!("workspace listing: {}", e)))?;

    Ok(WorkspacePage {
        workspaces: doc
            .data
            .into_iter()
            .map(|w| Workspace::new(w.id, w.attributes.name))
            .collect(),
        next_page: doc.meta.and_then(|m| m.pagination).and_then(|p| p.next_page),
    })
}

/// A state version without a hosted download URL counts as no state.
pub fn parse_state_version(body: &[u8]) -> Result<Option<String>> {
    let doc: StateVersionDocument = serde_json::from_slice(body)
        .map_err(|e| AppError::MalformedResponse(format!("current state version: {}", e)))?;

    Ok(doc
        .data
        .attributes
        .hosted_state_download_url
        .filter(|u| !u.trim().is_empty()))
}

/// Drops the query string, which may carry a signature, before a URL is logged.
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

/// HTTP client for the Terraform Cloud / Enterprise v2 API.
#[derive(Clone)]
pub struct TfcClient {
    http: Client,
    base_url: Url,
}

impl TfcClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| AppError::Config("TOKEN contains characters not allowed in a header".into()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_API_MEDIA_TYPE));
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_API_MEDIA_TYPE));

        let http = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(TfcClient {
            http,
            base_url: config.base_url.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("{} cannot be used as an API base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        self.http
            .get(url.clone())
            .send()
            .await
            .map_err(|source| AppError::Http {
                url: redact_url(url.as_str()),
                source,
            })
    }

    async fn read_body(url: &Url, response: reqwest::Response) -> Result<Bytes> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::status(&redact_url(url.as_str()), status.as_u16(), &body));
        }
        response.bytes().await.map_err(|source| AppError::Http {
            url: redact_url(url.as_str()),
            source,
        })
    }
}

#[async_trait]
impl StateApi for TfcClient {
    async fn list_workspaces_page(
        &self,
        organization: &str,
        page_number: u32,
        page_size: u32,
    ) -> Result<WorkspacePage> {
        let mut url = self.endpoint(&["organizations", organization, "workspaces"])?;
        url.query_pairs_mut()
            .append_pair("page[number]", &page_number.to_string())
            .append_pair("page[size]", &page_size.to_string());

        let response = self.get(url.clone()).await?;
        let body = Self::read_body(&url, response).await?;
        parse_workspace_page(&body)
    }

    async fn current_state_version(&self, workspace_id: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["workspaces", workspace_id, "current-state-version"])?;
        let response = self.get(url.clone()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::read_body(&url, response).await?;
        parse_state_version(&body)
    }

    async fn download_state(&self, url: &str) -> Result<Bytes> {
        let url = Url::parse(url).map_err(|e| {
            AppError::MalformedResponse(format!("hosted-state-download-url is not a URL: {}", e))
        })?;
        let response = self.get(url.clone()).await?;
        Self::read_body(&url, response).await
    }
}
