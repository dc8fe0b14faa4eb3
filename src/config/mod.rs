// tfstate-backup/src/config/mod.rs
use anyhow::{Context, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_API_URL: &str = "https://app.terraform.io/api/v2";
const DEFAULT_KEY_PREFIX: &str = "terraform_cloud";
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
// The workspaces endpoint caps page[size] at 100.
const MAX_PAGE_SIZE: u32 = 100;

/// Environment values as found, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawEnvConfig {
    pub organization: Option<String>,
    pub s3_bucket: Option<String>,
    pub token: Option<String>,
    pub api_url: Option<String>,
    pub concurrency: Option<String>,
    pub max_attempts: Option<String>,
    pub retry_base_delay_ms: Option<String>,
    pub retry_max_delay_secs: Option<String>,
    pub request_timeout_secs: Option<String>,
    pub run_timeout_secs: Option<String>,
    pub failure_policy: Option<String>,
    pub key_prefix: Option<String>,
    pub key_include_workspace_name: Option<String>,
    pub page_size: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint_url: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
}

impl RawEnvConfig {
    /// Reads every known variable through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        RawEnvConfig {
            organization: get("ORGANIZATION"),
            s3_bucket: get("S3_BUCKET"),
            token: get("TOKEN"),
            api_url: get("TFC_API_URL"),
            concurrency: get("BACKUP_CONCURRENCY"),
            max_attempts: get("MAX_ATTEMPTS"),
            retry_base_delay_ms: get("RETRY_BASE_DELAY_MS"),
            retry_max_delay_secs: get("RETRY_MAX_DELAY_SECS"),
            request_timeout_secs: get("REQUEST_TIMEOUT_SECS"),
            run_timeout_secs: get("RUN_TIMEOUT_SECS"),
            failure_policy: get("FAILURE_POLICY"),
            key_prefix: get("S3_KEY_PREFIX"),
            key_include_workspace_name: get("KEY_INCLUDE_WORKSPACE_NAME"),
            page_size: get("WORKSPACE_PAGE_SIZE"),
            log_level: get("LOG_LEVEL"),
            log_format: get("LOG_FORMAT"),
            s3_region: get("S3_REGION").or_else(|| get("AWS_REGION")),
            s3_endpoint_url: get("S3_ENDPOINT_URL"),
            s3_access_key_id: get("S3_ACCESS_KEY_ID"),
            s3_secret_access_key: get("S3_SECRET_ACCESS_KEY"),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// When a run that finished with per-workspace failures counts as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Any failed workspace fails the run.
    #[default]
    Any,
    /// Only fail when something failed and nothing was backed up.
    Total,
    /// Per-workspace failures never fail the run.
    Never,
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(FailurePolicy::Any),
            "total" => Ok(FailurePolicy::Total),
            "never" => Ok(FailurePolicy::Never),
            other => Err(anyhow::anyhow!(
                "FAILURE_POLICY must be one of 'any', 'total' or 'never', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow::anyhow!("LOG_FORMAT must be 'compact' or 'json', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: LogFormat,
}

impl LoggingConfig {
    /// An unknown LOG_FORMAT falls back to the default.
    pub fn from_raw(raw: &RawEnvConfig) -> Self {
        LoggingConfig {
            level: raw.log_level.clone(),
            format: raw
                .log_format
                .as_deref()
                .and_then(|f| f.parse().ok())
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct StorageConfig {
    pub bucket_name: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub static_credentials: Option<(String, String)>,
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field(
                "static_credentials",
                &self.static_credentials.as_ref().map(|(id, _)| (id.as_str(), "<redacted>")),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

#[derive(Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub token: String,
    pub request_timeout: Duration,
    pub page_size: u32,
}

impl fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url.as_str())
            .field("token", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub concurrency: usize,
    pub run_timeout: Option<Duration>,
    pub failure_policy: FailurePolicy,
    pub key_prefix: String,
    pub key_include_workspace_name: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub organization: String,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub backup: BackupConfig,
}

impl AppConfig {
    pub fn from_raw(raw: &RawEnvConfig) -> Result<Self> {
        let organization = raw
            .organization
            .clone()
            .context("ORGANIZATION must be set")?;
        let bucket_name = raw.s3_bucket.clone().context("S3_BUCKET must be set")?;
        let token = raw.token.clone().context("TOKEN must be set")?;

        let base_url = Url::parse(raw.api_url.as_deref().unwrap_or(DEFAULT_API_URL))
            .with_context(|| format!("TFC_API_URL is not a valid URL: {:?}", raw.api_url))?;

        let concurrency = parse_or(&raw.concurrency, "BACKUP_CONCURRENCY", DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            anyhow::bail!("BACKUP_CONCURRENCY must be at least 1");
        }

        let max_attempts = parse_or(&raw.max_attempts, "MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }

        let page_size = parse_or(&raw.page_size, "WORKSPACE_PAGE_SIZE", MAX_PAGE_SIZE)?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            anyhow::bail!("WORKSPACE_PAGE_SIZE must be between 1 and {}", MAX_PAGE_SIZE);
        }

        let run_timeout = match &raw.run_timeout_secs {
            Some(v) => Some(Duration::from_secs(v.parse().with_context(|| {
                format!("RUN_TIMEOUT_SECS has an invalid value: '{}'", v)
            })?)),
            None => None,
        };

        let failure_policy = match &raw.failure_policy {
            Some(p) => p.parse()?,
            None => FailurePolicy::default(),
        };

        let key_prefix = raw
            .key_prefix
            .as_deref()
            .unwrap_or(DEFAULT_KEY_PREFIX)
            .trim_matches('/')
            .to_string();
        if key_prefix.is_empty() {
            anyhow::bail!("S3_KEY_PREFIX cannot consist only of '/'");
        }

        let key_include_workspace_name = match raw.key_include_workspace_name.as_deref() {
            Some(v) => parse_bool(v).context("KEY_INCLUDE_WORKSPACE_NAME must be a boolean")?,
            None => false,
        };

        let static_credentials = match (&raw.s3_access_key_id, &raw.s3_secret_access_key) {
            (Some(id), Some(secret)) => Some((id.clone(), secret.clone())),
            (None, None) => None,
            _ => anyhow::bail!(
                "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together, or both left unset to use the default AWS credential chain"
            ),
        };

        Ok(AppConfig {
            organization,
            api: ApiConfig {
                base_url,
                token,
                request_timeout: Duration::from_secs(parse_or(
                    &raw.request_timeout_secs,
                    "REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                )?),
                page_size,
            },
            storage: StorageConfig {
                bucket_name,
                region: raw.s3_region.clone(),
                endpoint_url: raw.s3_endpoint_url.clone(),
                static_credentials,
            },
            retry: RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(parse_or(
                    &raw.retry_base_delay_ms,
                    "RETRY_BASE_DELAY_MS",
                    DEFAULT_RETRY_BASE_DELAY_MS,
                )?),
                max_delay: Duration::from_secs(parse_or(
                    &raw.retry_max_delay_secs,
                    "RETRY_MAX_DELAY_SECS",
                    DEFAULT_RETRY_MAX_DELAY_SECS,
                )?),
            },
            backup: BackupConfig {
                concurrency,
                run_timeout,
                failure_policy,
                key_prefix,
                key_include_workspace_name,
            },
        })
    }
}

fn parse_or<T>(value: &Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: '{}'", name, v)),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("not a boolean: '{}'", other)),
    }
}
