use thiserror::Error;

// Longest slice of an error response body kept for logs.
const MAX_BODY_EXCERPT: usize = 512;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("Malformed API response: {0}")]
    MalformedResponse(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Object storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("timeout: {0}")]
    Timeout(String),
}

impl AppError {
    pub fn status(url: &str, status: u16, body: &str) -> Self {
        let body = match body.char_indices().nth(MAX_BODY_EXCERPT) {
            Some((idx, _)) => format!("{}...", &body[..idx]),
            None => body.to_string(),
        };
        AppError::Status {
            url: url.to_string(),
            status,
            body,
        }
    }

    /// Whether another attempt of the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http { .. } => true,
            AppError::Status { status, .. } => *status == 429 || (500..600).contains(status),
            AppError::Storage { retryable, .. } => *retryable,
            AppError::Config(_)
            | AppError::MalformedResponse(_)
            | AppError::Archive(_)
            | AppError::Timeout(_) => false,
        }
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        AppError::Archive(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Archive(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
