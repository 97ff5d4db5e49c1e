use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

/// The capability probe could not produce resource metadata.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("probe returned HTTP {0}")]
    Status(StatusCode),
}

/// Failure while fetching or persisting one byte range.
#[derive(Debug, Error)]
pub enum RangeError {
    #[error("range {index}: request failed: {source}")]
    Transport {
        index: usize,
        #[source]
        source: reqwest::Error,
    },

    #[error("range {index}: server returned HTTP {status}")]
    Status { index: usize, status: StatusCode },

    #[error("range {index}: body ended {missing} bytes early")]
    Incomplete { index: usize, missing: u64 },

    #[error("range {index}: server ignored the Range header")]
    RangeIgnored { index: usize },

    #[error("range {index}: write at offset {offset} failed: {source}")]
    Write {
        index: usize,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("range {index}: cancelled")]
    Cancelled { index: usize },
}

impl RangeError {
    /// Whether another attempt at the same range may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RangeError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_body() || source.is_request()
            }
            RangeError::Status { status, .. } => is_retryable_status(*status),
            RangeError::Incomplete { .. } => true,
            RangeError::RangeIgnored { .. }
            | RangeError::Write { .. }
            | RangeError::Cancelled { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RangeError::Cancelled { .. })
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Terminal error of a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error("failed to prepare {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("range task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("download cancelled")]
    Cancelled,
}

pub type DownloadResult<T> = Result<T, DownloadError>;
