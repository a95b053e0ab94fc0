use std::{io, path::PathBuf};

/// Errors produced while fetching a single item.
///
/// Every variant carries the key it was raised for so the cache can release the
/// item from its pending set when the failure surfaces.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("[IR400] {key}: size mismatch after fetch (expected {expected}, got {actual})")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("[IR401] {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("[IR401] {key}: failed to inflate payload: {source}")]
    Decompress {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("[IR402] {key}: request to {url} failed: {message}")]
    Request {
        key: String,
        url: String,
        message: String,
    },
    #[error("[IR402] {key}: {url} answered HTTP {status}")]
    Status {
        key: String,
        url: String,
        status: u16,
    },
    #[error("[IR403] {key:?} is not a valid item key")]
    InvalidKey { key: String },
}

impl FetchError {
    /// Whether the fetcher should retry the item at a lower urgency.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SizeMismatch { .. }
            | Self::Io { .. }
            | Self::Decompress { .. }
            | Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500 || matches!(status, 408 | 429),
            Self::InvalidKey { .. } => false,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::SizeMismatch { key, .. }
            | Self::Io { key, .. }
            | Self::Decompress { key, .. }
            | Self::Request { key, .. }
            | Self::Status { key, .. }
            | Self::InvalidKey { key } => key,
        }
    }
}

/// Errors surfaced by the content-addressed cache.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("[IR410] cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("[IR411] none of {digests} are cached or being fetched")]
    NotPending { digests: String },
    #[error("[IR412] invalid remote location {location}: {reason}")]
    InvalidRemote { location: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
