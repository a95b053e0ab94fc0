use std::{io, path::PathBuf};

use isorun_domain::{ConfigError, Digest};
use isorun_store::{FetchError, StoreError};

pub const EXIT_MISSING_COMMAND: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_CYCLE: i32 = 3;
pub const EXIT_FETCH: i32 = 4;
pub const EXIT_MAPPING: i32 = 5;
pub const EXIT_IO: i32 = 6;

/// Fatal outcomes of a run. Each class maps to a stable process exit code.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("[IR301] the resolved manifest tree declares no command")]
    MissingCommand,
    #[error("manifest {digest}: {source}")]
    Config {
        digest: Digest,
        #[source]
        source: ConfigError,
    },
    #[error("[IR300] manifest {digest} includes itself (via {chain})")]
    Cycle { digest: Digest, chain: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("[IR500] cannot map {path}: {reason}")]
    Mapping { path: PathBuf, reason: String },
    #[error("[IR600] {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Store(StoreError),
}

impl RunError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingCommand => EXIT_MISSING_COMMAND,
            Self::Config { .. } => EXIT_CONFIG,
            Self::Cycle { .. } => EXIT_CYCLE,
            Self::Fetch(_) => EXIT_FETCH,
            Self::Mapping { .. } => EXIT_MAPPING,
            Self::Io { .. } | Self::Store(_) => EXIT_IO,
        }
    }

    pub(crate) fn mapping(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Mapping {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Fetch(fetch) => Self::Fetch(fetch),
            other => Self::Store(other),
        }
    }
}
