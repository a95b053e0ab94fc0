//! Resolves content-addressed manifest trees, stages them into a sandbox and
//! runs the declared command.

#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod core;

pub use crate::core::config::Config;
pub use crate::core::errors::{
    RunError, EXIT_CONFIG, EXIT_CYCLE, EXIT_FETCH, EXIT_IO, EXIT_MAPPING, EXIT_MISSING_COMMAND,
};
pub use crate::core::runtime::run::{run, run_with_config, ManifestSource, RunRequest};
pub use crate::core::tree::{resolve, ManifestTree, ResolvedSettings};

pub use isorun_domain::{Digest, DigestError};
pub use isorun_store::{
    resolve_cache_dir, CacheLocation, CachePolicies, DEFAULT_MAX_CACHE_SIZE, DEFAULT_MAX_ITEMS,
    DEFAULT_MIN_FREE_SPACE,
};
