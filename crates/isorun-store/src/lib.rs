//! Content-addressed storage: a priority fetcher and the LRU cache built on it.

#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

mod cache;
mod error;
mod fetcher;
mod link;
mod location;
mod transport;

pub use cache::{
    CacheEntry, CachePolicies, ContentAddressedCache, DEFAULT_MAX_CACHE_SIZE,
    DEFAULT_MAX_ITEMS, DEFAULT_MIN_FREE_SPACE, STATE_FILE,
};
pub use error::{FetchError, StoreError};
pub use fetcher::{ContentFetcher, FetcherOptions, Priority, INITIAL_WORKERS, MAX_WORKERS, RETRIES};
pub use link::hardlink_or_copy;
pub use location::{resolve_cache_dir, CacheLocation, CACHE_PATH_ENV};
pub use transport::{transport_for, FileTransport, HttpTransport, Transport};
