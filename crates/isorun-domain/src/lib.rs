#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod digest;
pub mod manifest;

pub use digest::{Digest, DigestError};
pub use manifest::{platform_flavor, ConfigError, FileEntry, Manifest};
