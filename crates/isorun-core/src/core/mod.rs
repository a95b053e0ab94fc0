pub(crate) mod config;
pub(crate) mod errors;
pub(crate) mod runtime;
pub(crate) mod tooling;
pub(crate) mod tree;
