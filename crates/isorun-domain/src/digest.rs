//! Content digests used to address blobs and manifests.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::{Digest as _, Sha1};

/// Hex-encoded SHA-1 of an immutable blob. Doubles as the blob's cache filename.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("[IR201] expected a {len} character hex digest, got {value:?}", len = Digest::LEN)]
pub struct DigestError {
    pub value: String,
}

impl Digest {
    pub const LEN: usize = 40;

    pub fn parse(raw: &str) -> Result<Self, DigestError> {
        if Self::is_digest_shaped(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(DigestError {
                value: raw.to_string(),
            })
        }
    }

    /// Whether `raw` looks like a digest (and therefore like a cache filename).
    pub fn is_digest_shaped(raw: &str) -> bool {
        raw.len() == Self::LEN && raw.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Hash `bytes` into a digest.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_digest_shaped(&value) {
            Ok(Self(value))
        } else {
            Err(DigestError { value })
        }
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}
