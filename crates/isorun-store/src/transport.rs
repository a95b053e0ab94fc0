//! Remote transports: where fetched items come from.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use flate2::bufread::{GzDecoder, ZlibDecoder};
use reqwest::blocking::Client;
use tracing::debug;
use url::Url;

use crate::error::{FetchError, StoreError};

const USER_AGENT: &str = concat!("isorun-store/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Source of remote items.
///
/// Implementations stream the item named `key` into `sink` and return the number
/// of bytes written. They must flush anything they buffer before returning.
pub trait Transport: Send + Sync {
    fn fetch(&self, key: &str, sink: &mut dyn Write) -> Result<u64, FetchError>;
}

/// Pick a transport for `location`: an `http(s)://` base URL or a directory.
pub fn transport_for(location: &str) -> Result<Arc<dyn Transport>, StoreError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Ok(Arc::new(HttpTransport::new(location)?))
    } else {
        Ok(Arc::new(FileTransport::new(location)))
    }
}

/// Downloads `base + key` and inflates the compressed payload.
pub struct HttpTransport {
    base: String,
    client: Client,
}

impl HttpTransport {
    pub fn new(base: &str) -> Result<Self, StoreError> {
        let invalid = |reason: String| StoreError::InvalidRemote {
            location: base.to_string(),
            reason,
        };
        Url::parse(base).map_err(|err| invalid(err.to_string()))?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .no_proxy()
            .build()
            .map_err(|err| invalid(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base: base.to_string(),
            client,
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, key: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        let url = format!("{}{}", self.base, key);
        debug!(%url, "downloading item");
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| FetchError::Request {
                key: key.to_string(),
                url: url.clone(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                key: key.to_string(),
                url,
                status: status.as_u16(),
            });
        }
        inflate(key, BufReader::new(response), sink)
    }
}

/// Inflate a compressed stream into `sink`. Gzip framing is recognised by its
/// magic bytes; anything else is treated as a zlib stream.
pub(crate) fn inflate(
    key: &str,
    mut reader: impl BufRead,
    sink: &mut dyn Write,
) -> Result<u64, FetchError> {
    let io_err = |source| FetchError::Io {
        key: key.to_string(),
        source,
    };
    let is_gzip = reader.fill_buf().map_err(io_err)?.starts_with(&GZIP_MAGIC);
    let copied = if is_gzip {
        io::copy(&mut GzDecoder::new(reader), sink)
    } else {
        io::copy(&mut ZlibDecoder::new(reader), sink)
    };
    let written = copied.map_err(|source| {
        if matches!(
            source.kind(),
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
        ) {
            FetchError::Decompress {
                key: key.to_string(),
                source,
            }
        } else {
            io_err(source)
        }
    })?;
    sink.flush().map_err(io_err)?;
    Ok(written)
}

/// Copies `root/key` from a local or network-mounted directory.
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Transport for FileTransport {
    fn fetch(&self, key: &str, sink: &mut dyn Write) -> Result<u64, FetchError> {
        let source = self.root.join(key);
        debug!(source = %source.display(), "copying item");
        let io_err = |source| FetchError::Io {
            key: key.to_string(),
            source,
        };
        let mut file = File::open(&source).map_err(io_err)?;
        let written = io::copy(&mut file, sink).map_err(io_err)?;
        sink.flush().map_err(io_err)?;
        Ok(written)
    }
}
