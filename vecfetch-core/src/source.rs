use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use blake3::Hash;
use thiserror::Error;

use crate::local::read_exact_at;
use crate::manifest::LeafManifest;
use crate::merkle::MerkleTree;
use crate::range::ByteRange;

/// Failure of a single range request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote returned status {code}")]
    Status { code: u16 },

    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: u64, got: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("source I/O error: {0}")]
    Io(String),
}

impl FetchError {
    /// Whether another attempt can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Transport(_) | FetchError::ShortRead { .. } => {
                true
            }
            FetchError::Status { code } => (500..=599).contains(code) || *code == 408 || *code == 429,
            FetchError::Io(_) => false,
        }
    }
}

/// Anything that can hand back the bytes of a range of the remote file.
/// Implementations should give up after `timeout`.
pub trait RangeSource: Send + Sync {
    fn fetch_range(&self, range: ByteRange, timeout: Duration) -> Result<Vec<u8>, FetchError>;
}

/// What the transfer layer needs to know about one remote dataset file.
#[derive(Clone)]
pub struct DatasetEntry {
    pub remote_url: String,
    pub total_size: u64,
    pub published_root: Option<Hash>,
    pub manifest: Option<LeafManifest>,
    pub source: Arc<dyn RangeSource>,
}

impl fmt::Debug for DatasetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetEntry")
            .field("remote_url", &self.remote_url)
            .field("total_size", &self.total_size)
            .field("published_root", &self.published_root.map(|h| h.to_hex().to_string()))
            .field("manifest", &self.manifest.is_some())
            .finish_non_exhaustive()
    }
}

impl DatasetEntry {
    pub fn new(remote_url: impl Into<String>, total_size: u64, source: Arc<dyn RangeSource>) -> Self {
        Self { remote_url: remote_url.into(), total_size, published_root: None, manifest: None, source }
    }

    pub fn with_published_root(mut self, root: Hash) -> Self {
        self.published_root = Some(root);
        self
    }

    pub fn with_manifest(mut self, manifest: LeafManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Root advertised by the publisher: the explicit root if set, else the
    /// manifest's declared root.
    pub fn published_root(&self) -> Option<Hash> {
        self.published_root
            .or_else(|| self.manifest.as_ref().and_then(|m| Hash::from_hex(&m.root_hex).ok()))
    }

    pub fn fetch_range(&self, range: ByteRange, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        self.source.fetch_range(range, timeout)
    }

    /// Build the trusted tree from the manifest, if one was supplied.
    pub fn manifest_tree(&self) -> Option<crate::error::Result<MerkleTree>> {
        self.manifest.as_ref().map(|m| m.to_tree())
    }
}

/// Serves ranges from a local or mounted file, e.g. a mirror on shared storage.
#[derive(Debug)]
pub struct FileRangeSource {
    path: PathBuf,
    file: File,
}

impl FileRangeSource {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self { path: path.to_path_buf(), file: File::open(path)? })
    }

    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl RangeSource for FileRangeSource {
    fn fetch_range(&self, range: ByteRange, _timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let mut buf = vec![0u8; range.size() as usize];
        match read_exact_at(&self.file, &mut buf, range.start()) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let len = self.len().unwrap_or(0);
                Err(FetchError::ShortRead {
                    expected: range.size(),
                    got: len.saturating_sub(range.start()).min(range.size()),
                })
            }
            Err(e) => Err(FetchError::Io(format!("{}: {e}", self.path.display()))),
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpRangeSource;

#[cfg(feature = "http")]
mod http {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::blocking::Client;
    use reqwest::header::{CONTENT_LENGTH, RANGE};
    use reqwest::StatusCode;

    use super::{DatasetEntry, FetchError, RangeSource};
    use crate::error::{Result, VecfetchError};
    use crate::manifest::LeafManifest;
    use crate::merkle::MerkleTree;
    use crate::range::ByteRange;
    use crate::sidecar::TREE_SUFFIX;

    /// HTTP `Range` requests against a single URL.
    #[derive(Debug, Clone)]
    pub struct HttpRangeSource {
        client: Client,
        url: String,
    }

    impl HttpRangeSource {
        pub fn new(url: impl Into<String>) -> Result<Self> {
            let client = Client::builder()
                .user_agent(concat!("vecfetch/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| VecfetchError::InvalidConfiguration(format!("http client: {e}")))?;
            Ok(Self { client, url: url.into() })
        }

        pub fn url(&self) -> &str {
            &self.url
        }

        /// Size of the remote file from a `HEAD` request.
        pub fn content_length(&self, timeout: Duration) -> Result<u64, FetchError> {
            let resp = self
                .client
                .head(&self.url)
                .timeout(timeout)
                .send()
                .map_err(|e| map_reqwest(e, timeout))?;
            if !resp.status().is_success() {
                return Err(FetchError::Status { code: resp.status().as_u16() });
            }
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| FetchError::Transport("missing Content-Length".into()))
        }

        fn get_bytes(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
            let resp =
                self.client.get(url).timeout(timeout).send().map_err(|e| map_reqwest(e, timeout))?;
            if !resp.status().is_success() {
                return Err(FetchError::Status { code: resp.status().as_u16() });
            }
            Ok(resp.bytes().map_err(|e| map_reqwest(e, timeout))?.to_vec())
        }
    }

    impl RangeSource for HttpRangeSource {
        fn fetch_range(&self, range: ByteRange, timeout: Duration) -> Result<Vec<u8>, FetchError> {
            if range.is_empty() {
                return Ok(Vec::new());
            }
            let resp = self
                .client
                .get(&self.url)
                .header(RANGE, format!("bytes={}-{}", range.start(), range.end() - 1))
                .timeout(timeout)
                .send()
                .map_err(|e| map_reqwest(e, timeout))?;
            let status = resp.status();
            if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
                return Err(FetchError::Status { code: status.as_u16() });
            }
            let full_body = status == StatusCode::OK;
            let body = resp.bytes().map_err(|e| map_reqwest(e, timeout))?;
            // A server that ignores Range sends the whole file with 200.
            let bytes = if full_body {
                let (s, e) = (range.start() as usize, range.end() as usize);
                if body.len() < e {
                    return Err(FetchError::ShortRead {
                        expected: range.size(),
                        got: body.len().saturating_sub(s) as u64,
                    });
                }
                body[s..e].to_vec()
            } else {
                body.to_vec()
            };
            if bytes.len() as u64 != range.size() {
                return Err(FetchError::ShortRead { expected: range.size(), got: bytes.len() as u64 });
            }
            Ok(bytes)
        }
    }

    fn map_reqwest(e: reqwest::Error, timeout: Duration) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(timeout)
        } else {
            FetchError::Transport(e.to_string())
        }
    }

    impl DatasetEntry {
        /// Describe a remote file by URL: size from `HEAD`, trusted tree from
        /// the published `<url>.mref` sidecar.
        pub fn from_http(url: &str, timeout: Duration) -> Result<Self> {
            let source = HttpRangeSource::new(url)?;
            let total_size = source.content_length(timeout).map_err(|e| VecfetchError::Io {
                context: format!("HEAD {url}"),
                message: e.to_string(),
            })?;
            let tree_url = format!("{url}.{TREE_SUFFIX}");
            let tree_bytes = source.get_bytes(&tree_url, timeout).map_err(|e| VecfetchError::Io {
                context: format!("GET {tree_url}"),
                message: e.to_string(),
            })?;
            let tree = MerkleTree::deserialize(&tree_bytes)?;
            if tree.layout().total_size() != total_size {
                return Err(VecfetchError::TreeMismatch {
                    expected: format!("total_size={total_size}"),
                    found: format!("total_size={}", tree.layout().total_size()),
                });
            }
            let manifest = LeafManifest::from_tree(&tree);
            Ok(DatasetEntry::new(url, total_size, Arc::new(source)).with_manifest(manifest))
        }
    }
}
