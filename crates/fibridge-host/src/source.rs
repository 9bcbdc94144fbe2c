//! Data sources: the bytes behind a hosted path.
//!
//! A source is read by offset and never by cursor, so any number of range
//! reads can run against the same source at once.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

/// Random-access byte source.
///
/// `identity` decides registry dedup: registering the same path twice with
/// sources of equal identity is a no-op, with different identities a conflict.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// Stable identity of the underlying object.
    fn identity(&self) -> &str;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at the end of the source.
    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes>;
}

pub type SourceHandle = Arc<dyn DataSource>;

/// In-memory source, the equivalent of a browser `File` blob.
#[derive(Debug, Clone)]
pub struct MemorySource {
    identity: String,
    data: Bytes,
}

impl MemorySource {
    /// Wrap a buffer under a fresh random identity.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_identity(Uuid::new_v4().to_string(), data)
    }

    pub fn with_identity(identity: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            identity: identity.into(),
            data: data.into(),
        }
    }

    pub fn into_handle(self) -> SourceHandle {
        Arc::new(self)
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let size = self.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(size);
        let end = start.saturating_add(len).min(size);
        Ok(self.data.slice(start..end))
    }
}

/// Local file opened by path; each read opens its own handle.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    identity: String,
    size: u64,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = tokio::fs::canonicalize(path.as_ref()).await?;
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }

        Ok(Self {
            identity: format!("file:{}", path.display()),
            path,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_handle(self) -> SourceHandle {
        Arc::new(self)
    }
}

#[async_trait]
impl DataSource for FileSource {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, len: usize) -> io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}
