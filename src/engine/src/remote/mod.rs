//! Registry-facing components: metadata fetching and blob downloading.

mod credentials;
mod downloader;
mod fetcher;

pub use credentials::CredentialStore;
pub use downloader::{BlobDownloader, DownloadResult, ProgressCallback};
pub use fetcher::{Fetcher, ImageMetadata, TagResolution};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use imgcd_core::Result;
use tokio::io::AsyncWrite;

/// A source of compressed blob bytes.
///
/// The registry implementation pulls over HTTP on demand; tests substitute
/// in-memory sources. Implementations must be cheap to hold: no bytes are
/// transferred until `copy_compressed` is called.
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Stream the compressed blob into `out`, returning the byte count.
    async fn copy_compressed(&self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64>;
}

/// Immutable descriptor of one image layer.
///
/// All fields come from the manifest and config; obtaining a handle never
/// touches layer bytes. Two layers are the same layer iff their diffIDs
/// match; digests differ across recompressions of identical filesystems.
#[derive(Clone)]
pub struct LayerHandle {
    /// SHA-256 of the compressed blob (the wire identity)
    pub digest: String,
    /// SHA-256 of the uncompressed tar stream (the filesystem identity)
    pub diff_id: String,
    /// Compressed size in bytes
    pub size: i64,
    /// OCI/Docker layer media type
    pub media_type: String,
    /// The build step that created this layer, if recorded
    pub command: String,
    source: Arc<dyn BlobSource>,
}

impl LayerHandle {
    pub fn new(
        digest: impl Into<String>,
        diff_id: impl Into<String>,
        size: i64,
        media_type: impl Into<String>,
        command: impl Into<String>,
        source: Arc<dyn BlobSource>,
    ) -> Self {
        Self {
            digest: digest.into(),
            diff_id: diff_id.into(),
            size,
            media_type: media_type.into(),
            command: command.into(),
            source,
        }
    }

    /// The blob source backing this layer.
    pub fn source(&self) -> &dyn BlobSource {
        self.source.as_ref()
    }

    /// Stream the compressed blob into `out`.
    pub async fn copy_compressed(
        &self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        self.source.copy_compressed(out).await
    }
}

impl fmt::Debug for LayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerHandle")
            .field("digest", &self.digest)
            .field("diff_id", &self.diff_id)
            .field("size", &self.size)
            .field("media_type", &self.media_type)
            .finish()
    }
}

/// In-memory blob source for tests.
#[cfg(test)]
pub struct MemoryBlobSource {
    data: Vec<u8>,
    delay: Option<std::time::Duration>,
}

#[cfg(test)]
impl MemoryBlobSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, delay: None }
    }

    /// A source that sleeps before producing bytes, for cancellation tests.
    pub fn with_delay(data: Vec<u8>, delay: std::time::Duration) -> Self {
        Self {
            data,
            delay: Some(delay),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl BlobSource for MemoryBlobSource {
    async fn copy_compressed(&self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        use tokio::io::AsyncWriteExt;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        out.write_all(&self.data).await?;
        Ok(self.data.len() as u64)
    }
}
