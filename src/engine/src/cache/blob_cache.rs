//! Content-addressed cache for compressed registry blobs.
//!
//! Blobs are stored exactly as the registry serves them (compressed), keyed
//! by their compressed digest, so a cached file named `sha256:H` always
//! contains bytes hashing to H. Verification happens on every write. An
//! `index.json` tracks metadata; entries pointing at missing files are
//! evicted on load and on lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use imgcd_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use crate::remote::BlobSource;

/// Index format version.
const INDEX_VERSION: &str = "2";

/// Metadata for a cached blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEntry {
    /// Compressed digest (cache key, with `sha256:` prefix)
    pub digest: String,
    /// Uncompressed digest
    pub diffid: String,
    /// Compressed size in bytes
    pub size: u64,
    /// Image references that claimed this blob
    pub image_refs: Vec<String>,
    /// Last time this blob was accessed
    pub last_access: DateTime<Utc>,
    /// When this blob was first cached
    pub created_at: DateTime<Utc>,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: String,
    blobs: HashMap<String, BlobEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CacheIndex {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: INDEX_VERSION.to_string(),
            blobs: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a `put` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The blob was downloaded, verified, and stored.
    Stored { size: u64 },
    /// The blob was already cached; only bookkeeping was updated.
    AlreadyCached { size: u64 },
}

impl PutOutcome {
    pub fn size(&self) -> u64 {
        match self {
            PutOutcome::Stored { size } | PutOutcome::AlreadyCached { size } => *size,
        }
    }
}

/// Persistent, digest-keyed store of compressed blobs.
pub struct BlobCache {
    /// Blob file directory (`<root>/blobs/sha256`)
    blobs_dir: PathBuf,
    /// Index path (`<root>/index.json`)
    index_path: PathBuf,
    index: RwLock<CacheIndex>,
}

impl BlobCache {
    /// Open (or create) a cache rooted at `root`.
    ///
    /// An unreadable or version-mismatched index is logged and treated as
    /// an empty cache; entries whose blob file is missing are discarded.
    pub fn open(root: &Path) -> Result<Self> {
        let blobs_dir = root.join("blobs").join("sha256");
        let index_path = root.join("index.json");

        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            Error::Cache(format!(
                "failed to create cache directory {}: {}",
                blobs_dir.display(),
                e
            ))
        })?;

        let index = match Self::load_index(&index_path, &blobs_dir) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load cache index, starting empty");
                CacheIndex::empty()
            }
        };

        Ok(Self {
            blobs_dir,
            index_path,
            index: RwLock::new(index),
        })
    }

    /// Default cache root: `~/.imgcd/cache`.
    pub fn default_root() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Cache("cannot determine home directory".to_string()))?;
        Ok(home.join(".imgcd").join("cache"))
    }

    /// Check whether a blob exists in the cache.
    pub async fn exists(&self, digest: &str) -> bool {
        let digest = normalize_digest(digest);
        let index = self.index.read().await;
        index.blobs.contains_key(&digest)
    }

    /// Record an access to a cached blob without reading it.
    ///
    /// Updates `last_access` and appends `image_ref` to the owner set. A
    /// stale entry whose file is missing is evicted and reported as a miss.
    pub async fn touch(&self, digest: &str, image_ref: &str) -> Result<BlobEntry> {
        let digest = normalize_digest(digest);
        let mut index = self.index.write().await;

        if !index.blobs.contains_key(&digest) {
            return Err(Error::NotCached { digest });
        }

        if !self.blob_path(&digest).exists() {
            index.blobs.remove(&digest);
            index.updated_at = Utc::now();
            self.save_index(&index)?;
            return Err(Error::NotCached { digest });
        }

        let snapshot = match index.blobs.get_mut(&digest) {
            Some(entry) => {
                entry.last_access = Utc::now();
                if !entry.image_refs.iter().any(|r| r == image_ref) {
                    entry.image_refs.push(image_ref.to_string());
                }
                entry.clone()
            }
            None => return Err(Error::NotCached { digest }),
        };
        index.updated_at = Utc::now();
        self.save_index(&index)?;

        Ok(snapshot)
    }

    /// Open a cached blob for reading. Updates `last_access`.
    pub async fn open_blob(&self, digest: &str) -> Result<(std::fs::File, BlobEntry)> {
        let digest = normalize_digest(digest);
        let mut index = self.index.write().await;

        if !index.blobs.contains_key(&digest) {
            return Err(Error::NotCached { digest });
        }

        let file = match std::fs::File::open(self.blob_path(&digest)) {
            Ok(f) => f,
            Err(_) => {
                // Entry exists but the file is gone: evict and miss.
                index.blobs.remove(&digest);
                index.updated_at = Utc::now();
                self.save_index(&index)?;
                return Err(Error::NotCached { digest });
            }
        };

        let snapshot = match index.blobs.get_mut(&digest) {
            Some(entry) => {
                entry.last_access = Utc::now();
                entry.clone()
            }
            None => return Err(Error::NotCached { digest }),
        };
        index.updated_at = Utc::now();
        self.save_index(&index)?;

        Ok((file, snapshot))
    }

    /// Stream a blob from `source` into the cache, verifying its digest.
    ///
    /// The blob is written to a staging file while its SHA-256 is computed;
    /// a mismatch removes the staging file and fails with
    /// [`Error::Integrity`]; a partially cached blob is never observable.
    /// If the digest is already cached, the source is not contacted and
    /// only the owner set and `last_access` are updated.
    pub async fn put(
        &self,
        digest: &str,
        diff_id: &str,
        image_ref: &str,
        source: &dyn BlobSource,
    ) -> Result<PutOutcome> {
        let digest = normalize_digest(digest);
        let diff_id = normalize_digest(diff_id);

        if let Ok(entry) = self.touch(&digest, image_ref).await {
            return Ok(PutOutcome::AlreadyCached { size: entry.size });
        }

        // Stage into a uniquely named temp file in the cache directory so
        // the final rename stays on one filesystem. Dropping the guard
        // removes the staging file on any failure path.
        let staged = tempfile::Builder::new()
            .prefix(".put-")
            .tempfile_in(&self.blobs_dir)
            .map_err(|e| Error::Cache(format!("failed to create staging file: {}", e)))?;

        let std_file = staged
            .reopen()
            .map_err(|e| Error::Cache(format!("failed to reopen staging file: {}", e)))?;
        let mut writer = HashingWriter::new(tokio::fs::File::from_std(std_file));
        source.copy_compressed(&mut writer).await?;

        let (actual_digest, written) = writer.finish().await?;
        if actual_digest != digest {
            return Err(Error::Integrity {
                expected: digest,
                actual: actual_digest,
            });
        }

        let blob_path = self.blob_path(&digest);
        staged
            .persist(&blob_path)
            .map_err(|e| Error::Cache(format!("failed to persist blob: {}", e.error)))?;

        let mut index = self.index.write().await;
        let now = Utc::now();
        index.blobs.insert(
            digest.clone(),
            BlobEntry {
                digest,
                diffid: diff_id,
                size: written,
                image_refs: vec![image_ref.to_string()],
                last_access: now,
                created_at: now,
            },
        );
        index.updated_at = now;
        self.save_index(&index)?;

        Ok(PutOutcome::Stored { size: written })
    }

    /// Snapshot of all cached entries.
    pub async fn list(&self) -> Vec<BlobEntry> {
        let index = self.index.read().await;
        index.blobs.values().cloned().collect()
    }

    /// Remove blobs not accessed within `max_age`.
    ///
    /// Returns `(removed_count, bytes_freed)`.
    pub async fn prune(&self, max_age: chrono::Duration) -> Result<(usize, u64)> {
        let cutoff = Utc::now() - max_age;
        let mut index = self.index.write().await;

        let stale: Vec<String> = index
            .blobs
            .values()
            .filter(|e| e.last_access < cutoff)
            .map(|e| e.digest.clone())
            .collect();

        let mut freed = 0u64;
        for digest in &stale {
            if let Some(entry) = index.blobs.remove(digest) {
                freed += entry.size;
                let _ = std::fs::remove_file(self.blob_path(digest));
            }
        }

        index.updated_at = Utc::now();
        self.save_index(&index)?;

        tracing::debug!(removed = stale.len(), bytes_freed = freed, "Pruned blob cache");
        Ok((stale.len(), freed))
    }

    /// Remove every blob and reset the index.
    pub async fn clean(&self) -> Result<()> {
        let mut index = self.index.write().await;

        for digest in index.blobs.keys() {
            let _ = std::fs::remove_file(self.blob_path(digest));
        }

        *index = CacheIndex::empty();
        self.save_index(&index)?;
        Ok(())
    }

    /// Cache statistics: `(total_bytes, entry_count)`.
    pub async fn stats(&self) -> (u64, usize) {
        let index = self.index.read().await;
        let total = index.blobs.values().map(|e| e.size).sum();
        (total, index.blobs.len())
    }

    /// Path of the blob file for a digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.blobs_dir.join(hex)
    }

    /// Load the index from disk, discarding entries without a backing file.
    fn load_index(index_path: &Path, blobs_dir: &Path) -> Result<CacheIndex> {
        if !index_path.exists() {
            return Ok(CacheIndex::empty());
        }

        let data = std::fs::read_to_string(index_path)?;
        let mut index: CacheIndex = serde_json::from_str(&data)?;

        if index.version != INDEX_VERSION {
            return Err(Error::Cache(format!(
                "unsupported cache index version: {} (expected {})",
                index.version, INDEX_VERSION
            )));
        }

        index.blobs.retain(|digest, _| {
            let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
            blobs_dir.join(hex).exists()
        });

        Ok(index)
    }

    /// Write the index atomically (temp sibling, then rename).
    fn save_index(&self, index: &CacheIndex) -> Result<()> {
        let data = serde_json::to_string_pretty(index)?;
        let tmp = self.index_path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.index_path)?;
        Ok(())
    }
}

/// Ensure a digest carries the `sha256:` prefix.
fn normalize_digest(digest: &str) -> String {
    if digest.starts_with("sha256:") {
        digest.to_string()
    } else {
        format!("sha256:{}", digest)
    }
}

/// AsyncWrite adapter that feeds written bytes through a SHA-256 hasher.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: AsyncWrite + Unpin> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Flush the inner writer and return `(sha256:<hex>, bytes_written)`.
    async fn finish(mut self) -> Result<(String, u64)> {
        use tokio::io::AsyncWriteExt;
        self.inner.flush().await?;
        let digest = format!("sha256:{:x}", self.hasher.finalize());
        Ok((digest, self.written))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                me.hasher.update(&buf[..n]);
                me.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
