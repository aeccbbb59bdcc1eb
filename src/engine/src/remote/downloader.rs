//! Bounded-concurrency blob downloading into the cache.
//!
//! Each layer either hits the cache (no registry contact) or is streamed
//! from its blob source into the cache, which verifies the digest during
//! the write. Results come back in layer order regardless of completion
//! order, so the packer can stream deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use imgcd_core::{Error, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::LayerHandle;
use crate::cache::{BlobCache, PutOutcome};

/// Default number of concurrent downloads when the caller passes 0.
const DEFAULT_CONCURRENCY: usize = 4;

/// Invoked after each layer finishes: `(completed, total, digest)`.
///
/// Called from worker tasks; implementations must be cheap and
/// reentrancy-safe.
pub type ProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// The result of downloading (or cache-hitting) one blob.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub digest: String,
    pub diff_id: String,
    pub size: u64,
    pub from_cache: bool,
}

/// Downloads compressed blobs from layer handles into the cache.
pub struct BlobDownloader {
    cache: Arc<BlobCache>,
}

impl BlobDownloader {
    pub fn new(cache: Arc<BlobCache>) -> Self {
        Self { cache }
    }

    /// Download all `layers` with at most `max_concurrency` in flight
    /// (0 selects the default of 4).
    ///
    /// Results are returned in the same order as `layers`. If any layer
    /// fails, the call drains in-flight work and then fails with the first
    /// error in layer order. Dropping the returned future aborts pending
    /// workers.
    pub async fn download_blobs(
        &self,
        layers: &[LayerHandle],
        image_ref: &str,
        max_concurrency: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<DownloadResult>> {
        let limit = if max_concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            max_concurrency
        };

        let total = layers.len();
        let semaphore = Arc::new(Semaphore::new(limit));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();

        for (index, layer) in layers.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let cache = self.cache.clone();
            let image_ref = image_ref.to_string();
            let progress = progress.clone();
            let completed = completed.clone();

            workers.spawn(async move {
                let worker_result = match semaphore.acquire_owned().await {
                    Ok(_permit) => download_one(&cache, &layer, &image_ref).await,
                    Err(_) => Err(Error::Cancelled),
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(callback) = &progress {
                    callback(done, total, &layer.digest);
                }

                (index, worker_result)
            });
        }

        // Drain every worker before surfacing any error, so a failure does
        // not leave half-finished work behind unobserved.
        let mut slots: Vec<Option<Result<DownloadResult>>> = Vec::new();
        slots.resize_with(total, || None);

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    return Err(Error::Other(format!(
                        "download worker failed: {}",
                        join_err
                    )))
                }
            }
        }

        // Surface the first failure in layer order.
        let mut results = Vec::with_capacity(total);
        for (index, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(Ok(result)) => results.push(result),
                Some(Err(error)) => {
                    tracing::error!(layer = index, error = %error, "Blob download failed");
                    return Err(error);
                }
                None => return Err(Error::Cancelled),
            }
        }

        Ok(results)
    }
}

/// Download a single blob, consulting the cache first.
async fn download_one(
    cache: &BlobCache,
    layer: &LayerHandle,
    image_ref: &str,
) -> Result<DownloadResult> {
    if cache.exists(&layer.digest).await {
        match cache.touch(&layer.digest, image_ref).await {
            Ok(entry) => {
                tracing::debug!(digest = %layer.digest, "Blob already cached");
                return Ok(DownloadResult {
                    digest: layer.digest.clone(),
                    diff_id: layer.diff_id.clone(),
                    size: entry.size,
                    from_cache: true,
                });
            }
            // Stale index entry: treat as a miss and re-download.
            Err(Error::NotCached { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    tracing::debug!(digest = %layer.digest, size = layer.size, "Downloading blob");
    let outcome = cache
        .put(&layer.digest, &layer.diff_id, image_ref, layer.source())
        .await?;

    Ok(DownloadResult {
        digest: layer.digest.clone(),
        diff_id: layer.diff_id.clone(),
        size: outcome.size(),
        from_cache: matches!(outcome, PutOutcome::AlreadyCached { .. }),
    })
}
