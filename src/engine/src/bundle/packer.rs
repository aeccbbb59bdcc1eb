//! Streams metadata and cached blobs into a bundle file.

use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use imgcd_core::{Error, Result};

use super::{BundleMetadata, BLOB_ENTRY_PREFIX, METADATA_ENTRY};
use crate::cache::BlobCache;

/// Packs a bundle from metadata plus blobs already present in the cache.
pub struct BundlePacker<'a> {
    cache: &'a BlobCache,
}

impl<'a> BundlePacker<'a> {
    pub fn new(cache: &'a BlobCache) -> Self {
        Self { cache }
    }

    /// Write the bundle to `out_path`.
    ///
    /// `metadata.json` is written first so a consumer can parse it before
    /// any blob; blobs follow in `metadata.layers` order. The file is
    /// assembled in a temp sibling and atomically renamed into place, so a
    /// failure leaves no observable output.
    pub async fn pack(&self, out_path: &Path, metadata: &BundleMetadata) -> Result<()> {
        let parent = out_path.parent().ok_or_else(|| {
            Error::BundleFormat(format!("output path {} has no parent", out_path.display()))
        })?;

        let staged = tempfile::Builder::new()
            .prefix(".bundle-")
            .tempfile_in(parent)?;

        {
            let file = staged.reopen()?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);

            let metadata_bytes = serde_json::to_vec_pretty(metadata)?;
            append_entry(&mut builder, METADATA_ENTRY, &metadata_bytes)?;

            for layer in &metadata.layers {
                let (blob_file, entry) =
                    self.cache
                        .open_blob(&layer.digest)
                        .await
                        .map_err(|e| match e {
                            // A blob the metadata references but the cache
                            // cannot produce is fatal for the pack.
                            Error::NotCached { digest } => Error::Cache(format!(
                                "blob {} is unretrievable from the cache",
                                digest
                            )),
                            other => other,
                        })?;

                let hex = layer.digest.strip_prefix("sha256:").unwrap_or(&layer.digest);
                let name = format!("{}{}", BLOB_ENTRY_PREFIX, hex);

                let mut header = tar::Header::new_gnu();
                header.set_size(entry.size);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, &name, blob_file)?;
            }

            let encoder = builder.into_inner()?;
            encoder.finish()?;
        }

        staged.persist(out_path).map_err(|e| {
            Error::Other(format!(
                "failed to move bundle into place at {}: {}",
                out_path.display(),
                e.error
            ))
        })?;

        tracing::info!(path = %out_path.display(), layers = metadata.layers.len(), "Bundle written");
        Ok(())
    }
}

/// Append an in-memory entry with mode 0644.
fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
