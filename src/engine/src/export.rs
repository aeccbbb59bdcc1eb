//! Save orchestration: fetch, diff, download, pack.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use imgcd_core::{Error, Result};

use crate::bundle::{BundleMetadata, BundlePacker, LayerInfo, BUNDLE_VERSION};
use crate::cache::BlobCache;
use crate::diff::{classify, DiffResult};
use crate::platform::Platform;
use crate::reference::{bundle_filename, normalize_since_ref, parse_reference};
use crate::remote::{BlobDownloader, Fetcher, ImageMetadata, LayerHandle, ProgressCallback};

/// Options for a save operation.
pub struct ExportOptions {
    pub platform: Platform,
    /// Maximum concurrent blob downloads (0 selects the default).
    pub max_concurrency: usize,
    /// Invoked as layers finish downloading.
    pub progress: Option<ProgressCallback>,
}

/// Wires the fetcher, differ, downloader, and packer into the save flow.
pub struct Exporter {
    fetcher: Fetcher,
    cache: Arc<BlobCache>,
}

impl Exporter {
    pub fn new(cache: Arc<BlobCache>) -> Self {
        Self {
            fetcher: Fetcher::new(),
            cache,
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Export `new_ref` (optionally incremental against `since_ref`) into
    /// `out_dir`. Returns the bundle path.
    pub async fn save(
        &self,
        new_ref: &str,
        since_ref: Option<&str>,
        out_dir: &Path,
        options: &ExportOptions,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(out_dir)?;

        tracing::info!(image = new_ref, platform = %options.platform, "Fetching image metadata");
        let new_image = self
            .fetcher
            .fetch_image_metadata(new_ref, &options.platform)
            .await?;

        // Incremental: fetch the base and classify against it.
        let (normalized_since, diff) = match since_ref.filter(|s| !s.is_empty()) {
            Some(since) => {
                let full_since = normalize_since_ref(new_ref, since);
                tracing::info!(base = %full_since, "Calculating layer delta");

                let base_image = self
                    .fetcher
                    .fetch_image_metadata(&full_since, &options.platform)
                    .await?;
                let diff = classify(
                    clone_metadata_shallow(&new_image),
                    base_image,
                );

                tracing::info!(
                    shared = diff.shared_layers().count(),
                    new = diff.new_layers().count(),
                    prefix = diff.shared_prefix_len,
                    savings_pct = diff.savings_percentage,
                    "Layer delta computed"
                );

                (Some(full_since), Some(diff))
            }
            None => (None, None),
        };

        let (shared_layer_count, layers_to_export) = plan_export(&new_image, diff.as_ref());

        tracing::info!(
            total = new_image.layers.len(),
            exporting = layers_to_export.len(),
            shared = shared_layer_count,
            "Downloading blobs"
        );

        let downloader = BlobDownloader::new(self.cache.clone());
        let results = downloader
            .download_blobs(
                &layers_to_export,
                new_ref,
                options.max_concurrency,
                options.progress.clone(),
            )
            .await?;

        let cache_hits = results.iter().filter(|r| r.from_cache).count();
        tracing::info!(
            hits = cache_hits,
            total = results.len(),
            "Blob downloads complete (cache hits: {}/{})",
            cache_hits,
            results.len()
        );

        let metadata = build_bundle_metadata(
            &new_image,
            normalized_since.as_deref(),
            shared_layer_count,
            &layers_to_export,
        )?;

        let (repo, tag) = parse_reference(new_ref);
        let out_path = out_dir.join(bundle_filename(&repo, &tag, normalized_since.as_deref()));

        BundlePacker::new(&self.cache).pack(&out_path, &metadata).await?;

        Ok(out_path)
    }
}

/// Decide which layers to ship and how many the base supplies.
///
/// Only the shared *prefix* is elided: a shared layer behind a new layer is
/// transmitted anyway, because the reconstructed archive needs a contiguous
/// chain. When every layer is shared the export degenerates to a full one,
/// which is still useful on a host that lacks the base image.
fn plan_export(
    new_image: &ImageMetadata,
    diff: Option<&DiffResult>,
) -> (usize, Vec<LayerHandle>) {
    let Some(diff) = diff else {
        return (0, new_image.layers.clone());
    };

    let prefix = diff.shared_prefix_len.min(new_image.layers.len());
    if prefix == new_image.layers.len() {
        tracing::warn!(
            "Every layer is shared with the base image; falling back to a full export"
        );
        return (0, new_image.layers.clone());
    }

    (prefix, new_image.layers[prefix..].to_vec())
}

/// Assemble bundle metadata from fetched image metadata plus the export
/// plan.
fn build_bundle_metadata(
    new_image: &ImageMetadata,
    base_ref: Option<&str>,
    shared_layer_count: usize,
    layers: &[LayerHandle],
) -> Result<BundleMetadata> {
    let manifest = serde_json::to_value(&new_image.manifest)
        .map_err(|e| Error::Serialization(e.to_string()))?;

    let layer_infos: Vec<LayerInfo> = layers
        .iter()
        .map(|l| LayerInfo {
            digest: l.digest.clone(),
            diffid: l.diff_id.clone(),
            size: l.size,
            uncompressed_size: None,
            media_type: Some(l.media_type.clone()),
        })
        .collect();

    let metadata = BundleMetadata {
        version: BUNDLE_VERSION.to_string(),
        image_ref: new_image.reference.clone(),
        base_ref: base_ref.unwrap_or_default().to_string(),
        shared_layer_count,
        platform: new_image.platform.clone(),
        manifest,
        config: new_image.config.clone(),
        total_size: layer_infos.iter().map(|l| l.size).sum(),
        layers: layer_infos,
        created_at: Utc::now().to_rfc3339(),
    };

    metadata.validate_chain()?;
    Ok(metadata)
}

/// Clone the parts of metadata the differ needs; layer handles share their
/// blob sources.
fn clone_metadata_shallow(meta: &ImageMetadata) -> ImageMetadata {
    ImageMetadata {
        reference: meta.reference.clone(),
        platform: meta.platform.clone(),
        manifest_digest: meta.manifest_digest.clone(),
        manifest: meta.manifest.clone(),
        config: meta.config.clone(),
        diff_ids: meta.diff_ids.clone(),
        layers: meta.layers.clone(),
        total_size: meta.total_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryBlobSource;

    fn empty_manifest() -> oci_distribution::manifest::OciImageManifest {
        serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                "size": 0
            },
            "layers": []
        }))
        .unwrap()
    }

    fn metadata(reference: &str, layers: &[(&str, &str, i64)]) -> ImageMetadata {
        let handles: Vec<LayerHandle> = layers
            .iter()
            .map(|(digest, diff_id, size)| {
                LayerHandle::new(
                    digest.to_string(),
                    diff_id.to_string(),
                    *size,
                    "application/vnd.oci.image.layer.v1.tar+gzip",
                    "",
                    Arc::new(MemoryBlobSource::new(Vec::new())),
                )
            })
            .collect();

        let diff_ids: Vec<String> = layers.iter().map(|(_, d, _)| d.to_string()).collect();
        ImageMetadata {
            reference: reference.to_string(),
            platform: "linux/amd64".to_string(),
            manifest_digest: "sha256:manifest".to_string(),
            manifest: empty_manifest(),
            config: serde_json::json!({
                "rootfs": {"type": "layers", "diff_ids": diff_ids}
            }),
            diff_ids,
            layers: handles,
            total_size: layers.iter().map(|(_, _, s)| s).sum(),
        }
    }

    #[test]
    fn test_plan_export_full() {
        let new = metadata("app:2", &[("sha256:c1", "sha256:d1", 10)]);
        let (shared, layers) = plan_export(&new, None);
        assert_eq!(shared, 0);
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn test_plan_export_elides_shared_prefix_only() {
        let new = metadata(
            "app:2",
            &[
                ("sha256:c1", "sha256:d1", 10),
                ("sha256:c2", "sha256:dNEW", 20),
                ("sha256:c3", "sha256:d3", 30),
            ],
        );
        // Base shares the first layer and the third (out of prefix order).
        let base = metadata(
            "app:1",
            &[("sha256:x1", "sha256:d1", 10), ("sha256:x3", "sha256:d3", 30)],
        );
        let diff = classify(clone_metadata_shallow(&new), base);

        let (shared, layers) = plan_export(&new, Some(&diff));

        // Only the prefix is elided; the trailing shared layer ships too.
        assert_eq!(shared, 1);
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].diff_id, "sha256:dNEW");
        assert_eq!(layers[1].diff_id, "sha256:d3");
    }

    #[test]
    fn test_plan_export_all_shared_falls_back_to_full() {
        let layers = &[
            ("sha256:c1", "sha256:d1", 10),
            ("sha256:c2", "sha256:d2", 20),
        ];
        let new = metadata("app:2", layers);
        let base = metadata("app:1", layers);
        let diff = classify(clone_metadata_shallow(&new), base);

        let (shared, exported) = plan_export(&new, Some(&diff));
        assert_eq!(shared, 0);
        assert_eq!(exported.len(), 2);
    }

    #[test]
    fn test_build_bundle_metadata_incremental() {
        let new = metadata(
            "app:2",
            &[("sha256:c1", "sha256:d1", 10), ("sha256:c2", "sha256:d2", 20)],
        );

        let meta =
            build_bundle_metadata(&new, Some("app:1"), 1, &new.layers[1..]).unwrap();

        assert_eq!(meta.version, BUNDLE_VERSION);
        assert_eq!(meta.image_ref, "app:2");
        assert_eq!(meta.base_ref, "app:1");
        assert_eq!(meta.shared_layer_count, 1);
        assert_eq!(meta.layers.len(), 1);
        assert_eq!(meta.layers[0].diffid, "sha256:d2");
        assert_eq!(meta.total_size, 20);
        meta.validate_chain().unwrap();
    }

    #[test]
    fn test_build_bundle_metadata_rejects_broken_chain() {
        let new = metadata(
            "app:2",
            &[("sha256:c1", "sha256:d1", 10), ("sha256:c2", "sha256:d2", 20)],
        );

        // Claiming 2 shared while also shipping a layer breaks the chain.
        let result = build_bundle_metadata(&new, Some("app:1"), 2, &new.layers[1..]);
        assert!(result.is_err());
    }
}
