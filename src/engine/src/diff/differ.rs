//! Compares two images by uncompressed layer digest.
//!
//! Layers are equal iff their diffIDs match. Digests are never compared:
//! recompression of an identical filesystem produces a different digest
//! but the same diffID.

use std::collections::HashSet;

use imgcd_core::Result;

use crate::platform::Platform;
use crate::remote::{Fetcher, ImageMetadata};

/// Classification of one new-image layer against the base image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStatus {
    /// The layer does not exist in the base image.
    New,
    /// The layer exists in the base image (by diffID).
    Shared,
}

/// Diff information for a single layer of the new image.
#[derive(Debug, Clone)]
pub struct LayerDiff {
    pub diff_id: String,
    pub digest: String,
    pub size: i64,
    pub command: String,
    pub status: LayerStatus,
}

/// The result of comparing two images.
pub struct DiffResult {
    pub new_image: ImageMetadata,
    pub base_image: ImageMetadata,
    /// All new-image layers in order, classified
    pub layer_diffs: Vec<LayerDiff>,
    /// Length of the common diffID prefix of the two chains.
    ///
    /// Only the prefix can be supplied by the base image at load time; a
    /// shared layer appearing after a new layer is still transmitted.
    pub shared_prefix_len: usize,
    pub new_layers_size: i64,
    pub shared_layers_size: i64,
    pub total_new_image_size: i64,
    pub savings_size: i64,
    pub savings_percentage: f64,
}

impl DiffResult {
    /// Layers classified as new, in chain order.
    pub fn new_layers(&self) -> impl Iterator<Item = &LayerDiff> {
        self.layer_diffs
            .iter()
            .filter(|d| d.status == LayerStatus::New)
    }

    /// Layers classified as shared, in chain order.
    pub fn shared_layers(&self) -> impl Iterator<Item = &LayerDiff> {
        self.layer_diffs
            .iter()
            .filter(|d| d.status == LayerStatus::Shared)
    }
}

/// Compares two container images.
pub struct Differ<'a> {
    fetcher: &'a Fetcher,
}

impl<'a> Differ<'a> {
    pub fn new(fetcher: &'a Fetcher) -> Self {
        Self { fetcher }
    }

    /// Fetch both images in parallel and classify every new-image layer.
    pub async fn compare(
        &self,
        new_ref: &str,
        base_ref: &str,
        platform: &Platform,
    ) -> Result<DiffResult> {
        let started = std::time::Instant::now();

        let (new_image, base_image) = tokio::try_join!(
            self.fetcher.fetch_image_metadata(new_ref, platform),
            self.fetcher.fetch_image_metadata(base_ref, platform),
        )?;

        tracing::debug!(
            new = new_ref,
            base = base_ref,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched both images"
        );

        Ok(classify(new_image, base_image))
    }
}

/// Pure classification over two fetched metadata values.
///
/// Deterministic: depends only on the diffID sequences (plus sizes for the
/// aggregates).
pub(crate) fn classify(new_image: ImageMetadata, base_image: ImageMetadata) -> DiffResult {
    let base_diff_ids: HashSet<&str> =
        base_image.diff_ids.iter().map(String::as_str).collect();

    let mut layer_diffs = Vec::with_capacity(new_image.layers.len());
    let mut new_layers_size = 0i64;
    let mut shared_layers_size = 0i64;

    for layer in &new_image.layers {
        let status = if base_diff_ids.contains(layer.diff_id.as_str()) {
            shared_layers_size += layer.size;
            LayerStatus::Shared
        } else {
            new_layers_size += layer.size;
            LayerStatus::New
        };

        layer_diffs.push(LayerDiff {
            diff_id: layer.diff_id.clone(),
            digest: layer.digest.clone(),
            size: layer.size,
            command: layer.command.clone(),
            status,
        });
    }

    let shared_prefix_len = new_image
        .diff_ids
        .iter()
        .zip(base_image.diff_ids.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let total_new_image_size = new_image.total_size;
    let savings_size = shared_layers_size;
    let savings_percentage = if total_new_image_size > 0 {
        savings_size as f64 / total_new_image_size as f64 * 100.0
    } else {
        0.0
    };

    DiffResult {
        new_image,
        base_image,
        layer_diffs,
        shared_prefix_len,
        new_layers_size,
        shared_layers_size,
        total_new_image_size,
        savings_size,
        savings_percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{LayerHandle, MemoryBlobSource};
    use std::sync::Arc;

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

        ImageMetadata {
            reference: reference.to_string(),
            platform: "linux/amd64".to_string(),
            manifest_digest: format!("sha256:manifest-{}", reference),
            manifest: empty_manifest(),
            config: serde_json::json!({}),
            diff_ids: layers.iter().map(|(_, d, _)| d.to_string()).collect(),
            layers: handles,
            total_size: layers.iter().map(|(_, _, s)| s).sum(),
        }
    }

    #[test]
    fn test_classify_shared_prefix() {
        let new = metadata(
            "app:2",
            &[
                ("sha256:c1", "sha256:d1", 100),
                ("sha256:c2", "sha256:d2", 200),
                ("sha256:c3", "sha256:d3", 300),
            ],
        );
        let base = metadata(
            "app:1",
            &[("sha256:x1", "sha256:d1", 100), ("sha256:x2", "sha256:dX", 50)],
        );

        let result = classify(new, base);

        assert_eq!(result.shared_prefix_len, 1);
        assert_eq!(result.layer_diffs[0].status, LayerStatus::Shared);
        assert_eq!(result.layer_diffs[1].status, LayerStatus::New);
        assert_eq!(result.layer_diffs[2].status, LayerStatus::New);
        assert_eq!(result.shared_layers_size, 100);
        assert_eq!(result.new_layers_size, 500);
    }

    #[test]
    fn test_classify_ignores_digest_differences() {
        // Same diffIDs, completely different compressed digests: everything
        // is shared.
        let new = metadata("app:2", &[("sha256:cA", "sha256:d1", 10)]);
        let base = metadata("app:1", &[("sha256:cB", "sha256:d1", 10)]);

        let result = classify(new, base);
        assert_eq!(result.shared_prefix_len, 1);
        assert_eq!(result.new_layers().count(), 0);
    }

    #[test]
    fn test_classify_shared_after_new_is_not_prefix() {
        let new = metadata(
            "app:2",
            &[
                ("sha256:c1", "sha256:dNEW", 10),
                ("sha256:c2", "sha256:d1", 20),
            ],
        );
        let base = metadata("app:1", &[("sha256:x1", "sha256:d1", 20)]);

        let result = classify(new, base);

        // The second layer is SHARED by membership but the prefix is empty:
        // it cannot be spliced at load time.
        assert_eq!(result.shared_prefix_len, 0);
        assert_eq!(result.layer_diffs[0].status, LayerStatus::New);
        assert_eq!(result.layer_diffs[1].status, LayerStatus::Shared);
    }

    #[test]
    fn test_classify_base_longer_than_new() {
        let new = metadata("app:2", &[("sha256:c1", "sha256:d1", 10)]);
        let base = metadata(
            "app:1",
            &[("sha256:x1", "sha256:d1", 10), ("sha256:x2", "sha256:d2", 20)],
        );

        let result = classify(new, base);
        assert_eq!(result.shared_prefix_len, 1);
        assert_eq!(result.new_layers().count(), 0);
    }

    #[test]
    fn test_classify_identical_images() {
        let layers = &[
            ("sha256:c1", "sha256:d1", 10),
            ("sha256:c2", "sha256:d2", 20),
        ];
        let result = classify(metadata("app:2", layers), metadata("app:1", layers));

        assert_eq!(result.shared_prefix_len, 2);
        assert_eq!(result.new_layers().count(), 0);
        assert_eq!(result.savings_size, 30);
        assert!((result.savings_percentage - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_classify_nothing_shared() {
        let new = metadata("app:2", &[("sha256:c1", "sha256:d1", 10)]);
        let base = metadata("app:1", &[("sha256:x1", "sha256:dZ", 10)]);

        let result = classify(new, base);
        assert_eq!(result.shared_prefix_len, 0);
        assert_eq!(result.shared_layers().count(), 0);
        assert_eq!(result.savings_size, 0);
    }

    #[test]
    fn test_classify_empty_new_image() {
        let new = metadata("app:2", &[]);
        let base = metadata("app:1", &[("sha256:x1", "sha256:d1", 10)]);

        let result = classify(new, base);
        assert_eq!(result.shared_prefix_len, 0);
        assert!(result.layer_diffs.is_empty());
        assert_eq!(result.savings_percentage, 0.0);
    }
}
