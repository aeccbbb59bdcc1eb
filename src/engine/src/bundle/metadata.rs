//! Bundle metadata schema (v2).
//!
//! Registry blobs are stored compressed, exactly as served; the metadata
//! carries the digest/diffID pairing the loader needs to verify and
//! rebuild a runtime-loadable archive.

use imgcd_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Current bundle format version.
pub const BUNDLE_VERSION: &str = "2";

/// Information about a single layer contained in the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerInfo {
    /// Compressed digest (the blob entry name)
    pub digest: String,
    /// Uncompressed digest, verified on load
    pub diffid: String,
    /// Compressed size in bytes
    pub size: i64,
    /// Uncompressed size in bytes, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_size: Option<i64>,
    /// Layer media type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// Metadata persisted as `metadata.json` inside a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMetadata {
    /// Bundle format version
    pub version: String,
    /// Full reference of the exported image
    pub image_ref: String,
    /// Base reference for incremental exports; empty for full exports
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_ref: String,
    /// Number of leading layers expected from the local base image at load
    /// time; 0 for full exports
    #[serde(default, skip_serializing_if = "is_zero")]
    pub shared_layer_count: usize,
    /// Target platform (e.g. "linux/amd64")
    pub platform: String,
    /// The image manifest, verbatim
    pub manifest: serde_json::Value,
    /// The image config, verbatim; carries the full diffID chain
    pub config: serde_json::Value,
    /// Layers contained in the bundle, chain order
    pub layers: Vec<LayerInfo>,
    /// Total compressed size of the contained layers
    pub total_size: i64,
    /// Creation timestamp, RFC 3339
    pub created_at: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl BundleMetadata {
    /// The full diffID chain from `config.rootfs.diff_ids`.
    pub fn diff_ids(&self) -> Result<Vec<String>> {
        let ids = self
            .config
            .pointer("/rootfs/diff_ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                Error::BundleFormat("config has no rootfs.diff_ids".to_string())
            })?;

        ids.iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    Error::BundleFormat("non-string entry in rootfs.diff_ids".to_string())
                })
            })
            .collect()
    }

    /// Enforce the chain invariant: the shared prefix plus the contained
    /// layers must cover `config.rootfs.diff_ids` exactly, and the trailing
    /// diffIDs must match the contained layers pointwise.
    pub fn validate_chain(&self) -> Result<()> {
        let diff_ids = self.diff_ids()?;

        if self.shared_layer_count + self.layers.len() != diff_ids.len() {
            return Err(Error::BundleFormat(format!(
                "layer chain mismatch: {} shared + {} contained != {} diff_ids",
                self.shared_layer_count,
                self.layers.len(),
                diff_ids.len()
            )));
        }

        for (i, layer) in self.layers.iter().enumerate() {
            let expected = &diff_ids[self.shared_layer_count + i];
            if &layer.diffid != expected {
                return Err(Error::BundleFormat(format!(
                    "layer {} diffid {} does not match config diff_id {}",
                    self.shared_layer_count + i,
                    layer.diffid,
                    expected
                )));
            }
        }

        Ok(())
    }
}
