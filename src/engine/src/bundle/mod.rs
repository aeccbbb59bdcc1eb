//! Bundle format: packing on export, verification and reconstruction on
//! import.
//!
//! A bundle is a gzipped tar with `metadata.json` first, followed by one
//! `blobs/sha256/<hex>` entry per exported layer, in metadata order. The
//! legacy v1 format (`imgcd-meta.json` plus an inline Docker `image.tar`)
//! is accepted on load.

mod legacy;
mod loader;
mod metadata;
mod packer;

pub use legacy::LegacyMetadata;
pub use loader::BundleLoader;
pub use metadata::{BundleMetadata, LayerInfo, BUNDLE_VERSION};
pub use packer::BundlePacker;

use serde::{Deserialize, Serialize};

/// Name of the metadata entry inside a v2 bundle.
pub(crate) const METADATA_ENTRY: &str = "metadata.json";

/// Name of the metadata entry inside a legacy v1 bundle.
pub(crate) const LEGACY_METADATA_ENTRY: &str = "imgcd-meta.json";

/// Prefix of blob entries inside a v2 bundle.
pub(crate) const BLOB_ENTRY_PREFIX: &str = "blobs/sha256/";

/// One element of the `manifest.json` array in a Docker image archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DockerManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Truncate a digest to the 12-hex-char form Docker uses for archive paths.
pub(crate) fn short_hash(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash() {
        assert_eq!(
            short_hash("sha256:abcdef0123456789abcdef0123456789"),
            "abcdef012345"
        );
        assert_eq!(short_hash("abcd"), "abcd");
    }
}
