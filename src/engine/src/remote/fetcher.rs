//! Image metadata fetching from OCI registries.
//!
//! Resolves a reference plus target platform to a manifest, config, and a
//! set of lazy layer handles. No layer bytes are transferred here; handles
//! pull their compressed stream on demand.

use std::sync::Arc;

use async_trait::async_trait;
use imgcd_core::{Error, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::{Client, Reference};
use serde::Deserialize;
use tokio::io::AsyncWrite;

use super::{BlobSource, CredentialStore, LayerHandle};
use crate::platform::Platform;

/// Metadata for an image resolved at a specific platform.
pub struct ImageMetadata {
    /// The reference as given by the caller
    pub reference: String,
    /// The platform the manifest was resolved for
    pub platform: String,
    /// Digest of the (platform-specific) manifest
    pub manifest_digest: String,
    /// The manifest itself
    pub manifest: OciImageManifest,
    /// The image config, verbatim
    pub config: serde_json::Value,
    /// Ordered uncompressed digests from `config.rootfs.diff_ids`
    pub diff_ids: Vec<String>,
    /// Ordered layer handles, manifest order
    pub layers: Vec<LayerHandle>,
    /// Sum of compressed layer sizes
    pub total_size: i64,
}

/// Result of resolving a tag input against a repository's tag list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagResolution {
    /// The input matched a tag exactly.
    Exact(String),
    /// Exactly one tag contained the input.
    Fuzzy(String),
    /// Several tags contained the input; the caller must disambiguate.
    Ambiguous(Vec<String>),
}

/// The shape of an image config we need for layer identity.
#[derive(Deserialize)]
struct ConfigDoc {
    rootfs: RootFsDoc,
    #[serde(default)]
    history: Vec<HistoryDoc>,
}

#[derive(Deserialize)]
struct RootFsDoc {
    diff_ids: Vec<String>,
}

#[derive(Deserialize)]
struct HistoryDoc {
    #[serde(default)]
    created_by: String,
    #[serde(default)]
    empty_layer: bool,
}

/// Fetches image metadata and tag lists from remote registries.
pub struct Fetcher {
    credentials: CredentialStore,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    /// Create a fetcher backed by the ambient credential store.
    pub fn new() -> Self {
        Self {
            credentials: CredentialStore::load(),
        }
    }

    /// Fetch manifest, config, and layer handles for `reference` at
    /// `platform`. Multi-platform manifest lists are resolved to the entry
    /// matching the platform; no match is a [`Error::ManifestNotFound`].
    pub async fn fetch_image_metadata(
        &self,
        reference: &str,
        platform: &Platform,
    ) -> Result<ImageMetadata> {
        let oci_ref: Reference = reference
            .parse()
            .map_err(|e| Error::InvalidReference(format!("{}: {}", reference, e)))?;
        let auth = self.credentials.auth_for(oci_ref.registry());

        tracing::debug!(reference, platform = %platform, "Fetching image metadata");
        let started = std::time::Instant::now();

        let client = Arc::new(Client::new(platform_client_config(platform)));
        let (manifest, manifest_digest, config_raw) = client
            .pull_manifest_and_config(&oci_ref, &auth)
            .await
            .map_err(|e| map_registry_error(reference, &oci_ref, platform, e))?;

        let config: serde_json::Value = serde_json::from_str(&config_raw)?;
        let config_doc: ConfigDoc = serde_json::from_str(&config_raw)?;
        let diff_ids = config_doc.rootfs.diff_ids;

        if manifest.layers.len() != diff_ids.len() {
            return Err(Error::Registry {
                reference: reference.to_string(),
                message: format!(
                    "manifest has {} layers but config lists {} diff_ids",
                    manifest.layers.len(),
                    diff_ids.len()
                ),
            });
        }

        // History entries for empty layers (ENV, LABEL, ...) have no
        // corresponding diff_id; skip them when labelling layers.
        let commands: Vec<String> = config_doc
            .history
            .iter()
            .filter(|h| !h.empty_layer)
            .map(|h| h.created_by.clone())
            .collect();

        let mut layers = Vec::with_capacity(manifest.layers.len());
        let mut total_size = 0i64;
        for (i, descriptor) in manifest.layers.iter().enumerate() {
            total_size += descriptor.size;
            layers.push(LayerHandle::new(
                descriptor.digest.clone(),
                diff_ids[i].clone(),
                descriptor.size,
                descriptor.media_type.clone(),
                commands.get(i).cloned().unwrap_or_default(),
                Arc::new(RemoteBlobSource {
                    client: client.clone(),
                    reference: oci_ref.clone(),
                    descriptor: descriptor.clone(),
                }),
            ));
        }

        tracing::debug!(
            reference,
            digest = %manifest_digest,
            layer_count = layers.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched image metadata"
        );

        Ok(ImageMetadata {
            reference: reference.to_string(),
            platform: platform.to_string(),
            manifest_digest,
            manifest,
            config,
            diff_ids,
            layers,
            total_size,
        })
    }

    /// List all tags of a repository.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let oci_ref: Reference = repository
            .parse()
            .map_err(|e| Error::InvalidReference(format!("{}: {}", repository, e)))?;
        let auth = self.credentials.auth_for(oci_ref.registry());

        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });

        let response = client
            .list_tags(&oci_ref, &auth, None, None)
            .await
            .map_err(|e| Error::Registry {
                reference: repository.to_string(),
                message: format!("failed to list tags: {}", e),
            })?;

        Ok(response.tags)
    }

    /// Resolve a tag input against a repository.
    ///
    /// An exact match wins. Otherwise tags containing the input are
    /// considered: one match resolves, several are returned for the caller
    /// to disambiguate, none is an error.
    pub async fn resolve_tag(&self, repository: &str, input: &str) -> Result<TagResolution> {
        let tags = self.list_tags(repository).await?;
        resolve_tag_against(&tags, repository, input)
    }
}

/// Pure tag-resolution logic over a fetched tag list.
fn resolve_tag_against(tags: &[String], repository: &str, input: &str) -> Result<TagResolution> {
    if tags.iter().any(|t| t == input) {
        return Ok(TagResolution::Exact(input.to_string()));
    }

    let mut matches: Vec<String> = tags
        .iter()
        .filter(|t| t.contains(input))
        .cloned()
        .collect();

    match matches.len() {
        0 => Err(Error::Registry {
            reference: repository.to_string(),
            message: format!("no tags found matching '{}'", input),
        }),
        1 => Ok(TagResolution::Fuzzy(matches.remove(0))),
        _ => Ok(TagResolution::Ambiguous(matches)),
    }
}

/// Client config whose manifest-list resolver picks our target platform.
fn platform_client_config(platform: &Platform) -> ClientConfig {
    let os = platform.os.clone();
    let arch = platform.arch.clone();
    let variant = platform.variant.clone();

    ClientConfig {
        protocol: ClientProtocol::Https,
        platform_resolver: Some(Box::new(move |entries: &[ImageIndexEntry]| {
            entries
                .iter()
                .find(|e| {
                    e.platform.as_ref().is_some_and(|p| {
                        p.os == os
                            && p.architecture == arch
                            && (variant.is_none() || p.variant == variant)
                    })
                })
                .map(|e| e.digest.clone())
        })),
        ..Default::default()
    }
}

/// Translate client errors into our error kinds.
fn map_registry_error(
    reference: &str,
    oci_ref: &Reference,
    platform: &Platform,
    err: oci_distribution::errors::OciDistributionError,
) -> Error {
    let message = err.to_string();
    let lowered = message.to_lowercase();

    if lowered.contains("unauthorized") || lowered.contains("401") {
        return Error::Unauthorized {
            registry: oci_ref.registry().to_string(),
        };
    }
    if lowered.contains("platform") || lowered.contains("not found") || lowered.contains("404") {
        return Error::ManifestNotFound {
            reference: reference.to_string(),
            platform: platform.to_string(),
        };
    }

    Error::Registry {
        reference: reference.to_string(),
        message,
    }
}

/// Pulls a layer's compressed bytes from the registry on demand.
struct RemoteBlobSource {
    client: Arc<Client>,
    reference: Reference,
    descriptor: OciDescriptor,
}

#[async_trait]
impl BlobSource for RemoteBlobSource {
    async fn copy_compressed(&self, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        self.client
            .pull_blob(&self.reference, &self.descriptor, &mut *out)
            .await
            .map_err(|e| Error::Registry {
                reference: self.reference.whole(),
                message: format!("failed to pull blob {}: {}", self.descriptor.digest, e),
            })?;
        Ok(self.descriptor.size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_tag_exact_match_wins() {
        let t = tags(&["3.19", "3.19.1", "3.20"]);
        assert_eq!(
            resolve_tag_against(&t, "alpine", "3.19").unwrap(),
            TagResolution::Exact("3.19".to_string())
        );
    }

    #[test]
    fn test_resolve_tag_single_fuzzy() {
        let t = tags(&["3.19", "3.20", "edge"]);
        assert_eq!(
            resolve_tag_against(&t, "alpine", "edg").unwrap(),
            TagResolution::Fuzzy("edge".to_string())
        );
    }

    #[test]
    fn test_resolve_tag_ambiguous() {
        let t = tags(&["3.19", "3.19.1", "3.19.2"]);
        match resolve_tag_against(&t, "alpine", "3.19.").unwrap() {
            TagResolution::Ambiguous(candidates) => {
                assert_eq!(candidates, tags(&["3.19.1", "3.19.2"]));
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_tag_no_match() {
        let t = tags(&["3.19", "3.20"]);
        assert!(resolve_tag_against(&t, "alpine", "4.0").is_err());
    }

    #[test]
    fn test_platform_resolver_picks_matching_entry() {
        let config = platform_client_config(&Platform::parse("linux/arm64").unwrap());
        let resolver = config.platform_resolver.expect("resolver set");

        let entries = vec![
            index_entry("sha256:amd", "linux", "amd64"),
            index_entry("sha256:arm", "linux", "arm64"),
        ];
        assert_eq!(resolver(&entries), Some("sha256:arm".to_string()));
    }

    #[test]
    fn test_platform_resolver_no_match() {
        let config = platform_client_config(&Platform::parse("darwin/arm64").unwrap());
        let resolver = config.platform_resolver.expect("resolver set");

        let entries = vec![index_entry("sha256:amd", "linux", "amd64")];
        assert_eq!(resolver(&entries), None);
    }

    fn index_entry(digest: &str, os: &str, arch: &str) -> ImageIndexEntry {
        ImageIndexEntry {
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            digest: digest.to_string(),
            size: 0,
            platform: Some(oci_distribution::manifest::Platform {
                architecture: arch.to_string(),
                os: os.to_string(),
                os_version: None,
                os_features: None,
                variant: None,
                features: None,
            }),
            annotations: None,
        }
    }
}
