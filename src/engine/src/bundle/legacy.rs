//! Legacy (v1.0) bundle support.
//!
//! v1 bundles carry `imgcd-meta.json` plus an inline Docker `image.tar`.
//! Non-incremental bundles stream that tar straight to the runtime.
//! Incremental bundles contain only the new layers; the base image's
//! layers are re-acquired from the local runtime and spliced in front.

use std::fs::File;
use std::path::Path;

use imgcd_core::{Error, Result};
use serde::Deserialize;

use super::loader::{append_bytes, append_file, export_base_image, repositories_doc};
use super::DockerManifestEntry;
use crate::reference::parse_reference;
use crate::runtime::ContainerRuntime;

/// Metadata of a v1 bundle (`imgcd-meta.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyMetadata {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub new_ref: String,
    #[serde(default)]
    pub since_ref: String,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub layer_count: usize,
}

/// Load a v1 bundle whose `image.tar` was extracted to `scratch`.
pub(crate) async fn load_legacy(
    runtime: &dyn ContainerRuntime,
    metadata: &LegacyMetadata,
    scratch: &Path,
) -> Result<String> {
    tracing::info!(
        image = %metadata.new_ref,
        version = %metadata.version,
        incremental = metadata.incremental,
        "Loading legacy bundle"
    );

    let image_tar = scratch.join("image.tar");

    if !metadata.incremental {
        // Full v1 bundle: the inline tar is already a loadable archive.
        let mut file = tokio::fs::File::open(&image_tar).await?;
        runtime.load_image_from(&mut file).await?;
        return Ok(metadata.new_ref.clone());
    }

    if metadata.since_ref.is_empty() {
        return Err(Error::BundleFormat(
            "incremental legacy bundle carries no since_ref".to_string(),
        ));
    }

    // Unpack the inline tar: it holds the new image's config, the NEW
    // layers, and a manifest listing only those layers.
    let inner_dir = scratch.join("inner");
    std::fs::create_dir_all(&inner_dir)?;
    tar::Archive::new(File::open(&image_tar)?)
        .unpack(&inner_dir)
        .map_err(|e| Error::BundleFormat(format!("inline image.tar is unreadable: {}", e)))?;

    let manifest_data = std::fs::read(inner_dir.join("manifest.json")).map_err(|e| {
        Error::BundleFormat(format!("inline image.tar has no manifest.json: {}", e))
    })?;
    let inner_manifest: Vec<DockerManifestEntry> = serde_json::from_slice(&manifest_data)?;
    let inner = inner_manifest
        .into_iter()
        .next()
        .ok_or_else(|| Error::BundleFormat("inline image.tar has an empty manifest".to_string()))?;

    // Splice: every base layer, then the bundle's layers.
    let base = export_base_image(runtime, &metadata.since_ref).await?;

    let merged_path = scratch.join("merged.tar");
    let merged_file = File::create(&merged_path)?;
    let mut builder = tar::Builder::new(merged_file);
    let mut layer_paths: Vec<String> = Vec::new();

    for path in &base.layer_paths {
        let file = File::open(base.extract_dir.join(path)).map_err(|e| Error::BaseMismatch {
            base_ref: metadata.since_ref.clone(),
            message: format!("missing layer {} in exported base: {}", path, e),
        })?;
        append_file(&mut builder, path, file)?;
        layer_paths.push(path.clone());
    }

    let config_file = File::open(inner_dir.join(&inner.config)).map_err(|e| {
        Error::BundleFormat(format!("inline image.tar has no config {}: {}", inner.config, e))
    })?;
    append_file(&mut builder, &inner.config, config_file)?;

    for path in &inner.layers {
        let file = File::open(inner_dir.join(path)).map_err(|e| {
            Error::BundleFormat(format!("inline image.tar is missing layer {}: {}", path, e))
        })?;
        append_file(&mut builder, path, file)?;
        layer_paths.push(path.clone());
    }

    let manifest = vec![DockerManifestEntry {
        config: inner.config.clone(),
        repo_tags: vec![metadata.new_ref.clone()],
        layers: layer_paths.clone(),
    }];
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    let (repo, tag) = parse_reference(&metadata.new_ref);
    let last_layer_id = layer_paths
        .last()
        .and_then(|p| p.split('/').next())
        .unwrap_or_default();
    append_bytes(
        &mut builder,
        "repositories",
        &serde_json::to_vec(&repositories_doc(&repo, &tag, last_layer_id))?,
    )?;

    builder.finish()?;

    let mut file = tokio::fs::File::open(&merged_path).await?;
    runtime.load_image_from(&mut file).await?;

    Ok(metadata.new_ref.clone())
}
