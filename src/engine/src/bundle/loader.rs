//! Bundle loading and image reconstruction.
//!
//! Parses a bundle, verifies its blob set against the metadata, rebuilds a
//! Docker image archive (decompressing and diffID-verifying every contained
//! layer, splicing shared layers from a local base image when the bundle is
//! incremental), and hands the archive to the container runtime. Any
//! mismatch is fatal; the runtime is never called with a half-built
//! archive.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use imgcd_core::{Error, Result};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use super::{
    legacy, short_hash, BundleMetadata, DockerManifestEntry, LegacyMetadata,
    BLOB_ENTRY_PREFIX, BUNDLE_VERSION, LEGACY_METADATA_ENTRY, METADATA_ENTRY,
};
use crate::reference::parse_reference;
use crate::runtime::ContainerRuntime;

/// Loads bundles into a container runtime.
pub struct BundleLoader<'a> {
    runtime: &'a dyn ContainerRuntime,
}

/// What a single pass over the bundle archive produced.
struct ParsedBundle {
    metadata: Option<BundleMetadata>,
    legacy: Option<LegacyMetadata>,
    has_image_tar: bool,
    /// Scratch directory holding extracted blobs (and `image.tar` for v1)
    scratch: TempDir,
}

/// A base image exported from the local runtime, extracted to disk.
pub(crate) struct BaseImage {
    /// Keeps the extraction directory alive
    _dir: TempDir,
    pub extract_dir: PathBuf,
    /// Ordered layer paths from the base archive's manifest
    pub layer_paths: Vec<String>,
}

impl<'a> BundleLoader<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Load a bundle file into the runtime. Returns the imported image
    /// reference.
    pub async fn load(&self, bundle_path: &Path) -> Result<String> {
        tracing::info!(path = %bundle_path.display(), "Loading bundle");

        let parsed = parse_bundle(bundle_path)?;

        if let Some(meta) = parsed.legacy {
            if !parsed.has_image_tar {
                return Err(Error::BundleFormat(
                    "legacy bundle has no image.tar entry".to_string(),
                ));
            }
            return legacy::load_legacy(self.runtime, &meta, parsed.scratch.path()).await;
        }

        let metadata = parsed.metadata.ok_or_else(|| {
            Error::BundleFormat("metadata.json not found in bundle".to_string())
        })?;

        if metadata.version != BUNDLE_VERSION {
            return Err(Error::UnsupportedBundleVersion(metadata.version.clone()));
        }

        self.load_v2(metadata, parsed.scratch).await
    }

    async fn load_v2(&self, metadata: BundleMetadata, scratch: TempDir) -> Result<String> {
        metadata.validate_chain()?;

        tracing::info!(
            image = %metadata.image_ref,
            platform = %metadata.platform,
            layers = metadata.layers.len(),
            shared = metadata.shared_layer_count,
            "Bundle parsed"
        );

        // Every blob the metadata references must be in the bundle.
        for layer in &metadata.layers {
            if !blob_scratch_path(scratch.path(), &layer.digest).exists() {
                return Err(Error::IncompleteBundle {
                    digest: layer.digest.clone(),
                });
            }
        }

        let base = self.acquire_base(&metadata).await?;

        let image_tar = scratch.path().join("image.tar");
        rebuild_image_tar(&image_tar, scratch.path(), &metadata, base.as_ref())?;

        tracing::info!("Handing reconstructed archive to container runtime");
        let mut file = tokio::fs::File::open(&image_tar).await?;
        self.runtime.load_image_from(&mut file).await?;

        Ok(metadata.image_ref)
    }

    /// Export and extract the base image when the bundle is incremental.
    async fn acquire_base(&self, metadata: &BundleMetadata) -> Result<Option<BaseImage>> {
        if metadata.shared_layer_count == 0 {
            return Ok(None);
        }

        if metadata.base_ref.is_empty() {
            return Err(Error::BundleFormat(
                "incremental bundle carries no base_ref".to_string(),
            ));
        }

        tracing::info!(
            base = %metadata.base_ref,
            shared = metadata.shared_layer_count,
            "Exporting base image from local runtime"
        );

        let base = export_base_image(self.runtime, &metadata.base_ref).await?;

        if base.layer_paths.len() < metadata.shared_layer_count {
            return Err(Error::BaseMismatch {
                base_ref: metadata.base_ref.clone(),
                message: format!(
                    "base image has {} layers but the bundle requires {}",
                    base.layer_paths.len(),
                    metadata.shared_layer_count
                ),
            });
        }

        Ok(Some(base))
    }
}

/// Export `base_ref` via the runtime and extract its archive.
pub(crate) async fn export_base_image(
    runtime: &dyn ContainerRuntime,
    base_ref: &str,
) -> Result<BaseImage> {
    let dir = TempDir::new()?;
    let tar_path = dir.path().join("base.tar");

    runtime
        .save_image(base_ref, &tar_path)
        .await
        .map_err(|e| Error::BaseMismatch {
            base_ref: base_ref.to_string(),
            message: format!("local runtime could not export it: {}", e),
        })?;

    let extract_dir = dir.path().join("extracted");
    std::fs::create_dir_all(&extract_dir)?;
    tar::Archive::new(File::open(&tar_path)?)
        .unpack(&extract_dir)
        .map_err(|e| Error::BaseMismatch {
            base_ref: base_ref.to_string(),
            message: format!("exported archive is unreadable: {}", e),
        })?;

    let manifest_data = std::fs::read(extract_dir.join("manifest.json")).map_err(|e| {
        Error::BaseMismatch {
            base_ref: base_ref.to_string(),
            message: format!("exported archive has no manifest.json: {}", e),
        }
    })?;
    let manifest: Vec<DockerManifestEntry> = serde_json::from_slice(&manifest_data)?;
    let entry = manifest.into_iter().next().ok_or_else(|| Error::BaseMismatch {
        base_ref: base_ref.to_string(),
        message: "exported archive has an empty manifest".to_string(),
    })?;

    Ok(BaseImage {
        _dir: dir,
        extract_dir,
        layer_paths: entry.layers,
    })
}

/// Single pass over the bundle tar, extracting what we need.
fn parse_bundle(bundle_path: &Path) -> Result<ParsedBundle> {
    let file = File::open(bundle_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let scratch = TempDir::new()?;

    let mut metadata = None;
    let mut legacy = None;
    let mut has_image_tar = false;

    let entries = archive
        .entries()
        .map_err(|e| Error::BundleFormat(format!("failed to read bundle archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::BundleFormat(format!("failed to read bundle entry: {}", e)))?;
        let name = entry.path()?.to_string_lossy().to_string();

        if name == METADATA_ENTRY {
            metadata = Some(serde_json::from_reader(&mut entry)?);
        } else if name == LEGACY_METADATA_ENTRY {
            legacy = Some(serde_json::from_reader(&mut entry)?);
        } else if let Some(hex) = name.strip_prefix(BLOB_ENTRY_PREFIX) {
            let out = blob_scratch_path(scratch.path(), hex);
            extract_entry(&mut entry, &out)?;
        } else if name == "image.tar" {
            extract_entry(&mut entry, &scratch.path().join("image.tar"))?;
            has_image_tar = true;
        } else {
            // Unknown top-level entries are tolerated and ignored.
            tracing::debug!(entry = %name, "Ignoring unknown bundle entry");
        }
    }

    Ok(ParsedBundle {
        metadata,
        legacy,
        has_image_tar,
        scratch,
    })
}

/// Where an extracted blob lives inside the scratch directory.
fn blob_scratch_path(scratch: &Path, digest: &str) -> PathBuf {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    scratch.join("blobs").join(hex)
}

fn extract_entry<R: Read>(entry: &mut R, out: &Path) -> Result<()> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(out)?;
    std::io::copy(entry, &mut file)?;
    Ok(())
}

/// Rebuild a Docker image archive from the extracted bundle.
///
/// Archive layout: spliced base layers (original paths), then
/// `<first12(diff_ids[0])>.json` config, then one `<first12(diffID)>/layer.tar`
/// per contained layer, then `manifest.json` and `repositories`.
fn rebuild_image_tar(
    out_path: &Path,
    scratch: &Path,
    metadata: &BundleMetadata,
    base: Option<&BaseImage>,
) -> Result<()> {
    let out_file = File::create(out_path)?;
    let mut builder = tar::Builder::new(out_file);

    let diff_ids = metadata.diff_ids()?;
    let mut layer_paths: Vec<String> = Vec::new();

    // Shared prefix comes from the base image, byte-for-byte, keeping the
    // original archive paths so the new manifest can reference them.
    if let Some(base) = base {
        for path in &base.layer_paths[..metadata.shared_layer_count] {
            let src = base.extract_dir.join(path);
            let file = File::open(&src).map_err(|e| Error::BaseMismatch {
                base_ref: metadata.base_ref.clone(),
                message: format!("missing layer {} in exported base: {}", path, e),
            })?;
            append_file(&mut builder, path, file)?;
            layer_paths.push(path.clone());
        }
    }

    // Image config, named after the first diffID of the full chain.
    let config_name = match diff_ids.first() {
        Some(first) => format!("{}.json", short_hash(first)),
        None => "unknown.json".to_string(),
    };
    let config_bytes = serde_json::to_vec(&metadata.config)?;
    append_bytes(&mut builder, &config_name, &config_bytes)?;

    // Contained layers: decompress, verify diffID, stream into the archive.
    for (i, layer) in metadata.layers.iter().enumerate() {
        let chain_index = metadata.shared_layer_count + i;
        tracing::debug!(layer = chain_index, digest = %layer.digest, "Processing layer");

        let blob_path = blob_scratch_path(scratch, &layer.digest);
        let uncompressed_path = scratch.join(format!("layer-{}.tar", chain_index));
        let actual_diffid = decompress_and_hash(&blob_path, &uncompressed_path)?;

        if actual_diffid != layer.diffid {
            return Err(Error::DiffIdMismatch {
                index: chain_index,
                expected: layer.diffid.clone(),
                actual: actual_diffid,
            });
        }

        let layer_path = format!("{}/layer.tar", short_hash(&layer.diffid));
        append_file(&mut builder, &layer_path, File::open(&uncompressed_path)?)?;
        layer_paths.push(layer_path);

        let _ = std::fs::remove_file(&uncompressed_path);
    }

    // manifest.json
    let manifest = vec![DockerManifestEntry {
        config: config_name,
        repo_tags: vec![metadata.image_ref.clone()],
        layers: layer_paths.clone(),
    }];
    append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    // repositories (legacy consumers expect it)
    let (repo, tag) = parse_reference(&metadata.image_ref);
    let last_layer_id = layer_paths
        .last()
        .and_then(|p| p.split('/').next())
        .map(short_hash)
        .unwrap_or_default();
    append_bytes(
        &mut builder,
        "repositories",
        &serde_json::to_vec(&repositories_doc(&repo, &tag, &last_layer_id))?,
    )?;

    builder.finish()?;
    Ok(())
}

/// Build the legacy `repositories` document: `{repo: {tag: layer_id}}`.
pub(crate) fn repositories_doc(repo: &str, tag: &str, layer_id: &str) -> serde_json::Value {
    let mut tags = serde_json::Map::new();
    tags.insert(tag.to_string(), serde_json::Value::String(layer_id.to_string()));
    let mut repos = serde_json::Map::new();
    repos.insert(repo.to_string(), serde_json::Value::Object(tags));
    serde_json::Value::Object(repos)
}

/// Decompress a gzip blob to `out`, returning the diffID of the
/// uncompressed stream.
fn decompress_and_hash(blob_path: &Path, out: &Path) -> Result<String> {
    let blob = File::open(blob_path)?;
    let mut decoder = GzDecoder::new(blob);

    let file = File::create(out)?;
    let mut writer = HashingFileWriter {
        file,
        hasher: Sha256::new(),
    };
    std::io::copy(&mut decoder, &mut writer)
        .map_err(|e| Error::BundleFormat(format!("failed to decompress blob: {}", e)))?;
    writer.file.flush()?;

    Ok(format!("sha256:{:x}", writer.hasher.finalize()))
}

/// Write adapter that hashes everything it writes to the file.
struct HashingFileWriter {
    file: File,
    hasher: Sha256,
}

impl Write for HashingFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Append a file entry with mode 0644.
pub(crate) fn append_file<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    file: File,
) -> Result<()> {
    let size = file.metadata()?.len();
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, file)?;
    Ok(())
}

/// Append an in-memory entry with mode 0644.
pub(crate) fn append_bytes<W: std::io::Write>(
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::LayerInfo;
    use crate::runtime::MockRuntime;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;

    /// gzip some bytes.
    fn gz(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn sha(data: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(data))
    }

    /// A layer fixture: uncompressed "tar" bytes plus the compressed blob.
    struct FixtureLayer {
        uncompressed: Vec<u8>,
        compressed: Vec<u8>,
        digest: String,
        diffid: String,
    }

    fn fixture_layer(content: &[u8]) -> FixtureLayer {
        let compressed = gz(content);
        FixtureLayer {
            digest: sha(&compressed),
            diffid: sha(content),
            uncompressed: content.to_vec(),
            compressed,
        }
    }

    /// Build a v2 bundle file from metadata plus blob bytes.
    fn write_bundle(
        path: &Path,
        metadata: &BundleMetadata,
        blobs: &[(&str, &[u8])],
        extra_entries: &[(&str, &[u8])],
    ) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let meta_bytes = serde_json::to_vec_pretty(metadata).unwrap();
        append_bytes(&mut builder, METADATA_ENTRY, &meta_bytes).unwrap();

        for (digest, data) in blobs {
            let hex = digest.strip_prefix("sha256:").unwrap();
            append_bytes(&mut builder, &format!("blobs/sha256/{}", hex), data).unwrap();
        }
        for (name, data) in extra_entries {
            append_bytes(&mut builder, name, data).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap();
    }

    fn v2_metadata(
        image_ref: &str,
        base_ref: &str,
        shared: usize,
        chain: &[&FixtureLayer],
        contained: &[&FixtureLayer],
    ) -> BundleMetadata {
        BundleMetadata {
            version: BUNDLE_VERSION.to_string(),
            image_ref: image_ref.to_string(),
            base_ref: base_ref.to_string(),
            shared_layer_count: shared,
            platform: "linux/amd64".to_string(),
            manifest: serde_json::json!({"schemaVersion": 2}),
            config: serde_json::json!({
                "architecture": "amd64",
                "os": "linux",
                "rootfs": {
                    "type": "layers",
                    "diff_ids": chain.iter().map(|l| l.diffid.clone()).collect::<Vec<_>>(),
                }
            }),
            layers: contained
                .iter()
                .map(|l| LayerInfo {
                    digest: l.digest.clone(),
                    diffid: l.diffid.clone(),
                    size: l.compressed.len() as i64,
                    uncompressed_size: Some(l.uncompressed.len() as i64),
                    media_type: Some("application/vnd.oci.image.layer.v1.tar+gzip".to_string()),
                })
                .collect(),
            total_size: contained.iter().map(|l| l.compressed.len() as i64).sum(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    /// Build a Docker image archive (as `docker save` would emit) holding
    /// the given uncompressed layers.
    fn docker_archive(repo_tag: &str, layers: &[&FixtureLayer]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let config = serde_json::json!({
            "rootfs": {
                "type": "layers",
                "diff_ids": layers.iter().map(|l| l.diffid.clone()).collect::<Vec<_>>(),
            }
        });
        let config_name = format!("{}.json", short_hash(&layers[0].diffid));
        append_bytes(&mut builder, &config_name, &serde_json::to_vec(&config).unwrap()).unwrap();

        let mut layer_paths = Vec::new();
        for layer in layers {
            let path = format!("{}/layer.tar", short_hash(&layer.diffid));
            append_bytes(&mut builder, &path, &layer.uncompressed).unwrap();
            layer_paths.push(path);
        }

        let manifest = vec![DockerManifestEntry {
            config: config_name,
            repo_tags: vec![repo_tag.to_string()],
            layers: layer_paths,
        }];
        append_bytes(&mut builder, "manifest.json", &serde_json::to_vec(&manifest).unwrap())
            .unwrap();

        builder.into_inner().unwrap()
    }

    /// Parse a loaded archive back into (names, contents).
    fn read_archive(data: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(data);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let name = e.path().unwrap().to_string_lossy().to_string();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_load_full_bundle_reconstructs_archive() {
        let tmp = TempDir::new().unwrap();
        let l1 = fixture_layer(b"layer one tar bytes");
        let l2 = fixture_layer(b"layer two tar bytes");

        let metadata = v2_metadata("app:2.0", "", 0, &[&l1, &l2], &[&l1, &l2]);
        let bundle = tmp.path().join("bundle.tar.gz");
        write_bundle(
            &bundle,
            &metadata,
            &[(&l1.digest, &l1.compressed), (&l2.digest, &l2.compressed)],
            &[],
        );

        let runtime = MockRuntime::new(HashMap::new());
        let loaded_ref = BundleLoader::new(&runtime).load(&bundle).await.unwrap();
        assert_eq!(loaded_ref, "app:2.0");

        let archives = runtime.loaded();
        assert_eq!(archives.len(), 1);
        let entries = read_archive(&archives[0]);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();

        let config_name = format!("{}.json", short_hash(&l1.diffid));
        assert_eq!(names[0], config_name);
        assert_eq!(names[1], format!("{}/layer.tar", short_hash(&l1.diffid)));
        assert_eq!(names[2], format!("{}/layer.tar", short_hash(&l2.diffid)));
        assert_eq!(names[3], "manifest.json");
        assert_eq!(names[4], "repositories");

        // Layer bytes are the originals.
        assert_eq!(entries[1].1, l1.uncompressed);
        assert_eq!(entries[2].1, l2.uncompressed);

        // The config went through verbatim.
        let config: serde_json::Value = serde_json::from_slice(&entries[0].1).unwrap();
        assert_eq!(config, metadata.config);

        // The manifest lists the layers in chain order.
        let manifest: Vec<DockerManifestEntry> = serde_json::from_slice(&entries[3].1).unwrap();
        assert_eq!(manifest[0].repo_tags, vec!["app:2.0".to_string()]);
        assert_eq!(manifest[0].layers.len(), 2);
    }

    #[tokio::test]
    async fn test_load_incremental_splices_base_layers() {
        let tmp = TempDir::new().unwrap();
        let shared = fixture_layer(b"shared base layer");
        let fresh = fixture_layer(b"brand new layer");

        // The local runtime knows the base image.
        let mut images = HashMap::new();
        images.insert(
            "app:1.0".to_string(),
            docker_archive("app:1.0", &[&shared]),
        );
        let runtime = MockRuntime::new(images);

        let metadata = v2_metadata("app:2.0", "app:1.0", 1, &[&shared, &fresh], &[&fresh]);
        let bundle = tmp.path().join("bundle.tar.gz");
        write_bundle(&bundle, &metadata, &[(&fresh.digest, &fresh.compressed)], &[]);

        BundleLoader::new(&runtime).load(&bundle).await.unwrap();

        let archives = runtime.loaded();
        let entries = read_archive(&archives[0]);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();

        // Base layer first, under its original path; then config; then the
        // new layer.
        let base_path = format!("{}/layer.tar", short_hash(&shared.diffid));
        assert_eq!(names[0], base_path);
        assert_eq!(entries[0].1, shared.uncompressed);
        assert_eq!(names[1], format!("{}.json", short_hash(&shared.diffid)));
        assert_eq!(names[2], format!("{}/layer.tar", short_hash(&fresh.diffid)));

        // The manifest covers the full chain.
        let manifest: Vec<DockerManifestEntry> = serde_json::from_slice(
            &entries.iter().find(|(n, _)| n == "manifest.json").unwrap().1,
        )
        .unwrap();
        assert_eq!(manifest[0].layers.len(), 2);
        assert_eq!(manifest[0].layers[0], base_path);
    }

    #[tokio::test]
    async fn test_load_missing_blob_is_incomplete() {
        let tmp = TempDir::new().unwrap();
        let l1 = fixture_layer(b"present layer");
        let l2 = fixture_layer(b"absent layer");

        let metadata = v2_metadata("app:2.0", "", 0, &[&l1, &l2], &[&l1, &l2]);
        let bundle = tmp.path().join("bundle.tar.gz");
        // Only ship the first blob.
        write_bundle(&bundle, &metadata, &[(&l1.digest, &l1.compressed)], &[]);

        let runtime = MockRuntime::new(HashMap::new());
        let err = BundleLoader::new(&runtime).load(&bundle).await.unwrap_err();

        assert!(matches!(err, Error::IncompleteBundle { digest } if digest == l2.digest));
        assert!(runtime.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_load_without_required_base_fails_before_runtime_load() {
        let tmp = TempDir::new().unwrap();
        let shared = fixture_layer(b"shared layer");
        let fresh = fixture_layer(b"fresh layer");

        let metadata = v2_metadata("app:2.0", "app:1.0", 1, &[&shared, &fresh], &[&fresh]);
        let bundle = tmp.path().join("bundle.tar.gz");
        write_bundle(&bundle, &metadata, &[(&fresh.digest, &fresh.compressed)], &[]);

        // Runtime has no base image at all.
        let runtime = MockRuntime::new(HashMap::new());
        let err = BundleLoader::new(&runtime).load(&bundle).await.unwrap_err();

        match err {
            Error::BaseMismatch { base_ref, .. } => assert_eq!(base_ref, "app:1.0"),
            other => panic!("expected BaseMismatch, got {:?}", other),
        }
        assert!(runtime.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_load_base_with_too_few_layers() {
        let tmp = TempDir::new().unwrap();
        let s1 = fixture_layer(b"shared one");
        let s2 = fixture_layer(b"shared two");
        let fresh = fixture_layer(b"fresh layer");

        // Base has one layer; the bundle expects two shared.
        let mut images = HashMap::new();
        images.insert("app:1.0".to_string(), docker_archive("app:1.0", &[&s1]));
        let runtime = MockRuntime::new(images);

        let metadata = v2_metadata("app:2.0", "app:1.0", 2, &[&s1, &s2, &fresh], &[&fresh]);
        let bundle = tmp.path().join("bundle.tar.gz");
        write_bundle(&bundle, &metadata, &[(&fresh.digest, &fresh.compressed)], &[]);

        let err = BundleLoader::new(&runtime).load(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::BaseMismatch { .. }));
        assert!(runtime.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_load_corrupted_blob_is_diffid_mismatch() {
        let tmp = TempDir::new().unwrap();
        let l1 = fixture_layer(b"good layer");

        let metadata = v2_metadata("app:2.0", "", 0, &[&l1], &[&l1]);
        let bundle = tmp.path().join("bundle.tar.gz");
        // Ship a blob whose uncompressed bytes differ from the declared
        // diffID.
        let tampered = gz(b"tampered layer bytes");
        write_bundle(&bundle, &metadata, &[(&l1.digest, &tampered)], &[]);

        let runtime = MockRuntime::new(HashMap::new());
        let err = BundleLoader::new(&runtime).load(&bundle).await.unwrap_err();

        assert!(matches!(err, Error::DiffIdMismatch { index: 0, .. }));
        assert!(runtime.loaded().is_empty());
    }

    #[tokio::test]
    async fn test_load_unsupported_version() {
        let tmp = TempDir::new().unwrap();
        let l1 = fixture_layer(b"layer");

        let mut metadata = v2_metadata("app:2.0", "", 0, &[&l1], &[&l1]);
        metadata.version = "3".to_string();
        let bundle = tmp.path().join("bundle.tar.gz");
        write_bundle(&bundle, &metadata, &[(&l1.digest, &l1.compressed)], &[]);

        let runtime = MockRuntime::new(HashMap::new());
        let err = BundleLoader::new(&runtime).load(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedBundleVersion(v) if v == "3"));
    }

    #[tokio::test]
    async fn test_load_tolerates_unknown_entries() {
        let tmp = TempDir::new().unwrap();
        let l1 = fixture_layer(b"layer");

        let metadata = v2_metadata("app:2.0", "", 0, &[&l1], &[&l1]);
        let bundle = tmp.path().join("bundle.tar.gz");
        write_bundle(
            &bundle,
            &metadata,
            &[(&l1.digest, &l1.compressed)],
            &[("NOTES.txt", b"future extension"), ("extras/thing", b"x")],
        );

        let runtime = MockRuntime::new(HashMap::new());
        BundleLoader::new(&runtime).load(&bundle).await.unwrap();
        assert_eq!(runtime.loaded().len(), 1);
    }

    #[tokio::test]
    async fn test_roundtrip_pack_then_load() {
        use crate::bundle::BundlePacker;
        use crate::cache::BlobCache;
        use crate::remote::MemoryBlobSource;

        let tmp = TempDir::new().unwrap();
        let l1 = fixture_layer(b"roundtrip layer one");
        let l2 = fixture_layer(b"roundtrip layer two");

        // Seed the cache the way a save would.
        let cache = BlobCache::open(&tmp.path().join("cache")).unwrap();
        for layer in [&l1, &l2] {
            let source = MemoryBlobSource::new(layer.compressed.clone());
            cache
                .put(&layer.digest, &layer.diffid, "app:2.0", &source)
                .await
                .unwrap();
        }

        let metadata = v2_metadata("app:2.0", "", 0, &[&l1, &l2], &[&l1, &l2]);
        let bundle = tmp.path().join("bundle.tar.gz");
        BundlePacker::new(&cache).pack(&bundle, &metadata).await.unwrap();

        let runtime = MockRuntime::new(HashMap::new());
        let loaded_ref = BundleLoader::new(&runtime).load(&bundle).await.unwrap();
        assert_eq!(loaded_ref, "app:2.0");

        let entries = read_archive(&runtime.loaded()[0]);

        // The reconstructed archive's manifest preserves layer order and
        // its config carries the source image's diffID chain.
        let manifest: Vec<DockerManifestEntry> = serde_json::from_slice(
            &entries.iter().find(|(n, _)| n == "manifest.json").unwrap().1,
        )
        .unwrap();
        assert_eq!(
            manifest[0].layers,
            vec![
                format!("{}/layer.tar", short_hash(&l1.diffid)),
                format!("{}/layer.tar", short_hash(&l2.diffid)),
            ]
        );

        let config_name = format!("{}.json", short_hash(&l1.diffid));
        let config: serde_json::Value = serde_json::from_slice(
            &entries.iter().find(|(n, _)| n == &config_name).unwrap().1,
        )
        .unwrap();
        assert_eq!(
            config.pointer("/rootfs/diff_ids").unwrap(),
            &serde_json::json!([l1.diffid, l2.diffid])
        );
    }

    #[tokio::test]
    async fn test_load_no_metadata_at_all() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle.tar.gz");

        let file = File::create(&bundle).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_bytes(&mut builder, "random.txt", b"nothing useful").unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let runtime = MockRuntime::new(HashMap::new());
        let err = BundleLoader::new(&runtime).load(&bundle).await.unwrap_err();
        assert!(matches!(err, Error::BundleFormat(_)));
    }
}
