//! Incremental container image export/import engine.
//!
//! The pipeline fetches image manifests and configs from an OCI registry,
//! computes the layer delta between two images by uncompressed digest
//! (diffID), downloads only the missing compressed blobs through a
//! verifying content-addressed cache, and packs metadata plus raw blobs
//! into a portable bundle. On the importing side the bundle is unpacked,
//! verified, and reconstructed into a Docker image archive, optionally
//! splicing shared layers back in from a local base image.
//!
//! # Architecture
//!
//! ```text
//! save:  ref + since + platform
//!          └─ remote::Fetcher ──► diff::Differ ──► remote::BlobDownloader
//!                                                    │ (cache::BlobCache)
//!                                                    ▼
//!                                 bundle::BundlePacker ──► bundle file
//!
//! load:  bundle file ──► bundle::BundleLoader ──► runtime collaborator
//! ```

pub mod bundle;
pub mod cache;
pub mod diff;
pub mod export;
pub mod import;
pub mod platform;
pub mod reference;
pub mod remote;
pub mod runtime;

pub use bundle::{BundleLoader, BundleMetadata, BundlePacker, LayerInfo};
pub use cache::{BlobCache, BlobEntry};
pub use diff::{DiffResult, Differ, LayerStatus};
pub use export::{ExportOptions, Exporter};
pub use import::Importer;
pub use platform::Platform;
pub use remote::{
    BlobDownloader, DownloadResult, Fetcher, ImageMetadata, LayerHandle, ProgressCallback,
    TagResolution,
};
pub use runtime::{detect_runtime, ContainerRuntime};
