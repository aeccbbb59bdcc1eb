//! `imgcd save` command — export an image to a portable bundle.
//!
//! Layers are downloaded directly from the registry through the local blob
//! cache; with `--since`, only layers missing from the base image are
//! packaged.

use std::sync::Arc;

use clap::Args;
use imgcd_engine::{ExportOptions, Exporter, Platform, ProgressCallback};

#[derive(Args)]
pub struct SaveArgs {
    /// Image reference to export (e.g., "alpine:3.20")
    pub image: String,

    /// Base image reference or bare tag for incremental export
    /// (e.g., "alpine:3.19" or just "3.19")
    #[arg(long)]
    pub since: Option<String>,

    /// Output directory for the bundle
    #[arg(short, long, default_value = "./out")]
    pub out_dir: String,

    /// Target platform
    #[arg(short = 't', long, default_value = "linux/amd64")]
    pub target_platform: String,

    /// Maximum concurrent blob downloads
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,
}

pub async fn execute(args: SaveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let platform = Platform::parse_supported(&args.target_platform)?;

    let cache = super::open_blob_cache()?;
    let exporter = Exporter::new(Arc::clone(&cache));

    println!("Exporting {} for {}", args.image, platform);
    if let Some(since) = &args.since {
        println!("Incremental against: {}", since);
    }

    let progress: ProgressCallback = Arc::new(|completed, total, digest| {
        let short = digest.get(..19).unwrap_or(digest);
        eprintln!("  [{}/{}] {}", completed, total, short);
    });

    let options = ExportOptions {
        platform,
        max_concurrency: args.concurrency,
        progress: Some(progress),
    };

    let out_path = match exporter
        .save(
            &args.image,
            args.since.as_deref(),
            std::path::Path::new(&args.out_dir),
            &options,
        )
        .await
    {
        Ok(path) => path,
        Err(err) => {
            if matches!(err, imgcd_core::Error::ManifestNotFound { .. }) {
                suggest_tags(&exporter, &args.image).await;
            }
            return Err(err.into());
        }
    };

    let size = std::fs::metadata(&out_path).map(|m| m.len()).unwrap_or(0);
    println!(
        "Created bundle: {} ({})",
        out_path.display(),
        crate::output::format_bytes(size)
    );
    println!("\nTo import on the target system:");
    println!("  imgcd load --from {}", out_path.display());

    Ok(())
}

/// Best-effort tag suggestions when the requested tag has no manifest.
async fn suggest_tags(exporter: &Exporter, image: &str) {
    use imgcd_engine::reference::parse_reference;
    use imgcd_engine::TagResolution;

    let (repo, tag) = parse_reference(image);
    match exporter.fetcher().resolve_tag(&repo, &tag).await {
        Ok(TagResolution::Fuzzy(candidate)) => {
            eprintln!("Did you mean {}:{}?", repo, candidate);
        }
        Ok(TagResolution::Ambiguous(candidates)) => {
            eprintln!("Tag '{}' not found. Similar tags:", tag);
            for candidate in candidates.iter().take(10) {
                eprintln!("  {}:{}", repo, candidate);
            }
        }
        _ => {}
    }
}
