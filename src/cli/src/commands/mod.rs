//! CLI command definitions and dispatch.

mod cache;
mod diff;
mod load;
mod save;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use imgcd_engine::BlobCache;

/// imgcd — incremental container image export/import.
#[derive(Parser)]
#[command(name = "imgcd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Export a container image to a portable bundle
    Save(save::SaveArgs),
    /// Import a container image from a bundle
    Load(load::LoadArgs),
    /// Compare the layers of two images
    Diff(diff::DiffArgs),
    /// Manage the local blob cache
    #[command(subcommand)]
    Cache(cache::CacheCommand),
}

/// Open the shared blob cache at `~/.imgcd/cache`.
pub(crate) fn open_blob_cache() -> Result<Arc<BlobCache>, Box<dyn std::error::Error>> {
    let root = BlobCache::default_root()?;
    Ok(Arc::new(BlobCache::open(&root)?))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Save(args) => save::execute(args).await,
        Command::Load(args) => load::execute(args).await,
        Command::Diff(args) => diff::execute(args).await,
        Command::Cache(command) => cache::execute(command).await,
    }
}
