//! `imgcd cache` commands — inspect and maintain the local blob cache.

use clap::{Args, Subcommand};

use crate::output;

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List all cached blobs
    List,
    /// Show cache statistics
    Info,
    /// Remove all cached blobs
    Clean(CleanArgs),
    /// Remove blobs not accessed recently
    Prune(PruneArgs),
}

#[derive(Args)]
pub struct CleanArgs {
    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct PruneArgs {
    /// Remove blobs not accessed in this many days
    #[arg(long, default_value_t = 30)]
    pub days: i64,
}

pub async fn execute(command: CacheCommand) -> Result<(), Box<dyn std::error::Error>> {
    let cache = super::open_blob_cache()?;

    match command {
        CacheCommand::List => {
            let mut entries = cache.list().await;
            if entries.is_empty() {
                println!("Cache is empty");
                return Ok(());
            }

            // Most recently used first.
            entries.sort_by(|a, b| b.last_access.cmp(&a.last_access));

            let mut table = output::new_table(&["BLOB", "SIZE", "IMAGES", "LAST ACCESS"]);
            for entry in &entries {
                let short = entry.digest.get(..19).unwrap_or(&entry.digest);
                table.add_row(vec![
                    short.to_string(),
                    output::format_bytes(entry.size),
                    entry.image_refs.join(", "),
                    output::format_ago(&entry.last_access),
                ]);
            }
            println!("{table}");
        }

        CacheCommand::Info => {
            let (total_bytes, count) = cache.stats().await;
            println!("Cache location: {}", imgcd_engine::BlobCache::default_root()?.display());
            println!("Blobs:          {}", count);
            println!("Total size:     {}", output::format_bytes(total_bytes));
        }

        CacheCommand::Clean(args) => {
            if !args.force {
                let (total_bytes, count) = cache.stats().await;
                println!(
                    "This will remove {} cached blobs ({}).",
                    count,
                    output::format_bytes(total_bytes)
                );
                print!("Continue? [y/N] ");
                use std::io::Write;
                std::io::stdout().flush()?;

                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                if !matches!(answer.trim(), "y" | "Y" | "yes") {
                    println!("Aborted");
                    return Ok(());
                }
            }

            cache.clean().await?;
            println!("Cache cleaned");
        }

        CacheCommand::Prune(args) => {
            let (removed, freed) = cache.prune(chrono::Duration::days(args.days)).await?;
            println!(
                "Removed {} blobs, freed {}",
                removed,
                output::format_bytes(freed)
            );
        }
    }

    Ok(())
}
