//! `imgcd diff` command — compare the layers of two images.

use clap::Args;
use imgcd_engine::diff::{DiffFormatter, Differ, FormatOptions, OutputFormat};
use imgcd_engine::remote::Fetcher;
use imgcd_engine::Platform;

#[derive(Args)]
pub struct DiffArgs {
    /// New image reference
    pub new_image: String,

    /// Base image reference
    pub base_image: String,

    /// Target platform
    #[arg(short = 't', long, default_value = "linux/amd64")]
    pub target_platform: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show per-layer details
    #[arg(short, long)]
    pub verbose: bool,
}

pub async fn execute(args: DiffArgs) -> Result<(), Box<dyn std::error::Error>> {
    let platform = Platform::parse_supported(&args.target_platform)?;

    let fetcher = Fetcher::new();
    let differ = Differ::new(&fetcher);
    let result = differ
        .compare(&args.new_image, &args.base_image, &platform)
        .await?;

    let formatter = DiffFormatter::new(FormatOptions {
        format: if args.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        },
        verbose: args.verbose,
    });

    let stdout = std::io::stdout();
    formatter.format(&mut stdout.lock(), &result)?;

    Ok(())
}
