//! `imgcd load` command — import a bundle into the local runtime.

use clap::Args;
use imgcd_engine::Importer;

#[derive(Args)]
pub struct LoadArgs {
    /// Path to the bundle file to import
    #[arg(long)]
    pub from: String,
}

pub async fn execute(args: LoadArgs) -> Result<(), Box<dyn std::error::Error>> {
    let importer = Importer::detect().await?;
    println!("Using runtime: {}", importer.runtime_name());

    let result = importer.load(std::path::Path::new(&args.from)).await;
    importer.close().await?;

    let image_ref = result?;
    println!("Successfully imported image: {}", image_ref);

    Ok(())
}
