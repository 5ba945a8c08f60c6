//! CLI subcommands: `elementgate load` and `elementgate delete`

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use elementgate::config::Config;
use elementgate::ingest::{Ingestor, ValidationOutcome};

#[derive(Args)]
pub struct LoadArgs {
    /// Declared path (e.g., personas/writer.md)
    pub declared: String,

    /// Portfolio directory (default: from config)
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Print the parsed envelope as JSON instead of the rendered document
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Declared path (e.g., personas/writer.md)
    pub declared: String,

    /// Portfolio directory (default: from config)
    #[arg(long)]
    pub base: Option<PathBuf>,
}

pub async fn load(args: LoadArgs, config: Config) -> Result<()> {
    let base = super::base_dir(&config, args.base);
    let ingestor = Ingestor::new(&config, super::build_sink(&config));

    match ingestor.load(&args.declared, &base) {
        ValidationOutcome::Accepted(doc) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print!("{}", doc.envelope.render()?);
            }
            Ok(())
        }
        ValidationOutcome::Rejected(err) => {
            anyhow::bail!("{} failed validation: {}", args.declared, err)
        }
    }
}

pub async fn delete(args: DeleteArgs, config: Config) -> Result<()> {
    let base = super::base_dir(&config, args.base);
    let ingestor = Ingestor::new(&config, super::build_sink(&config));

    if ingestor.delete(&args.declared, &base)? {
        println!("Deleted {}", args.declared);
    } else {
        println!("{} does not exist", args.declared);
    }
    Ok(())
}
