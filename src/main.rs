use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use elementgate::config::{Config, LoggingConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // config and paths must work without a loadable config file
    match cli.command {
        Commands::Config(args) => {
            init_logging(cli.verbose, &LoggingConfig::default());
            cli::config::run(args, cli.config.as_deref()).await
        }
        Commands::Paths => {
            init_logging(cli.verbose, &LoggingConfig::default());
            cli::paths::run()
        }
        command => {
            let config = cli::load_config(cli.config.as_deref())?;
            init_logging(cli.verbose, &config.logging);
            run_with_config(command, config).await
        }
    }
}

async fn run_with_config(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Ingest(args) => cli::ingest::run(args, config).await,
        Commands::Check(args) => cli::ingest::check(args, config).await,
        Commands::Scan(args) => cli::scan::run(args).await,
        Commands::Load(args) => cli::element::load(args, config).await,
        Commands::Delete(args) => cli::element::delete(args, config).await,
        Commands::Audit(args) => cli::audit::run(args, config).await,
        // handled before the config is loaded
        Commands::Config(_) | Commands::Paths => Ok(()),
    }
}

/// `RUST_LOG` wins, then `--verbose`, then `logging.level`.
fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let log_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
