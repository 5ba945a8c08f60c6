use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::PathBuf;

use elementgate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., limits.max_document_bytes)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., store.lock_timeout_ms)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, config_file: Option<&str>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(config_file, &format),
        ConfigCommands::Get { key } => get_config(config_file, &key),
        ConfigCommands::Set { key, value } => set_config(config_file, &key, &value),
        ConfigCommands::Path => show_path(config_file),
        ConfigCommands::Init { force } => init_config(config_file, force),
    }
}

fn show_config(config_file: Option<&str>, format: &str) -> Result<()> {
    let config = super::load_config(config_file)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(config_file: Option<&str>, key: &str) -> Result<()> {
    let config = super::load_config(config_file)?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(config_file: Option<&str>, key: &str, value: &str) -> Result<()> {
    let mut config = super::load_config(config_file)?;
    config.set_value(key, value)?;
    match config_file {
        Some(path) => {
            std::fs::write(resolve_path(Some(path))?, toml::to_string_pretty(&config)?)?;
        }
        None => config.save()?,
    }
    println!("Set {} = {}", key, value);
    Ok(())
}

fn show_path(config_file: Option<&str>) -> Result<()> {
    println!("{}", resolve_path(config_file)?.display());
    Ok(())
}

fn init_config(config_file: Option<&str>, force: bool) -> Result<()> {
    let path = resolve_path(config_file)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}

fn resolve_path(config_file: Option<&str>) -> Result<PathBuf> {
    match config_file {
        Some(path) => Ok(PathBuf::from(shellexpand::tilde(path).to_string())),
        None => Config::config_path(),
    }
}
