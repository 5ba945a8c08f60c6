pub mod audit;
pub mod config;
pub mod element;
pub mod ingest;
pub mod paths;
pub mod scan;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use elementgate::config::Config;
use elementgate::security::{AuditLog, AuditSink, FanoutSink, TracingSink};

#[derive(Parser)]
#[command(name = "elementgate")]
#[command(author, version, about = "Validate, sanitize and store untrusted element documents")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "ELEMENTGATE_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate documents and store them in the portfolio
    Ingest(ingest::IngestArgs),

    /// Validate a document without storing it
    Check(ingest::CheckArgs),

    /// Print threat findings for a file
    Scan(scan::ScanArgs),

    /// Read a stored document and re-validate it
    Load(element::LoadArgs),

    /// Delete a stored document
    Delete(element::DeleteArgs),

    /// Show the security audit log
    Audit(audit::AuditArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved directory paths
    Paths,
}

/// Load `--config` if given, otherwise the default location.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let expanded = shellexpand::tilde(path);
            Config::load_file(Path::new(expanded.as_ref()))
        }
        None => Config::load(),
    }
}

/// Tracing always; the JSONL audit log when enabled.
pub fn build_sink(config: &Config) -> Arc<dyn AuditSink> {
    let mut sinks: Vec<Box<dyn AuditSink>> = vec![Box::new(TracingSink)];
    if config.audit.enabled {
        sinks.push(Box::new(AuditLog::new(config.audit_log_path())));
    }
    Arc::new(FanoutSink::new(sinks))
}

/// `--base`, or the configured portfolio.
pub fn base_dir(config: &Config, base: Option<PathBuf>) -> PathBuf {
    base.map(|b| PathBuf::from(shellexpand::tilde(&b.to_string_lossy()).to_string()))
        .unwrap_or_else(|| config.portfolio_path())
}
