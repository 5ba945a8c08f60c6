//! CLI subcommand: `elementgate scan`
//!
//! Runs the content catalog over a file without parsing or storing it.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use elementgate::envelope::{prescan_structure, split_envelope};
use elementgate::security::{Severity, scan};

#[derive(Args)]
pub struct ScanArgs {
    /// File to scan
    pub file: PathBuf,

    /// Print findings as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ScanArgs) -> Result<()> {
    let raw = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let text = String::from_utf8_lossy(&raw);

    let findings = scan(&text);
    let structure = split_envelope(&text)
        .ok()
        .and_then(|envelope| prescan_structure(envelope.metadata).err());

    if args.json {
        let value = serde_json::json!({
            "file": args.file.display().to_string(),
            "findings": findings,
            "structure": structure.as_ref().map(|e| e.detail()),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} ({} bytes)", args.file.display(), raw.len());
    if let Some(err) = &structure {
        println!("  metadata block: {}", err);
    }
    if findings.is_empty() {
        println!("  no content findings");
        return Ok(());
    }

    for finding in &findings {
        println!(
            "  {:>7}  {:<8} {:<28} {}",
            finding.location,
            finding.severity.to_string(),
            finding.pattern_id,
            finding.matched_excerpt
        );
    }

    let critical = findings
        .iter()
        .filter(|f| f.severity == Severity::Critical)
        .count();
    println!();
    println!(
        "{} finding(s), {} critical{}",
        findings.len(),
        critical,
        if critical > 0 { " (would be rejected)" } else { "" }
    );
    Ok(())
}
