//! CLI subcommand: `elementgate audit`

use anyhow::Result;
use clap::Args;

use elementgate::config::Config;
use elementgate::security::AuditLog;

#[derive(Args)]
pub struct AuditArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Only check chain integrity
    #[arg(long)]
    pub verify: bool,

    /// Filter by event type (e.g., ingest_rejected, document_saved)
    #[arg(long)]
    pub filter: Option<String>,
}

pub async fn run(args: AuditArgs, config: Config) -> Result<()> {
    let log = AuditLog::new(config.audit_log_path());

    // Verify chain integrity (on full log, not filtered)
    let broken = log.verify_chain()?;
    if args.verify {
        if broken.is_empty() {
            println!("Chain integrity: INTACT ({})", log.path().display());
            return Ok(());
        }
        anyhow::bail!(
            "Chain integrity: BROKEN at line(s) {}",
            broken
                .iter()
                .map(|i| (i + 1).to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let mut entries = log.read_entries()?;
    if let Some(ref filter) = args.filter {
        entries.retain(|e| {
            let event_type = serde_json::to_string(&e.event.event_type).unwrap_or_default();
            event_type.trim_matches('"') == filter
        });
    }

    if entries.is_empty() {
        if args.filter.is_some() {
            println!("No audit log entries matching filter.");
        } else {
            println!("No audit log entries.");
        }
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    match args.filter {
        Some(ref f) => println!(
            "Security Audit Log ({} entries, filter: {}):",
            entries.len(),
            f
        ),
        None => println!("Security Audit Log ({} entries):", entries.len()),
    }
    println!();

    for entry in &entries {
        let event = &entry.event;
        let rejection = event
            .rejection
            .as_ref()
            .map(|kind| format!(" [{}]", kind))
            .unwrap_or_default();
        println!(
            "  {} {:<8} {:?} (source: {:?}){} {}: {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.severity.to_string(),
            event.event_type,
            event.source,
            rejection,
            event.path.as_deref().unwrap_or("-"),
            event.detail,
        );
    }

    println!();
    if broken.is_empty() {
        println!("Chain integrity: INTACT");
    } else {
        println!("Chain integrity: BROKEN at {} position(s)", broken.len());
    }

    Ok(())
}
