//! CLI subcommands: `elementgate ingest` and `elementgate check`

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use elementgate::config::Config;
use elementgate::envelope::{Metadata, metadata_from_yaml};
use elementgate::ingest::{IngestOptions, Ingestor, PathShape, ValidationOutcome};

#[derive(Args)]
pub struct IngestArgs {
    /// Documents to ingest
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Declared path for a single document (e.g., personas/writer.md)
    #[arg(long = "as", value_name = "DECLARED")]
    pub declared: Option<String>,

    /// Declare each file by its path relative to this directory
    #[arg(long, conflicts_with = "declared")]
    pub root: Option<PathBuf>,

    /// Portfolio directory (default: from config)
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Force a path layout instead of detecting it
    #[arg(long, value_enum)]
    pub shape: Option<ShapeArg>,

    /// Validate without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Reject metadata keys outside the field table
    #[arg(long)]
    pub strict: bool,

    /// Metadata override, YAML value (e.g., --set version=1.2.0)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Print outcomes as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Document to validate
    pub file: PathBuf,

    /// Declared path (default: <parent dir>/<file name>)
    #[arg(long = "as", value_name = "DECLARED")]
    pub declared: Option<String>,

    /// Portfolio directory (default: from config)
    #[arg(long)]
    pub base: Option<PathBuf>,

    /// Reject metadata keys outside the field table
    #[arg(long)]
    pub strict: bool,

    /// Print the outcome as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ShapeArg {
    Collection,
    Portfolio,
}

impl From<ShapeArg> for PathShape {
    fn from(shape: ShapeArg) -> Self {
        match shape {
            ShapeArg::Collection => PathShape::Collection,
            ShapeArg::Portfolio => PathShape::Portfolio,
        }
    }
}

pub async fn run(args: IngestArgs, config: Config) -> Result<()> {
    if args.declared.is_some() && args.files.len() > 1 {
        anyhow::bail!("--as takes a single file; use --root for several");
    }

    let base = super::base_dir(&config, args.base);
    let overrides = parse_overrides(&args.overrides, config.limits.max_metadata_keys)?;
    let ingestor = Arc::new(Ingestor::new(&config, super::build_sink(&config)));

    let mut rejected = 0;
    for file in &args.files {
        let declared = declared_path(file, args.declared.as_deref(), args.root.as_deref())?;
        let raw = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;

        let options = IngestOptions {
            strict_keys: args.strict || config.ingest.strict_keys,
            persist: !args.dry_run,
            overrides: overrides.clone(),
            source: Some(file.display().to_string()),
            shape: args.shape.map(PathShape::from),
        };
        let outcome = Arc::clone(&ingestor)
            .ingest_async(raw, declared.clone(), base.clone(), options)
            .await;
        if !outcome.is_accepted() {
            rejected += 1;
        }
        print_outcome(&declared, &outcome, args.json)?;
    }

    if rejected > 0 {
        anyhow::bail!("{} of {} document(s) rejected", rejected, args.files.len());
    }
    Ok(())
}

pub async fn check(args: CheckArgs, config: Config) -> Result<()> {
    let base = super::base_dir(&config, args.base);
    let declared = declared_path(&args.file, args.declared.as_deref(), None)?;
    let raw = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", args.file.display()))?;

    let ingestor = Ingestor::new(&config, super::build_sink(&config));
    let options = IngestOptions {
        strict_keys: args.strict || config.ingest.strict_keys,
        persist: false,
        source: Some(args.file.display().to_string()),
        ..IngestOptions::default()
    };
    let outcome = ingestor.ingest(&raw, &declared, &base, &options);
    print_outcome(&declared, &outcome, args.json)?;

    match outcome.error() {
        Some(err) => anyhow::bail!("{} rejected: {}", declared, err.kind()),
        None => Ok(()),
    }
}

/// `--as`, then the path under `--root`, then `<parent dir>/<file name>`.
fn declared_path(file: &Path, declared: Option<&str>, root: Option<&Path>) -> Result<String> {
    if let Some(declared) = declared {
        return Ok(declared.to_string());
    }

    let relative: Vec<String> = match root {
        Some(root) => file
            .strip_prefix(root)
            .with_context(|| format!("{} is not under {}", file.display(), root.display()))?
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect(),
        None => file
            .components()
            .rev()
            .take(2)
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect(),
    };

    anyhow::ensure!(
        !relative.is_empty(),
        "Cannot derive a declared path from {}",
        file.display()
    );
    Ok(relative.join("/"))
}

/// Each `KEY=VALUE` is read as one YAML mapping entry, so lists work too
/// (`--set 'tags=[a, b]'`).
fn parse_overrides(pairs: &[String], max_keys: usize) -> Result<Metadata> {
    let mut mapping = serde_yaml::Mapping::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Override must be KEY=VALUE: {}", pair))?;
        let value: serde_yaml::Value = serde_yaml::from_str(value)
            .with_context(|| format!("Override value for '{}' is not valid YAML", key))?;
        mapping.insert(serde_yaml::Value::String(key.trim().to_string()), value);
    }
    metadata_from_yaml(serde_yaml::Value::Mapping(mapping), max_keys)
        .map_err(|e| anyhow::anyhow!("Invalid override: {}", e))
}

fn print_outcome(declared: &str, outcome: &ValidationOutcome, json_output: bool) -> Result<()> {
    if json_output {
        let value = match outcome {
            ValidationOutcome::Accepted(doc) => json!({
                "declared": declared,
                "accepted": true,
                "document": doc,
            }),
            ValidationOutcome::Rejected(err) => json!({
                "declared": declared,
                "accepted": false,
                "error": { "kind": err.kind(), "detail": err.detail() },
            }),
        };
        println!("{}", serde_json::to_string(&value)?);
        return Ok(());
    }

    match outcome {
        ValidationOutcome::Accepted(doc) => {
            let verb = if doc.persisted { "saved" } else { "valid" };
            println!("{:<9}{} -> {}", verb, declared, doc.path.display());
            for finding in &doc.sanitized {
                println!(
                    "  stripped {} ({}) in {}: {}",
                    finding.pattern_id,
                    finding.severity,
                    finding.field.as_deref().unwrap_or("body"),
                    finding.matched_excerpt
                );
            }
            for finding in &doc.recorded {
                println!(
                    "  noted    {} ({}) in {}",
                    finding.pattern_id,
                    finding.severity,
                    finding.field.as_deref().unwrap_or("body")
                );
            }
        }
        ValidationOutcome::Rejected(err) => {
            println!("{:<9}{}: {}", "rejected", declared, err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use elementgate::envelope::MetadataValue;

    #[test]
    fn declared_path_precedence() {
        let file = Path::new("/tmp/in/personas/writer.md");
        assert_eq!(
            declared_path(file, Some("skills/x.md"), None).unwrap(),
            "skills/x.md"
        );
        assert_eq!(
            declared_path(file, None, Some(Path::new("/tmp/in"))).unwrap(),
            "personas/writer.md"
        );
        assert_eq!(declared_path(file, None, None).unwrap(), "personas/writer.md");
        assert!(declared_path(file, None, Some(Path::new("/elsewhere"))).is_err());
    }

    #[test]
    fn overrides_are_yaml_values() {
        let overrides = parse_overrides(
            &["version=1.2.0".to_string(), "tags=[a, b]".to_string()],
            10,
        )
        .unwrap();
        assert_eq!(overrides["version"].as_text(), Some("1.2.0"));
        assert_eq!(
            overrides["tags"],
            MetadataValue::List(vec!["a".to_string(), "b".to_string()])
        );
        assert!(parse_overrides(&["novalue".to_string()], 10).is_err());
        assert!(parse_overrides(&["x=!!python/object foo".to_string()], 10).is_err());
    }
}
