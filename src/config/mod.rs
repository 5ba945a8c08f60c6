use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub namespace: NamespaceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Size ceilings. Byte limits bound raw input; char limits bound
/// individual metadata values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Whole document, in bytes (default: 1 MiB)
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,

    /// Metadata block between the delimiters, in bytes (default: 64 KiB)
    #[serde(default = "default_max_metadata_bytes")]
    pub max_metadata_bytes: usize,

    #[serde(default = "default_max_name_bytes")]
    pub max_name_bytes: usize,

    #[serde(default = "default_max_description_bytes")]
    pub max_description_bytes: usize,

    #[serde(default = "default_max_tag_bytes")]
    pub max_tag_bytes: usize,

    /// Entries in tags/keywords/triggers
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Entries in variables/examples/parameters
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Cap for fields outside the known field table
    #[serde(default = "default_max_field_bytes")]
    pub max_field_bytes: usize,

    #[serde(default = "default_max_metadata_keys")]
    pub max_metadata_keys: usize,
}

/// Shape of accepted logical paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// First component of collection paths
    #[serde(default = "default_collection_root")]
    pub collection_root: String,

    /// Element-type directories (plural), e.g. "personas"
    #[serde(default = "default_element_types")]
    pub element_types: Vec<String>,

    #[serde(default = "default_categories")]
    pub categories: Vec<String>,

    /// File extensions without the dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl NamespaceConfig {
    /// Values accepted in the `type` metadata field: the singular form of
    /// each element-type directory.
    pub fn element_type_names(&self) -> Vec<String> {
        self.element_types.iter().map(|t| singular(t)).collect()
    }
}

/// `personas` -> `persona`, `memories` -> `memory`.
pub fn singular(plural: &str) -> String {
    if let Some(stem) = plural.strip_suffix("ies") {
        format!("{}y", stem)
    } else if let Some(stem) = plural.strip_suffix('s') {
        stem.to_string()
    } else {
        plural.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bounded wait for a per-path lock before reporting Busy
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Also take an advisory file lock so separate processes serialize
    #[serde(default = "default_true")]
    pub cross_process_locks: bool,
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Reject metadata keys outside the field table (default: false)
    #[serde(default)]
    pub strict_keys: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSONL audit file. Default: state_dir/elementgate.audit.jsonl
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_max_document_bytes() -> usize {
    1024 * 1024
}
fn default_max_metadata_bytes() -> usize {
    64 * 1024
}
fn default_max_name_bytes() -> usize {
    100
}
fn default_max_description_bytes() -> usize {
    500
}
fn default_max_tag_bytes() -> usize {
    50
}
fn default_max_tags() -> usize {
    20
}
fn default_max_records() -> usize {
    50
}
fn default_max_field_bytes() -> usize {
    1000
}
fn default_max_metadata_keys() -> usize {
    64
}
fn default_collection_root() -> String {
    "library".to_string()
}
fn default_element_types() -> Vec<String> {
    ["personas", "skills", "templates", "agents", "memories", "ensembles"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_categories() -> Vec<String> {
    ["creative", "educational", "gaming", "personal", "professional"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_extensions() -> Vec<String> {
    vec!["md".to_string()]
}
fn default_lock_timeout_ms() -> u64 {
    5000
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: default_max_document_bytes(),
            max_metadata_bytes: default_max_metadata_bytes(),
            max_name_bytes: default_max_name_bytes(),
            max_description_bytes: default_max_description_bytes(),
            max_tag_bytes: default_max_tag_bytes(),
            max_tags: default_max_tags(),
            max_records: default_max_records(),
            max_field_bytes: default_max_field_bytes(),
            max_metadata_keys: default_max_metadata_keys(),
        }
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            collection_root: default_collection_root(),
            element_types: default_element_types(),
            categories: default_categories(),
            extensions: default_extensions(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            cross_process_locks: default_true(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Paths::resolve()?)
    }

    /// Load `config.toml` from `paths`, creating it from the template on
    /// first run.
    pub fn load_from(paths: Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        Self::read(&path, paths)
    }

    /// Load an explicit config file (the `--config` flag).
    pub fn load_file(path: &Path) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        Self::read(path, paths)
    }

    fn read(path: &Path, paths: Paths) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.paths = paths;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        anyhow::ensure!(
            limits.max_document_bytes > 0 && limits.max_metadata_bytes > 0,
            "limits.max_document_bytes and limits.max_metadata_bytes must be positive"
        );
        anyhow::ensure!(
            limits.max_metadata_bytes <= limits.max_document_bytes,
            "limits.max_metadata_bytes ({}) exceeds limits.max_document_bytes ({})",
            limits.max_metadata_bytes,
            limits.max_document_bytes
        );

        let ns = &self.namespace;
        anyhow::ensure!(
            !ns.element_types.is_empty() && !ns.categories.is_empty() && !ns.extensions.is_empty(),
            "namespace.element_types, namespace.categories and namespace.extensions must not be empty"
        );
        for entry in std::iter::once(&ns.collection_root)
            .chain(&ns.element_types)
            .chain(&ns.categories)
            .chain(&ns.extensions)
        {
            crate::security::validate_identifier(entry, crate::security::IDENTIFIER_CHARS, 64)
                .map_err(|e| anyhow::anyhow!("Invalid namespace entry '{}': {}", entry, e))?;
        }

        anyhow::ensure!(
            matches!(self.logging.format.as_str(), "pretty" | "json"),
            "logging.format must be \"pretty\" or \"json\", got \"{}\"",
            self.logging.format
        );
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    /// Default ingestion base directory.
    pub fn portfolio_path(&self) -> PathBuf {
        self.paths.portfolio.clone()
    }

    /// Resolved audit log path (`audit.file` with `~` expanded, or the
    /// state dir default).
    pub fn audit_log_path(&self) -> PathBuf {
        match self.audit.file.as_deref().map(str::trim) {
            Some(file) if !file.is_empty() => PathBuf::from(shellexpand::tilde(file).to_string()),
            _ => self.paths.audit_log(),
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["limits", "max_document_bytes"] => Ok(self.limits.max_document_bytes.to_string()),
            ["limits", "max_metadata_bytes"] => Ok(self.limits.max_metadata_bytes.to_string()),
            ["limits", "max_name_bytes"] => Ok(self.limits.max_name_bytes.to_string()),
            ["limits", "max_description_bytes"] => {
                Ok(self.limits.max_description_bytes.to_string())
            }
            ["limits", "max_tag_bytes"] => Ok(self.limits.max_tag_bytes.to_string()),
            ["limits", "max_tags"] => Ok(self.limits.max_tags.to_string()),
            ["limits", "max_records"] => Ok(self.limits.max_records.to_string()),
            ["limits", "max_field_bytes"] => Ok(self.limits.max_field_bytes.to_string()),
            ["limits", "max_metadata_keys"] => Ok(self.limits.max_metadata_keys.to_string()),
            ["namespace", "collection_root"] => Ok(self.namespace.collection_root.clone()),
            ["namespace", "element_types"] => Ok(self.namespace.element_types.join(",")),
            ["namespace", "categories"] => Ok(self.namespace.categories.join(",")),
            ["namespace", "extensions"] => Ok(self.namespace.extensions.join(",")),
            ["store", "lock_timeout_ms"] => Ok(self.store.lock_timeout_ms.to_string()),
            ["store", "cross_process_locks"] => Ok(self.store.cross_process_locks.to_string()),
            ["ingest", "strict_keys"] => Ok(self.ingest.strict_keys.to_string()),
            ["audit", "enabled"] => Ok(self.audit.enabled.to_string()),
            ["audit", "file"] => Ok(self.audit_log_path().display().to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["limits", "max_document_bytes"] => self.limits.max_document_bytes = value.parse()?,
            ["limits", "max_metadata_bytes"] => self.limits.max_metadata_bytes = value.parse()?,
            ["limits", "max_name_bytes"] => self.limits.max_name_bytes = value.parse()?,
            ["limits", "max_description_bytes"] => {
                self.limits.max_description_bytes = value.parse()?
            }
            ["limits", "max_tag_bytes"] => self.limits.max_tag_bytes = value.parse()?,
            ["limits", "max_tags"] => self.limits.max_tags = value.parse()?,
            ["limits", "max_records"] => self.limits.max_records = value.parse()?,
            ["limits", "max_field_bytes"] => self.limits.max_field_bytes = value.parse()?,
            ["limits", "max_metadata_keys"] => self.limits.max_metadata_keys = value.parse()?,
            ["namespace", "collection_root"] => {
                self.namespace.collection_root = value.trim().to_string()
            }
            ["namespace", "element_types"] => self.namespace.element_types = split_list(value),
            ["namespace", "categories"] => self.namespace.categories = split_list(value),
            ["namespace", "extensions"] => self.namespace.extensions = split_list(value),
            ["store", "lock_timeout_ms"] => self.store.lock_timeout_ms = value.parse()?,
            ["store", "cross_process_locks"] => self.store.cross_process_locks = value.parse()?,
            ["ingest", "strict_keys"] => self.ingest.strict_keys = value.parse()?,
            ["audit", "enabled"] => self.audit.enabled = value.parse()?,
            ["audit", "file"] => self.audit.file = Some(value.to_string()),
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => self.logging.format = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        self.validate()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# ElementGate Configuration
# Auto-created on first run. Edit as needed.

[limits]
max_document_bytes = 1048576      # whole document (1 MiB)
max_metadata_bytes = 65536        # metadata block between the --- lines
max_name_bytes = 100
max_description_bytes = 500
max_tag_bytes = 50
max_tags = 20                     # tags, keywords, triggers
max_records = 50                  # variables, examples, parameters
max_field_bytes = 1000            # unknown pass-through fields
max_metadata_keys = 64

[namespace]
# Collection paths:  <collection_root>/<element_type>/<category>/<name>.<ext>
# Portfolio paths:   <element_type>/<name>.<ext>
collection_root = "library"
element_types = ["personas", "skills", "templates", "agents", "memories", "ensembles"]
categories = ["creative", "educational", "gaming", "personal", "professional"]
extensions = ["md"]

[store]
lock_timeout_ms = 5000
cross_process_locks = true

[ingest]
# Reject metadata keys that are not in the field table
strict_keys = false

[audit]
enabled = true
# file = "~/.local/state/elementgate/elementgate.audit.jsonl"

[logging]
level = "info"
format = "pretty"                 # pretty | json
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_matches_defaults() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();
        assert_eq!(parsed.limits, defaults.limits);
        assert_eq!(parsed.namespace, defaults.namespace);
        assert_eq!(parsed.store, defaults.store);
        assert_eq!(parsed.ingest, defaults.ingest);
        assert_eq!(parsed.audit, defaults.audit);
        assert_eq!(parsed.logging, defaults.logging);
        parsed.validate().unwrap();
    }

    #[test]
    fn missing_sections_use_defaults() {
        let parsed: Config = toml::from_str("[limits]\nmax_tags = 5\n").unwrap();
        assert_eq!(parsed.limits.max_tags, 5);
        assert_eq!(parsed.limits.max_document_bytes, 1024 * 1024);
        assert_eq!(parsed.store.lock_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn singular_forms() {
        assert_eq!(singular("personas"), "persona");
        assert_eq!(singular("memories"), "memory");
        assert_eq!(singular("ensembles"), "ensemble");
        assert_eq!(singular("data"), "data");
        assert!(
            NamespaceConfig::default()
                .element_type_names()
                .contains(&"skill".to_string())
        );
    }

    #[test]
    fn get_and_set_values() {
        let mut config = Config::default();
        config.set_value("limits.max_tags", "7").unwrap();
        assert_eq!(config.get_value("limits.max_tags").unwrap(), "7");

        config.set_value("namespace.categories", "a, b ,c").unwrap();
        assert_eq!(config.get_value("namespace.categories").unwrap(), "a,b,c");

        assert!(config.set_value("limits.max_tags", "many").is_err());
        assert!(config.get_value("nope.key").is_err());
    }

    #[test]
    fn validation_rejects_bad_settings() {
        let mut config = Config::default();
        assert!(config.set_value("limits.max_metadata_bytes", "99999999").is_err());

        let mut config = Config::default();
        assert!(config.set_value("logging.format", "xml").is_err());

        let mut config = Config::default();
        assert!(config.set_value("namespace.categories", "ok,../etc").is_err());
    }

    #[test]
    fn load_from_creates_template() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths {
            config_dir: tmp.path().join("config"),
            data_dir: tmp.path().join("data"),
            portfolio: tmp.path().join("data/portfolio"),
            state_dir: tmp.path().join("state"),
            runtime_dir: None,
        };

        let first = Config::load_from(paths.clone()).unwrap();
        assert!(paths.config_file().exists());
        assert_eq!(first.limits, LimitsConfig::default());

        fs::write(paths.config_file(), "[ingest]\nstrict_keys = true\n").unwrap();
        let second = Config::load_from(paths.clone()).unwrap();
        assert!(second.ingest.strict_keys);
        assert_eq!(second.audit_log_path(), paths.audit_log());
    }
}
