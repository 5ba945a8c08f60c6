//! Field table for element metadata.
//!
//! Each known field has a [`FieldKind`] that bounds its shape and length.
//! Unknown fields pass through with a generic cap, or are refused when
//! strict key mode is on.

use once_cell::sync::Lazy;
use regex::Regex;

use super::metadata::{Metadata, MetadataValue};
use crate::config::{LimitsConfig, NamespaceConfig};
use crate::error::{IngestError, Result};
use crate::security::{IDENTIFIER_CHARS, validate_enum, validate_identifier};

/// `1`, `1.2`, `1.2.3`, with optional `-pre.release` and `+build`.
static VERSION_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\d{1,9}(?:\.\d{1,9}){0,2}(?:-[0-9A-Za-z.-]{1,40})?(?:\+[0-9A-Za-z.-]{1,40})?$").ok()
});

/// Shape and bounds of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Free text up to `max` bytes.
    Text(usize),
    /// Letters, digits, `-` and `_`, up to `max` bytes.
    Identifier(usize),
    /// One of a closed set.
    Choice(Vec<String>),
    /// Semver-like version string.
    Version,
    List { max_items: usize, max_bytes: usize },
    Records { max_items: usize, max_bytes: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// The table of known fields plus the caps applied to unknown ones.
#[derive(Debug, Clone)]
pub struct FieldTable {
    specs: Vec<FieldSpec>,
    passthrough_bytes: usize,
    passthrough_items: usize,
}

impl FieldTable {
    pub fn new(limits: &LimitsConfig, namespace: &NamespaceConfig) -> Self {
        let list = FieldKind::List {
            max_items: limits.max_tags,
            max_bytes: limits.max_tag_bytes,
        };
        let records = FieldKind::Records {
            max_items: limits.max_records,
            max_bytes: limits.max_description_bytes,
        };
        let specs = vec![
            FieldSpec {
                name: "name",
                kind: FieldKind::Text(limits.max_name_bytes),
                required: true,
            },
            FieldSpec::optional("description", FieldKind::Text(limits.max_description_bytes)),
            FieldSpec::optional("version", FieldKind::Version),
            FieldSpec::optional("author", FieldKind::Identifier(limits.max_name_bytes)),
            FieldSpec::optional("type", FieldKind::Choice(namespace.element_type_names())),
            FieldSpec::optional("category", FieldKind::Choice(namespace.categories.clone())),
            FieldSpec::optional("tags", list.clone()),
            FieldSpec::optional("keywords", list.clone()),
            FieldSpec::optional("triggers", list),
            FieldSpec::optional("license", FieldKind::Text(limits.max_name_bytes)),
            FieldSpec::optional("created", FieldKind::Text(40)),
            FieldSpec::optional("updated", FieldKind::Text(40)),
            FieldSpec::optional("variables", records.clone()),
            FieldSpec::optional("examples", records.clone()),
            FieldSpec::optional("parameters", records),
        ];
        Self {
            specs,
            passthrough_bytes: limits.max_field_bytes,
            passthrough_items: limits.max_records,
        }
    }

    pub fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn specs(&self) -> &[FieldSpec] {
        &self.specs
    }

    /// Check every field, canonicalizing enum spellings in place.
    pub fn validate(&self, mut metadata: Metadata, strict_keys: bool) -> Result<Metadata> {
        for spec in self.specs.iter().filter(|s| s.required) {
            match metadata.get(spec.name) {
                None => {
                    return Err(IngestError::invalid_field(spec.name, "required field missing"));
                }
                Some(MetadataValue::Text(s)) if s.trim().is_empty() => {
                    return Err(IngestError::invalid_field(spec.name, "required field is empty"));
                }
                Some(_) => {}
            }
        }

        for (key, value) in metadata.iter_mut() {
            match self.spec(key) {
                Some(spec) => check_known(key, &spec.kind, value)?,
                None if strict_keys => {
                    return Err(IngestError::invalid_field(key, "unknown field"));
                }
                None => self.check_passthrough(key, value)?,
            }
        }
        Ok(metadata)
    }

    fn check_passthrough(&self, key: &str, value: &MetadataValue) -> Result<()> {
        match value {
            MetadataValue::Text(s) => check_bytes(key, s, self.passthrough_bytes),
            MetadataValue::List(items) => {
                check_count(key, items.len(), self.passthrough_items)?;
                items
                    .iter()
                    .try_for_each(|s| check_bytes(key, s, self.passthrough_bytes))
            }
            MetadataValue::Records(_) => Err(IngestError::invalid_field(
                key,
                "records are only allowed for known composite fields",
            )),
        }
    }
}

fn check_known(key: &str, kind: &FieldKind, value: &mut MetadataValue) -> Result<()> {
    match (kind, &mut *value) {
        (FieldKind::Text(max), MetadataValue::Text(s)) => check_bytes(key, s, *max),
        (FieldKind::Identifier(max), MetadataValue::Text(s)) => {
            validate_identifier(s, IDENTIFIER_CHARS, *max)
                .map(|_| ())
                .map_err(|e| IngestError::invalid_field(key, e.detail()))
        }
        (FieldKind::Choice(allowed), MetadataValue::Text(s)) => {
            *s = validate_enum(s, allowed)?;
            Ok(())
        }
        (FieldKind::Version, MetadataValue::Text(s)) => {
            let valid = VERSION_RE.as_ref().is_some_and(|re| re.is_match(s));
            if valid {
                Ok(())
            } else {
                Err(IngestError::invalid_field(key, "not a version string"))
            }
        }
        (
            FieldKind::List {
                max_items,
                max_bytes,
            },
            MetadataValue::List(items),
        ) => {
            check_count(key, items.len(), *max_items)?;
            items.iter().try_for_each(|s| check_bytes(key, s, *max_bytes))
        }
        (FieldKind::Records { .. }, MetadataValue::List(items)) if items.is_empty() => {
            *value = MetadataValue::Records(Vec::new());
            Ok(())
        }
        (
            FieldKind::Records {
                max_items,
                max_bytes,
            },
            MetadataValue::Records(records),
        ) => {
            check_count(key, records.len(), *max_items)?;
            records
                .iter()
                .flat_map(|r| r.values())
                .try_for_each(|s| check_bytes(key, s, *max_bytes))
        }
        (_, other) => Err(IngestError::invalid_field(
            key,
            format!("unexpected {}", other.type_name()),
        )),
    }
}

/// Caps are UTF-8 bytes, so multi-byte text gets fewer characters.
fn check_bytes(key: &str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(IngestError::invalid_field(
            key,
            format!("{} bytes exceeds the limit of {}", value.len(), max),
        ));
    }
    Ok(())
}

fn check_count(key: &str, count: usize, max: usize) -> Result<()> {
    if count > max {
        return Err(IngestError::invalid_field(
            key,
            format!("{} entries exceeds the limit of {}", count, max),
        ));
    }
    Ok(())
}
