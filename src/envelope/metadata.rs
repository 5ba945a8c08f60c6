//! Restricted metadata values and conversion from parsed YAML.
//!
//! The YAML tree is never deserialized into arbitrary types. It is parsed
//! into [`serde_yaml::Value`] and then folded into the closed
//! [`MetadataValue`] union: text, list of text, or a list of flat records.
//! Numbers and booleans become their textual form, null drops the key,
//! and any tagged node is refused.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{ErrorKind, IngestError, Result};
use crate::security::{IDENTIFIER_CHARS, validate_identifier};

/// Longest metadata key accepted.
pub const MAX_KEY_CHARS: usize = 64;

/// One flat record of a composite field (`variables`, `examples`, ...).
pub type Record = BTreeMap<String, String>;

/// Restricted metadata value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    List(Vec<String>),
    Records(Vec<Record>),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Human readable type name for error details.
    pub fn type_name(&self) -> &'static str {
        match self {
            MetadataValue::Text(_) => "string",
            MetadataValue::List(_) => "array of strings",
            MetadataValue::Records(_) => "array of records",
        }
    }

    /// Visit every string in the value, with a path like `tags[2]` or
    /// `variables[0].name`.
    pub fn for_each_string_mut<F>(&mut self, key: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &mut String) -> Result<()>,
    {
        match self {
            MetadataValue::Text(s) => f(key, s),
            MetadataValue::List(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    f(&format!("{}[{}]", key, i), item)?;
                }
                Ok(())
            }
            MetadataValue::Records(records) => {
                for (i, record) in records.iter_mut().enumerate() {
                    for (field, value) in record.iter_mut() {
                        f(&format!("{}[{}].{}", key, i, field), value)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

/// Ordered metadata mapping.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Fold a parsed YAML root into [`Metadata`].
pub fn metadata_from_yaml(root: Value, max_keys: usize) -> Result<Metadata> {
    let mapping = match root {
        Value::Mapping(mapping) => mapping,
        Value::Tagged(_) => return Err(malicious("tagged metadata root")),
        other => {
            return Err(IngestError::malformed(format!(
                "metadata root must be a mapping, found {}",
                yaml_type_name(&other)
            )));
        }
    };

    if mapping.len() > max_keys {
        return Err(IngestError::new(
            ErrorKind::TooLarge(crate::error::SizeScope::Metadata),
            format!("{} metadata keys exceeds the limit of {}", mapping.len(), max_keys),
        ));
    }

    let mut metadata = Metadata::new();
    for (key, value) in mapping {
        let key = metadata_key(key)?;
        match convert_value(&key, value)? {
            Some(converted) => {
                metadata.insert(key, converted);
            }
            None => debug!("Dropping null metadata field '{}'", key),
        }
    }
    Ok(metadata)
}

fn metadata_key(key: Value) -> Result<String> {
    let raw = match key {
        Value::Tagged(_) => return Err(malicious("tagged metadata key")),
        other => scalar_text(other).ok_or_else(|| {
            IngestError::malformed("metadata keys must be plain scalars")
        })?,
    };
    validate_identifier(&raw, IDENTIFIER_CHARS, MAX_KEY_CHARS)
        .map_err(|e| IngestError::invalid_field(&raw, format!("bad key: {}", e.detail())))
}

fn convert_value(key: &str, value: Value) -> Result<Option<MetadataValue>> {
    match value {
        Value::Null => Ok(None),
        Value::Tagged(_) => Err(malicious(&format!("tagged value in '{}'", key))),
        Value::Mapping(_) => Err(IngestError::invalid_field(
            key,
            "nested mappings are only allowed inside record arrays",
        )),
        Value::Sequence(items) => convert_sequence(key, items).map(Some),
        scalar => Ok(scalar_text(scalar).map(MetadataValue::Text)),
    }
}

fn convert_sequence(key: &str, items: Vec<Value>) -> Result<MetadataValue> {
    if items.iter().any(|v| matches!(v, Value::Tagged(_))) {
        return Err(malicious(&format!("tagged element in '{}'", key)));
    }

    if items.iter().all(|v| matches!(v, Value::Mapping(_))) && !items.is_empty() {
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            if let Value::Mapping(mapping) = item {
                records.push(convert_record(key, mapping)?);
            }
        }
        return Ok(MetadataValue::Records(records));
    }

    let mut list = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Sequence(_) | Value::Mapping(_) => {
                return Err(IngestError::invalid_field(
                    key,
                    "arrays must hold only strings or only records",
                ));
            }
            Value::Null => {
                return Err(IngestError::invalid_field(key, "null array element"));
            }
            scalar => {
                if let Some(text) = scalar_text(scalar) {
                    list.push(text);
                }
            }
        }
    }
    Ok(MetadataValue::List(list))
}

fn convert_record(key: &str, mapping: serde_yaml::Mapping) -> Result<Record> {
    let mut record = Record::new();
    for (field, value) in mapping {
        let field = metadata_key(field)?;
        match value {
            Value::Null => continue,
            Value::Tagged(_) => {
                return Err(malicious(&format!("tagged value in '{}.{}'", key, field)));
            }
            Value::Sequence(_) | Value::Mapping(_) => {
                return Err(IngestError::invalid_field(
                    key,
                    format!("record field '{}' must be a scalar", field),
                ));
            }
            scalar => {
                if let Some(text) = scalar_text(scalar) {
                    record.insert(field, text);
                }
            }
        }
    }
    Ok(record)
}

/// Textual form of a plain scalar; `None` for anything else.
fn scalar_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn yaml_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged node",
    }
}

fn malicious(detail: &str) -> IngestError {
    IngestError::new(ErrorKind::MaliciousStructure, detail)
}

/// Combine metadata sources.
///
/// Precedence, lowest first: values inferred from the path, values
/// preserved in the document, explicit overrides.
pub fn merge_metadata(inferred: &Metadata, preserved: Metadata, overrides: &Metadata) -> Metadata {
    let mut merged = inferred.clone();
    merged.extend(preserved);
    for (key, value) in overrides {
        if let Some(previous) = merged.insert(key.clone(), value.clone())
            && &previous != value
        {
            debug!("Metadata override replaced '{}'", key);
        }
    }
    merged
}
