//! Logical path namespace.
//!
//! Two layouts are accepted:
//!
//! - collection: `<root>/<element-type>/<category>/<name>.<ext>`
//! - portfolio:  `<element-type>/<name>.<ext>`
//!
//! Collection documents are stored in the portfolio layout, so every
//! located element also carries its portfolio target.

use std::path::Path;

use crate::config::{NamespaceConfig, singular};
use crate::envelope::{Metadata, MetadataValue};
use crate::error::{IngestError, Result};
use crate::security::{
    CanonicalPath, IDENTIFIER_CHARS, MAX_FILENAME_CHARS, validate_enum, validate_filename,
    validate_identifier, validate_relative_path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathShape {
    Collection,
    Portfolio,
}

/// A declared path that passed every namespace check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementLocation {
    pub shape: PathShape,
    /// Element-type directory, e.g. `personas`.
    pub element_type: String,
    /// Only present for collection paths.
    pub category: Option<String>,
    /// File stem.
    pub name: String,
    pub extension: String,
    /// The declared path, normalized.
    pub declared: CanonicalPath,
    /// Where the document lives in the portfolio layout.
    pub target: CanonicalPath,
}

impl ElementLocation {
    /// Metadata implied by the path: `type`, `name`, and `category` for
    /// collection paths.
    pub fn inferred_metadata(&self) -> Metadata {
        let mut inferred = Metadata::new();
        inferred.insert(
            "type".to_string(),
            MetadataValue::Text(singular(&self.element_type)),
        );
        inferred.insert("name".to_string(), MetadataValue::Text(self.name.clone()));
        if let Some(category) = &self.category {
            inferred.insert("category".to_string(), MetadataValue::Text(category.clone()));
        }
        inferred
    }
}

#[derive(Debug, Clone)]
pub struct Namespace {
    config: NamespaceConfig,
}

impl Namespace {
    pub fn new(config: NamespaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NamespaceConfig {
        &self.config
    }

    /// Validate `declared` against `base_dir` and the namespace shape.
    ///
    /// With `shape = None` the layout is detected: a path whose first
    /// component is the collection root is a collection path.
    pub fn locate(
        &self,
        declared: &str,
        base_dir: &Path,
        shape: Option<PathShape>,
    ) -> Result<ElementLocation> {
        let canonical = validate_relative_path(declared, base_dir)?;
        let components = canonical.components();

        let shape = shape.unwrap_or_else(|| {
            if components.len() == 4 && components[0] == self.config.collection_root {
                PathShape::Collection
            } else {
                PathShape::Portfolio
            }
        });

        let (element_type, category, file_name) = match (shape, components.as_slice()) {
            (PathShape::Collection, [root, element_type, category, file_name]) => {
                if *root != self.config.collection_root {
                    return Err(IngestError::path_traversal(format!(
                        "collection paths must start with '{}'",
                        self.config.collection_root
                    )));
                }
                let category = validate_enum(category, &self.config.categories)?;
                (*element_type, Some(category), *file_name)
            }
            (PathShape::Portfolio, [element_type, file_name]) => (*element_type, None, *file_name),
            (shape, parts) => {
                return Err(IngestError::path_traversal(format!(
                    "expected a {} path, got {} component(s)",
                    match shape {
                        PathShape::Collection => "<root>/<type>/<category>/<name>.<ext>",
                        PathShape::Portfolio => "<type>/<name>.<ext>",
                    },
                    parts.len()
                )));
            }
        };

        let element_type = validate_enum(element_type, &self.config.element_types)?;
        let file_name = validate_filename(file_name)?;
        let (name, extension) = self.split_file_name(&file_name)?;

        let storage = format!("{}/{}.{}", element_type, name, extension);
        let target = validate_relative_path(&storage, base_dir)?;
        let declared = match (shape, &category) {
            (PathShape::Collection, Some(category)) => validate_relative_path(
                &format!(
                    "{}/{}/{}/{}.{}",
                    self.config.collection_root, element_type, category, name, extension
                ),
                base_dir,
            )?,
            _ => target.clone(),
        };

        Ok(ElementLocation {
            shape,
            element_type,
            category,
            name,
            extension,
            declared,
            target,
        })
    }

    fn split_file_name(&self, file_name: &str) -> Result<(String, String)> {
        let (stem, extension) = file_name
            .rsplit_once('.')
            .ok_or_else(|| IngestError::invalid_name(format!("missing extension: {}", file_name)))?;

        let extension = extension.to_ascii_lowercase();
        if !self.config.extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension)) {
            return Err(IngestError::invalid_name(format!(
                "extension '{}' is not one of: {}",
                extension,
                self.config.extensions.join(", ")
            )));
        }

        let stem = validate_identifier(stem, IDENTIFIER_CHARS, MAX_FILENAME_CHARS)?;
        Ok((stem, extension))
    }
}
