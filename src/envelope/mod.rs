//! Restricted structured parser.
//!
//! Turns raw bytes into a [`ParsedEnvelope`] in a fixed order, each step
//! cheaper than the next:
//!
//! 1. UTF-8 check
//! 2. envelope split ([`frontmatter`])
//! 3. metadata size gate
//! 4. structure prescan against `STRUCTURE_PATTERNS`, before any YAML parsing
//! 5. YAML to [`serde_yaml::Value`], folded into [`MetadataValue`]s
//! 6. merge with inferred values and overrides, then the field table
//! 7. the rendered metadata, as stored, through steps 3, 4 and 5 again
//!
//! The parser does no content scanning and no I/O.

pub mod fields;
pub mod frontmatter;
pub mod metadata;

pub use fields::{FieldKind, FieldSpec, FieldTable};
pub use frontmatter::{ParseState, RawEnvelope, split_envelope};
pub use metadata::{
    MAX_KEY_CHARS, Metadata, MetadataValue, Record, merge_metadata, metadata_from_yaml,
};

use serde::Serialize;
use serde_yaml::Value;
use tracing::debug;

use crate::config::{LimitsConfig, NamespaceConfig};
use crate::error::{ErrorKind, IngestError, Result, SizeScope};
use crate::security::{MAX_EXCERPT_CHARS, STRUCTURE_PATTERNS, sanitize_text, validate_byte_size};

/// A validated document: restricted metadata plus the body text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedEnvelope {
    pub metadata: Metadata,
    pub body: String,
}

impl ParsedEnvelope {
    pub fn name(&self) -> Option<&str> {
        self.metadata.get("name").and_then(MetadataValue::as_text)
    }

    /// Serialize back to `---\n<yaml>---\n<body>`.
    pub fn render(&self) -> Result<String> {
        Ok(format!("---\n{}---\n{}", self.render_metadata()?, self.body))
    }

    /// The metadata block as it will appear between the delimiters.
    pub fn render_metadata(&self) -> Result<String> {
        serde_yaml::to_string(&self.metadata)
            .map_err(|e| IngestError::malformed(format!("cannot render metadata: {}", e)))
    }
}

/// Per-call parser inputs.
#[derive(Debug, Clone, Default)]
pub struct ParseContext {
    /// Refuse keys missing from the field table.
    pub strict_keys: bool,
    /// Values derived from the declared path; lowest precedence.
    pub inferred: Metadata,
    /// Caller overrides; highest precedence.
    pub overrides: Metadata,
}

#[derive(Debug, Clone)]
pub struct RestrictedParser {
    max_document_bytes: usize,
    max_metadata_bytes: usize,
    max_metadata_keys: usize,
    fields: FieldTable,
}

impl RestrictedParser {
    pub fn new(limits: &LimitsConfig, namespace: &NamespaceConfig) -> Self {
        Self {
            max_document_bytes: limits.max_document_bytes,
            max_metadata_bytes: limits.max_metadata_bytes,
            max_metadata_keys: limits.max_metadata_keys,
            fields: FieldTable::new(limits, namespace),
        }
    }

    pub fn fields(&self) -> &FieldTable {
        &self.fields
    }

    pub fn parse(&self, raw: &[u8], ctx: &ParseContext) -> Result<ParsedEnvelope> {
        let text = std::str::from_utf8(raw).map_err(|e| {
            IngestError::malformed(format!("not valid UTF-8 after byte {}", e.valid_up_to()))
        })?;

        let envelope = split_envelope(text)?;
        validate_byte_size(
            envelope.metadata.as_bytes(),
            self.max_metadata_bytes,
            SizeScope::Metadata,
        )?;
        prescan_structure(envelope.metadata)?;

        let root: Value = serde_yaml::from_str(envelope.metadata)
            .map_err(|e| IngestError::malformed(format!("metadata is not valid YAML: {}", e)))?;
        let preserved = metadata_from_yaml(root, self.max_metadata_keys)?;
        debug!("Parsed {} metadata field(s)", preserved.len());

        let merged = merge_metadata(&ctx.inferred, preserved, &ctx.overrides);
        let metadata = self.fields.validate(merged, ctx.strict_keys)?;

        let parsed = ParsedEnvelope {
            metadata,
            body: envelope.body.to_string(),
        };
        self.check_rendered(&parsed)?;
        Ok(parsed)
    }

    /// Hold the rendered form of `envelope` to the same gates a stored
    /// document passes on load.
    ///
    /// Decoded values can spell syntax the raw block never showed: an
    /// escaped `"Note:\x20!x"` decodes to `Note: !x`, and stripping `$(id)`
    /// from `$(id)!x` leaves `!x`.
    pub fn check_rendered(&self, envelope: &ParsedEnvelope) -> Result<()> {
        let block = envelope.render_metadata()?;
        validate_byte_size(block.as_bytes(), self.max_metadata_bytes, SizeScope::Metadata)?;
        let rendered_len = block.len() + envelope.body.len() + 2 * "---\n".len();
        if rendered_len > self.max_document_bytes {
            return Err(IngestError::new(
                ErrorKind::TooLarge(SizeScope::Document),
                format!(
                    "rendered document is {} bytes, limit {}",
                    rendered_len, self.max_document_bytes
                ),
            ));
        }
        prescan_structure(&block).map_err(|e| {
            IngestError::new(
                ErrorKind::MaliciousStructure,
                format!("decoded metadata: {}", e.detail()),
            )
        })?;
        let root: Value = serde_yaml::from_str(&block).map_err(|e| {
            IngestError::malformed(format!("rendered metadata does not reparse: {}", e))
        })?;
        let reparsed = self
            .fields
            .validate(metadata_from_yaml(root, self.max_metadata_keys)?, false)?;
        if reparsed != envelope.metadata {
            return Err(IngestError::malformed(
                "rendered metadata does not reparse to the same values",
            ));
        }
        Ok(())
    }
}

/// Reject a raw metadata block that carries deserialization-attack syntax.
pub fn prescan_structure(block: &str) -> Result<()> {
    let hit = STRUCTURE_PATTERNS
        .iter()
        .find_map(|p| p.regex.find(block).map(|m| (p, m)));
    match hit {
        Some((pattern, m)) => Err(IngestError::new(
            ErrorKind::MaliciousStructure,
            format!(
                "{} at byte {}: {}",
                pattern.id,
                m.start(),
                sanitize_text(m.as_str(), MAX_EXCERPT_CHARS)
            ),
        )),
        None => Ok(()),
    }
}
