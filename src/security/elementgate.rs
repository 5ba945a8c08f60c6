//! # ElementGate Security Module
//!
//! Front door for security review: every security-critical type, constant
//! and function used by the ingestion pipeline is re-exported here.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 elementgate.rs (you are here)                    │
//! │                 Public API facade & documentation                │
//! ├───────────────┬──────────────────┬───────────────┬──────────────┤
//! │ patterns.rs   │ validators.rs    │ scanner.rs    │ audit.rs     │
//! │ Signature     │ Paths, names,    │ Tiered scan:  │ Security     │
//! │ catalogs +    │ identifiers,     │ reject /      │ events, sink │
//! │ severities    │ enums, sizes     │ strip / log   │ trait, JSONL │
//! └───────────────┴──────────────────┴───────────────┴──────────────┘
//! ```
//!
//! ## Security Model
//!
//! 1. **Untrusted by default**: bodies *and* every metadata string are
//!    scanned. Nothing from the collection or from disk is trusted.
//!
//! 2. **Fail closed**: any Critical finding rejects the whole document.
//!    Sanitization is reserved for constructs that are safe to strip.
//!
//! 3. **Stable output**: sanitized text is rescanned until a pass strips
//!    nothing, so accepted text never contains a strippable construct and
//!    re-validating it is a no-op.
//!
//! 4. **No echo**: error details, finding excerpts and audit records pass
//!    through [`sanitize_text`] and are length-bounded before they are
//!    logged or returned.
//!
//! ## Threat Model
//!
//! | Threat | Defense Layer |
//! |--------|--------------|
//! | `../` or encoded traversal in a declared path | [`validate_relative_path`] |
//! | Shell metacharacters in file names | [`validate_filename`] |
//! | Oversized documents or fields | [`validate_byte_size`] |
//! | Command substitution, reverse shells | [`CONTENT_PATTERNS`] (critical) |
//! | Prompt override markers, script markup | [`CONTENT_PATTERNS`] (stripped) |
//! | Bidi / zero-width smuggling | [`CONTENT_PATTERNS`] (stripped) |
//! | YAML type tags, anchors, merge keys | [`STRUCTURE_PATTERNS`] |
//! | Undetected tampering with the audit trail | [`AuditLog`] hash chain |

// ── Threat Pattern Library ──────────────────────────────────────────

pub use super::patterns::{
    CONTENT_PATTERNS, DISPLAY_STRIPPED_METACHARACTERS, SHELL_METACHARACTERS, STRUCTURE_PATTERNS,
    Severity, ThreatPattern, content_pattern, is_control_char, is_invisible_format_char,
};

// ── Primitive Validators ────────────────────────────────────────────

pub use super::validators::{
    CanonicalPath, CharClass, IDENTIFIER_CHARS, MAX_FILENAME_CHARS, normalize_lexically,
    sanitize_text, validate_byte_size, validate_enum, validate_filename, validate_identifier,
    validate_relative_path,
};

// ── Content Threat Scanner ──────────────────────────────────────────

pub use super::scanner::{ContentScanner, MAX_EXCERPT_CHARS, Review, ThreatFinding, scan};

// ── Security Events ─────────────────────────────────────────────────

pub use super::audit::{
    AuditEntry, AuditLog, AuditSink, EventType, FanoutSink, MemorySink, SecurityEvent,
    SourceComponent, TracingSink,
};

pub(crate) use super::audit::sha256_hex;
