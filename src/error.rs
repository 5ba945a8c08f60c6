//! Error taxonomy shared by every ingestion step.
//!
//! Validators, the parser, the scanner and the store all return
//! [`IngestError`], whose [`ErrorKind`] is the closed set of rejection
//! reasons the orchestrator reports and audits. The `detail` string is
//! always sanitized and bounded before it is stored, so an error can be
//! logged or shown to the user without echoing a hostile payload.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::security::{Severity, sanitize_text};

/// Upper bound on the characters kept in an error detail.
pub const MAX_DETAIL_CHARS: usize = 200;

/// Which size ceiling was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeScope {
    /// The whole raw document.
    Document,
    /// The metadata block between the envelope delimiters.
    Metadata,
    /// A single metadata field or the body text.
    Field,
}

impl fmt::Display for SizeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeScope::Document => write!(f, "document"),
            SizeScope::Metadata => write!(f, "metadata"),
            SizeScope::Field => write!(f, "field"),
        }
    }
}

/// Rejection reasons, independent of where they were raised.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ErrorKind {
    PathTraversal,
    InvalidName,
    InvalidCategory,
    TooLarge(SizeScope),
    MalformedEnvelope,
    MaliciousStructure,
    InvalidField(String),
    ThreatDetected(Severity),
    /// Lock contention: the per-path lock was not acquired in time.
    Busy,
    /// Underlying I/O failure during an atomic read or write.
    StorageFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::PathTraversal => write!(f, "path traversal"),
            ErrorKind::InvalidName => write!(f, "invalid name"),
            ErrorKind::InvalidCategory => write!(f, "invalid category"),
            ErrorKind::TooLarge(scope) => write!(f, "{} too large", scope),
            ErrorKind::MalformedEnvelope => write!(f, "malformed envelope"),
            ErrorKind::MaliciousStructure => write!(f, "malicious structure"),
            ErrorKind::InvalidField(name) => write!(f, "invalid field '{}'", name),
            ErrorKind::ThreatDetected(severity) => write!(f, "{} threat detected", severity),
            ErrorKind::Busy => write!(f, "busy"),
            ErrorKind::StorageFailure => write!(f, "storage failure"),
        }
    }
}

/// A typed rejection with a bounded, sanitized explanation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct IngestError {
    kind: ErrorKind,
    detail: String,
}

impl IngestError {
    /// Build an error; `detail` is sanitized and truncated here.
    pub fn new(kind: ErrorKind, detail: impl AsRef<str>) -> Self {
        Self {
            kind,
            detail: sanitize_text(detail.as_ref(), MAX_DETAIL_CHARS),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn path_traversal(detail: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::PathTraversal, detail)
    }

    pub fn invalid_name(detail: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::InvalidName, detail)
    }

    pub fn invalid_field(field: &str, detail: impl AsRef<str>) -> Self {
        let field = sanitize_text(field, 64);
        Self::new(ErrorKind::InvalidField(field), detail)
    }

    pub fn malformed(detail: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::MalformedEnvelope, detail)
    }

    pub fn storage(context: &str, err: &std::io::Error) -> Self {
        Self::new(ErrorKind::StorageFailure, format!("{}: {}", context, err))
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
