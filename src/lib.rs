//! ElementGate - secure ingestion for untrusted, community-contributed
//! assistant elements (personas, skills, templates, agents)
//!
//! This crate provides:
//! - Threat pattern library and content scanner
//! - Primitive validators for paths, names, identifiers and sizes
//! - Restricted frontmatter parser with a closed metadata model
//! - Atomic, lock-protected document store
//! - Ingestion orchestrator with a security audit trail

pub mod config;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod paths;
pub mod security;
pub mod store;

pub use config::Config;
pub use error::{ErrorKind, IngestError};
pub use ingest::{Ingestor, ValidationOutcome};
