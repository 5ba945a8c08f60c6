//! Ingestion orchestrator and the logical path namespace it enforces.

mod namespace;
mod pipeline;

pub use namespace::{ElementLocation, Namespace, PathShape};
pub use pipeline::{AcceptedDocument, IngestOptions, Ingestor, ValidationOutcome};
