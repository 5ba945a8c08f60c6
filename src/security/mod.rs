//! Centralized security module for ElementGate.
//!
//! See [`elementgate`] for the module overview, threat model,
//! and public API documentation.

mod audit;
mod elementgate;
mod patterns;
mod scanner;
mod validators;

// The elementgate.rs facade controls the entire public API surface.
pub use self::elementgate::*;

#[cfg(test)]
pub use self::audit::MockAuditSink;
