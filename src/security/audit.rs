//! Security events and the sinks that receive them.
//!
//! Every rejection and every successful sensitive operation (save, load,
//! delete) produces one [`SecurityEvent`]. The pipeline hands events to an
//! injected [`AuditSink`] and never reads them back.
//!
//! # JSONL audit log
//!
//! [`AuditLog`] stores one JSON object per line. Each line carries a
//! SHA-256 of the previous raw line (`prev_entry_sha256`), forming a
//! tamper-evident chain:
//!
//! | Field | Description |
//! |-------|-------------|
//! | `id` | UUID v4 of the event |
//! | `ts` | RFC 3339 timestamp |
//! | `event_type` | `document_saved`, `ingest_rejected`, ... |
//! | `severity` | `low` .. `critical` |
//! | `source` | pipeline component that raised it |
//! | `path` | declared path, sanitized (optional) |
//! | `detail` | sanitized, bounded explanation |
//! | `rejection` | error kind for rejections (optional) |
//! | `prev_entry_sha256` | chain link |
//!
//! The first entry links to 64 zeros. A corrupted last line is bridged by
//! a `chain_recovery` entry before the next append.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::patterns::Severity;
use super::validators::sanitize_text;
use crate::error::{ErrorKind, IngestError, MAX_DETAIL_CHARS};

/// The hash used for the first entry in the chain (no predecessor).
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Document accepted and persisted.
    DocumentSaved,
    /// Document accepted in validate-only mode.
    DocumentValidated,
    /// Stored document read back and re-validated.
    DocumentLoaded,
    /// Stored document removed.
    DocumentDeleted,
    /// High/Medium findings were stripped from an accepted document.
    ContentSanitized,
    /// Low findings left in an accepted document.
    LowSeverityFinding,
    /// Any rejection; `rejection` carries the kind.
    IngestRejected,
    /// Previous audit line corrupted, new chain segment started.
    ChainRecovery,
}

/// Pipeline component that raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceComponent {
    PathValidator,
    SizeGate,
    Parser,
    Scanner,
    Store,
    Orchestrator,
    AuditLog,
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub source: SourceComponent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<ErrorKind>,
}

impl SecurityEvent {
    pub fn new(
        event_type: EventType,
        severity: Severity,
        source: SourceComponent,
        detail: impl AsRef<str>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            source,
            path: None,
            detail: sanitize_text(detail.as_ref(), MAX_DETAIL_CHARS),
            rejection: None,
        }
    }

    /// Event for a rejection. Threats keep their own severity; everything
    /// else is recorded as `high`.
    pub fn rejected(err: &IngestError, source: SourceComponent) -> Self {
        let severity = match err.kind() {
            ErrorKind::ThreatDetected(severity) => *severity,
            ErrorKind::MaliciousStructure => Severity::Critical,
            ErrorKind::Busy | ErrorKind::StorageFailure => Severity::Medium,
            _ => Severity::High,
        };
        Self {
            rejection: Some(err.kind().clone()),
            ..Self::new(EventType::IngestRejected, severity, source, err.detail())
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(sanitize_text(path, MAX_DETAIL_CHARS));
        self
    }
}

/// Receiver for security events. Recording never fails from the caller's
/// point of view; sinks report their own trouble through `tracing`.
#[cfg_attr(test, mockall::automock)]
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &SecurityEvent);
}

/// Writes each event as a structured `tracing` line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &SecurityEvent) {
        let path = event.path.as_deref().unwrap_or("-");
        if event.event_type == EventType::IngestRejected || event.severity >= Severity::High {
            warn!(
                event = ?event.event_type,
                severity = %event.severity,
                source = ?event.source,
                path,
                "{}",
                event.detail
            );
        } else {
            info!(
                event = ?event.event_type,
                severity = %event.severity,
                source = ?event.source,
                path,
                "{}",
                event.detail
            );
        }
    }
}

/// Keeps events in memory. Useful when embedding the pipeline.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &SecurityEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}

/// One line of the JSONL audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(flatten)]
    pub event: SecurityEvent,
    /// SHA-256 of the previous JSONL line (chain link, hex-encoded).
    pub prev_entry_sha256: String,
}

/// Append-only, hash-chained JSONL audit log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `event`, chaining it to the last line on disk.
    ///
    /// Appends are serialized in-process by a mutex and across processes by
    /// an advisory lock on the log file.
    pub fn append(&self, event: &SecurityEvent) -> Result<()> {
        let _guard = self
            .append_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create audit log directory")?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open audit log")?;
        file.lock_exclusive().context("Failed to lock audit log")?;

        let result = self.append_locked(&mut file, event);
        let _ = FileExt::unlock(&file);
        result
    }

    fn append_locked(&self, file: &mut fs::File, event: &SecurityEvent) -> Result<()> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut content)
            .context("Failed to read audit log")?;

        let prev_hash = match content.lines().rfind(|l| !l.is_empty()) {
            Some(last_line) => {
                if serde_json::from_str::<AuditEntry>(last_line).is_ok() {
                    sha256_hex(last_line.as_bytes())
                } else {
                    let recovery = AuditEntry {
                        event: SecurityEvent::new(
                            EventType::ChainRecovery,
                            Severity::Medium,
                            SourceComponent::AuditLog,
                            format!(
                                "Previous entry corrupted ({} bytes), new chain segment",
                                last_line.len()
                            ),
                        ),
                        prev_entry_sha256: sha256_hex(last_line.as_bytes()),
                    };
                    let recovery_json = serde_json::to_string(&recovery)
                        .context("Failed to serialize recovery entry")?;
                    writeln!(file, "{}", recovery_json).context("Failed to write audit entry")?;
                    sha256_hex(recovery_json.as_bytes())
                }
            }
            None => GENESIS_HASH.to_string(),
        };

        let entry = AuditEntry {
            event: event.clone(),
            prev_entry_sha256: prev_hash,
        };
        let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        writeln!(file, "{}", json).context("Failed to write audit entry")?;
        file.sync_data().context("Failed to flush audit log")?;
        debug!("Audit entry appended: {:?}", event.event_type);
        Ok(())
    }

    /// Read all parseable entries. Corrupted lines are skipped.
    pub fn read_entries(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        Ok(content
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
            .collect())
    }

    /// Indices of lines whose chain link does not match. Empty means intact.
    pub fn verify_chain(&self) -> Result<Vec<usize>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let mut broken = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
                broken.push(i);
                continue;
            };
            let expected = if i == 0 {
                GENESIS_HASH.to_string()
            } else {
                sha256_hex(lines[i - 1].as_bytes())
            };
            if entry.prev_entry_sha256 != expected {
                broken.push(i);
            }
        }
        Ok(broken)
    }
}

impl AuditSink for AuditLog {
    fn record(&self, event: &SecurityEvent) {
        if let Err(e) = self.append(event) {
            warn!("Failed to append audit entry to {}: {:#}", self.path.display(), e);
        }
    }
}

/// Forwards every event to several sinks.
pub struct FanoutSink {
    sinks: Vec<Box<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutSink {
    fn record(&self, event: &SecurityEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Compute hex-encoded SHA-256.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
