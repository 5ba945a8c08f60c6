//! Threat pattern library.
//!
//! Two static catalogs of compiled signatures:
//!
//! - [`CONTENT_PATTERNS`] are applied to free-form text (document bodies and
//!   every string-valued metadata field).
//! - [`STRUCTURE_PATTERNS`] are applied to the raw metadata block before the
//!   YAML parser ever sees it. They target deserialization attacks: type
//!   tags, verbatim tags, anchors/aliases and merge keys.
//!
//! Both tables are plain data. Adding a signature means adding a row; the
//! scanner and parser never change.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Severity of a threat finding, ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recorded for auditing, text left untouched.
    Low,
    /// Matched span is stripped.
    Medium,
    /// Matched span is stripped.
    High,
    /// The whole document is rejected.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// A compiled signature with its classification.
#[derive(Debug)]
pub struct ThreatPattern {
    /// Stable dotted identifier, e.g. `exec.command_substitution`.
    pub id: &'static str,
    pub severity: Severity,
    pub description: &'static str,
    pub regex: Regex,
}

/// Raw table row: `(id, severity, description, regex source)`.
type PatternDef = (&'static str, Severity, &'static str, &'static str);

const CONTENT_PATTERN_DEFS: &[PatternDef] = &[
    // ── Prompt override markers ──
    (
        "injection.system_override",
        Severity::Critical,
        "bracketed system-prompt override marker",
        r"(?i)\[\s*system\s*:",
    ),
    (
        "injection.ignore_previous",
        Severity::High,
        "instruction to discard earlier instructions",
        r"(?i)\b(?:ignore|forget|disregard)\s+(?:all\s+|any\s+)?(?:of\s+)?(?:the\s+|your\s+)?(?:previous|prior|above|earlier)\s+(?:instructions|prompts|rules|directions)",
    ),
    (
        "injection.role_reassignment",
        Severity::High,
        "attempt to switch the assistant into a privileged role",
        r"(?i)\byou\s+are\s+now\s+(?:in\s+)?(?:an?\s+)?(?:admin|administrator|root|developer|god|jailbroken|unrestricted|dan)\b(?:\s+mode)?",
    ),
    (
        "injection.chat_markers",
        Severity::High,
        "chat-template role delimiter",
        r"(?i)<\|im_(?:start|end)\|>|\[/?INST\]|<</?SYS>>|</?system>",
    ),
    // ── Command execution ──
    (
        "exec.destructive_substitution",
        Severity::Critical,
        "command substitution invoking a destructive or network command",
        r"\$\([^)]*\b(?:rm|curl|wget|nc|ncat|bash|sh|zsh|chmod|chown|dd|mkfs|shutdown|reboot)\b[^)]*\)",
    ),
    (
        "exec.recursive_delete",
        Severity::Critical,
        "recursive forced delete of a root, home or glob target",
        r"\brm\s+-(?:[a-zA-Z]*r[a-zA-Z]*f|[a-zA-Z]*f[a-zA-Z]*r)[a-zA-Z]*\s+(?:/|~|\*)",
    ),
    (
        "exec.pipe_to_shell",
        Severity::Critical,
        "download piped straight into a shell",
        r"(?i)\b(?:curl|wget)\b[^\n|]*\|\s*(?:sudo\s+)?(?:ba|z|da)?sh\b",
    ),
    (
        "exec.reverse_shell",
        Severity::Critical,
        "reverse shell construct",
        r"/dev/(?:tcp|udp)/|\bnc(?:at)?\s+-[a-zA-Z]*e\b|\bbash\s+-i\s+>&",
    ),
    (
        "exec.fork_bomb",
        Severity::Critical,
        "shell fork bomb",
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;",
    ),
    (
        "exec.command_substitution",
        Severity::High,
        "shell command substitution",
        r"\$\([^()\n]*\)",
    ),
    (
        "exec.eval_call",
        Severity::High,
        "dynamic code evaluation call",
        r"\b(?:eval|exec)\s*\(",
    ),
    (
        "exec.variable_expansion",
        Severity::Medium,
        "shell parameter expansion",
        r"\$\{[^}\n]*\}",
    ),
    (
        "exec.backtick_shell",
        Severity::Medium,
        "backticked expression containing shell metacharacters",
        r"`[^`\n]*[;&|$][^`\n]*`",
    ),
    (
        "exec.backtick_command",
        Severity::Medium,
        "backticked shell command with arguments",
        r"`\s*(?:sudo\s+)?(?:cat|curl|wget|bash|sh|zsh|python3?|node|perl|rm|chmod|chown|nc|ncat)\s+[^`\n]+`",
    ),
    // ── Path traversal ──
    (
        "path.traversal",
        Severity::High,
        "repeated or system-rooted parent-directory traversal",
        r"(?i)(?:(?:\.\.|%2e%2e|%2e\.|\.%2e)(?:/|\\|%2f|%5c)){2,}|(?:\.\.|%2e%2e|%2e\.|\.%2e)(?:/|\\|%2f|%5c)(?:etc|windows|proc|root|home|usr|var|boot|sys)\b",
    ),
    // ── Object construction / deserialization gadgets ──
    (
        "object.yaml_type_tag",
        Severity::Critical,
        "language-specific YAML type tag",
        r"(?i)!{1,2}(?:python|ruby|js|javascript|java|perl|php)/",
    ),
    (
        "object.prototype_pollution",
        Severity::Critical,
        "prototype pollution key",
        r#"__proto__|\bconstructor\s*(?:\.\s*prototype|\[\s*['"]prototype)"#,
    ),
    (
        "object.js_function",
        Severity::Critical,
        "JavaScript dynamic function or child process construction",
        r#"\bnew\s+Function\s*\(|\brequire\s*\(\s*['"](?:child_process|vm)['"]\s*\)"#,
    ),
    (
        "object.python_exec",
        Severity::Critical,
        "Python process or import construction",
        r"\b__import__\s*\(|\bos\.(?:system|popen)\s*\(|\bsubprocess\.(?:Popen|call|run|check_output)\s*\(",
    ),
    (
        "object.java_runtime",
        Severity::Critical,
        "Java runtime or script engine construction",
        r"\bjava\.lang\.(?:Runtime|ProcessBuilder)\b|\bjavax\.script\.ScriptEngineManager\b",
    ),
    // ── Markup ──
    (
        "markup.script_block",
        Severity::High,
        "script element",
        r"(?is)<script\b[^>]*>.*?</script\s*>",
    ),
    (
        "markup.script_tag",
        Severity::High,
        "unterminated script tag",
        r"(?i)</?script\b[^>]*>",
    ),
    (
        "markup.embedded_frame",
        Severity::High,
        "iframe, object or embed element",
        r"(?i)<(?:iframe|object|embed)\b[^>]*>",
    ),
    (
        "markup.event_handler",
        Severity::High,
        "inline DOM event handler attribute",
        r#"(?i)\bon(?:load|error|click|mouseover|mouseout|focus|blur|submit|change|keydown|keyup|input|toggle)\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#,
    ),
    (
        "markup.script_uri",
        Severity::High,
        "javascript: or vbscript: URI",
        r#"(?i)\b(?:javascript|vbscript):[^\s"'<>)]+"#,
    ),
    // ── Invisible characters ──
    (
        "chars.bidi_override",
        Severity::High,
        "bidirectional override or isolate character",
        r"[\u{202A}-\u{202E}\u{2066}-\u{2069}]",
    ),
    (
        "chars.zero_width",
        Severity::Medium,
        "zero-width formatting character",
        r"[\u{200B}-\u{200F}\u{2060}\u{FEFF}]",
    ),
    (
        "chars.control",
        Severity::Medium,
        "C0/C1 control character",
        r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F\u{80}-\u{9F}]",
    ),
    // ── Hints ──
    ("hint.sudo", Severity::Low, "privilege escalation mention", r"\bsudo\b"),
    (
        "hint.shell_chain",
        Severity::Low,
        "shell command chaining operator",
        r"&&|\|\|",
    ),
    (
        "hint.base64_blob",
        Severity::Low,
        "long base64-like blob",
        r"[A-Za-z0-9+/]{120,}={0,2}",
    ),
    (
        "hint.raw_ip_url",
        Severity::Low,
        "URL addressed by raw IPv4",
        r"(?i)\bhttps?://\d{1,3}(?:\.\d{1,3}){3}",
    ),
];

/// Prefix matching a YAML node position: start of line (optionally a
/// sequence dash), after a mapping colon, or inside a flow collection.
macro_rules! node_start {
    ($tail:literal) => {
        concat!(r"(?m)(?:^[ \t]*(?:-[ \t]+)?|:[ \t]+|[\[{,][ \t]*)", $tail)
    };
}

const STRUCTURE_PATTERN_DEFS: &[PatternDef] = &[
    (
        "yaml.language_tag",
        Severity::Critical,
        "language-specific type tag",
        r"(?i)!{1,2}(?:python|ruby|js|javascript|java|perl|php)\b",
    ),
    (
        "yaml.verbatim_tag",
        Severity::Critical,
        "verbatim tag",
        r"!<[^>]*>",
    ),
    (
        "yaml.tag_directive",
        Severity::Critical,
        "%TAG or %YAML directive",
        r"(?m)^%(?:TAG|YAML)\b",
    ),
    (
        "yaml.custom_tag",
        Severity::Critical,
        "custom tag on a node",
        node_start!(r"!"),
    ),
    (
        "yaml.anchor",
        Severity::Critical,
        "anchor definition",
        node_start!(r"&[A-Za-z0-9_-]+"),
    ),
    (
        "yaml.alias",
        Severity::Critical,
        "alias reference",
        node_start!(r"\*[A-Za-z0-9_-]+"),
    ),
    (
        "yaml.merge_key",
        Severity::Critical,
        "merge key",
        r"(?m)^[ \t]*(?:-[ \t]+)?<<[ \t]*:",
    ),
    (
        "yaml.object_construction",
        Severity::Critical,
        "object construction keyword",
        r"(?i)\bobject/(?:apply|new|module)\b|__import__|\bjava\.lang\.|\bjavax\.script\b|\bProcessBuilder\b|\bos\.system\b|\bsubprocess\.",
    ),
];

/// Signatures applied to free-form text.
pub static CONTENT_PATTERNS: Lazy<Vec<ThreatPattern>> =
    Lazy::new(|| compile_patterns(CONTENT_PATTERN_DEFS));

/// Signatures applied to the raw metadata block before parsing.
pub static STRUCTURE_PATTERNS: Lazy<Vec<ThreatPattern>> =
    Lazy::new(|| compile_patterns(STRUCTURE_PATTERN_DEFS));

fn compile_patterns(defs: &[PatternDef]) -> Vec<ThreatPattern> {
    defs.iter()
        .filter_map(|&(id, severity, description, source)| match Regex::new(source) {
            Ok(regex) => Some(ThreatPattern {
                id,
                severity,
                description,
                regex,
            }),
            Err(e) => {
                warn!("Threat pattern {} failed to compile: {}", id, e);
                None
            }
        })
        .collect()
}

/// Shell metacharacters never allowed in file names.
pub const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '\n', '\r'];

/// Shell metacharacters stripped from display strings.
pub const DISPLAY_STRIPPED_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$'];

/// C0 and C1 control characters (tab, newline and carriage return excluded).
pub fn is_control_char(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}'..='\u{9F}')
}

/// Bidirectional overrides/isolates and zero-width formatting characters.
pub fn is_invisible_format_char(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2069}' | '\u{FEFF}'
    )
}

/// Look up a content pattern by id.
pub fn content_pattern(id: &str) -> Option<&'static ThreatPattern> {
    CONTENT_PATTERNS.iter().find(|p| p.id == id)
}
