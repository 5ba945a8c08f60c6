//! Primitive validators for atomic untrusted values.
//!
//! All functions here are pure: no shared state, no I/O. Path validation
//! works on the lexical form only, so it can run before anything on disk
//! is touched.

use std::path::{Component, Path, PathBuf};

use super::patterns::{
    DISPLAY_STRIPPED_METACHARACTERS, SHELL_METACHARACTERS, is_control_char,
    is_invisible_format_char,
};
use crate::error::{ErrorKind, IngestError, Result, SizeScope};

/// Longest file name accepted, in characters.
pub const MAX_FILENAME_CHARS: usize = 255;

/// How many layers of percent-encoding are peeled before giving up.
const MAX_DECODE_ROUNDS: usize = 3;

/// A path that has been normalized and proven to lie strictly inside its base.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath {
    base: PathBuf,
    relative: PathBuf,
    full: PathBuf,
}

impl CanonicalPath {
    /// Normalized base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Normalized path relative to the base, using `/` components.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Base joined with the relative path.
    pub fn full(&self) -> &Path {
        &self.full
    }

    /// Relative path components as strings.
    pub fn components(&self) -> Vec<&str> {
        self.relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect()
    }
}

/// Character classes for allow-list validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    Lowercase,
    Uppercase,
    Digit,
    Hyphen,
    Underscore,
    Dot,
}

impl CharClass {
    fn admits(self, c: char) -> bool {
        match self {
            CharClass::Lowercase => c.is_ascii_lowercase(),
            CharClass::Uppercase => c.is_ascii_uppercase(),
            CharClass::Digit => c.is_ascii_digit(),
            CharClass::Hyphen => c == '-',
            CharClass::Underscore => c == '_',
            CharClass::Dot => c == '.',
        }
    }
}

/// Letters, digits, hyphen and underscore. Used for usernames and keys.
pub const IDENTIFIER_CHARS: &[CharClass] = &[
    CharClass::Lowercase,
    CharClass::Uppercase,
    CharClass::Digit,
    CharClass::Hyphen,
    CharClass::Underscore,
];

/// Validate a declared relative path against `base_dir`.
///
/// Percent-encoding (including double encoding) is decoded and backslashes
/// are treated as separators *before* normalization, so obfuscated
/// traversal is caught by the same containment check as plain `../`.
/// `.` segments are dropped and `..` segments resolved lexically; a `..`
/// that would climb above the base is a traversal. The result must lie
/// strictly inside the (lexically normalized) base.
pub fn validate_relative_path(path: &str, base_dir: &Path) -> Result<CanonicalPath> {
    if path.is_empty() {
        return Err(IngestError::path_traversal("empty path"));
    }

    let decoded = decode_path(path)?;
    if decoded.contains('\0') {
        return Err(IngestError::path_traversal("path contains a null byte"));
    }
    let unified = decoded.replace('\\', "/");

    if unified.starts_with('/') || unified.starts_with('~') || has_drive_prefix(&unified) {
        return Err(IngestError::path_traversal(format!(
            "absolute path not allowed: {}",
            path
        )));
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(IngestError::path_traversal(format!(
                        "path escapes base directory: {}",
                        path
                    )));
                }
            }
            s if s.trim_end_matches(['.', ' ']).is_empty() => {
                return Err(IngestError::path_traversal(format!(
                    "dot-only path segment: {}",
                    path
                )));
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(IngestError::path_traversal("path resolves to the base directory"));
    }

    let base = normalize_lexically(base_dir);
    let relative: PathBuf = segments.iter().collect();
    let full = base.join(&relative);

    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(IngestError::path_traversal(format!(
            "non-normal component after normalization: {}",
            path
        )));
    }
    if full == base || !full.starts_with(&base) {
        return Err(IngestError::path_traversal(format!(
            "path not inside base directory: {}",
            path
        )));
    }

    Ok(CanonicalPath {
        base,
        relative,
        full,
    })
}

/// Peel percent-encoding until the string stops changing.
fn decode_path(path: &str) -> Result<String> {
    let mut current = path.to_string();
    for _ in 0..MAX_DECODE_ROUNDS {
        let next = percent_decode(&current)?;
        if next == current {
            return Ok(current);
        }
        current = next;
    }
    if percent_decode(&current)? != current {
        return Err(IngestError::path_traversal("too many layers of percent-encoding"));
    }
    Ok(current)
}

fn percent_decode(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
        {
            out.push(hi << 4 | lo);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out)
        .map_err(|_| IngestError::path_traversal("percent-decoded path is not valid UTF-8"))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic()
    )
}

/// Resolve `.`/`..` lexically and make the path absolute against the
/// current directory. Never follows symlinks.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Validate a bare file name (no directories).
pub fn validate_filename(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(IngestError::invalid_name("empty file name"));
    }
    if name.chars().count() > MAX_FILENAME_CHARS {
        return Err(IngestError::invalid_name(format!(
            "file name longer than {} characters",
            MAX_FILENAME_CHARS
        )));
    }
    if name.contains('\0') {
        return Err(IngestError::invalid_name("file name contains a null byte"));
    }
    if name.contains(['/', '\\']) {
        return Err(IngestError::invalid_name("file name contains a path separator"));
    }
    if let Some(c) = name.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(IngestError::invalid_name(format!(
            "file name contains shell metacharacter {:?}",
            c
        )));
    }
    if name
        .chars()
        .any(|c| is_control_char(c) || is_invisible_format_char(c))
    {
        return Err(IngestError::invalid_name("file name contains control characters"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(IngestError::invalid_name(
            "file name may not start with '.' or '-'",
        ));
    }
    Ok(name.to_string())
}

/// Validate an identifier against an explicit allow-list of character classes.
pub fn validate_identifier(value: &str, allowed: &[CharClass], max_len: usize) -> Result<String> {
    if value.is_empty() {
        return Err(IngestError::invalid_name("empty identifier"));
    }
    if value.chars().count() > max_len {
        return Err(IngestError::invalid_name(format!(
            "identifier longer than {} characters",
            max_len
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|&c| !allowed.iter().any(|class| class.admits(c)))
    {
        return Err(IngestError::invalid_name(format!(
            "identifier contains disallowed character {:?}",
            c
        )));
    }
    Ok(value.to_string())
}

/// Match a value against a closed set (case-insensitive); returns the
/// canonical spelling from the set.
pub fn validate_enum<S: AsRef<str>>(value: &str, allowed: &[S]) -> Result<String> {
    let wanted = value.trim().to_ascii_lowercase();
    allowed
        .iter()
        .map(AsRef::as_ref)
        .find(|candidate| candidate.to_ascii_lowercase() == wanted)
        .map(str::to_string)
        .ok_or_else(|| {
            IngestError::new(
                ErrorKind::InvalidCategory,
                format!("'{}' is not one of the allowed values", value),
            )
        })
}

/// Best-effort cleanup for display strings.
///
/// Line breaks and tabs become spaces, other control characters,
/// bidi/zero-width formatting characters and the shell metacharacters
/// `; & | ` $` are dropped, and the result is cut to `max_len` characters.
pub fn sanitize_text(input: &str, max_len: usize) -> String {
    input
        .chars()
        .filter_map(|c| match c {
            '\n' | '\r' | '\t' => Some(' '),
            c if is_control_char(c) || is_invisible_format_char(c) => None,
            c if DISPLAY_STRIPPED_METACHARACTERS.contains(&c) => None,
            c => Some(c),
        })
        .take(max_len)
        .collect()
}

/// Check the true byte length of `input` against `max_bytes`.
pub fn validate_byte_size(input: &[u8], max_bytes: usize, scope: SizeScope) -> Result<()> {
    if input.len() > max_bytes {
        return Err(IngestError::new(
            ErrorKind::TooLarge(scope),
            format!("{} bytes exceeds the {} byte limit", input.len(), max_bytes),
        ));
    }
    Ok(())
}
