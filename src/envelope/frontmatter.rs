//! Envelope splitting.
//!
//! A document is `---`, a metadata block, `---`, then the body. The
//! splitter walks the text line by line through [`ParseState`] and never
//! interprets the metadata; it only finds its bounds.

use crate::error::{IngestError, Result};

const DELIMITER: &str = "---";
const BOM: char = '\u{FEFF}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    SeekEnvelope,
    ParseMetadataBlock,
    ParseBody,
    Done,
}

/// Borrowed slices of the two envelope parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEnvelope<'a> {
    pub metadata: &'a str,
    pub body: &'a str,
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end_matches(['\n', '\r', ' ', '\t']) == DELIMITER
}

/// Split `text` into its metadata block and body.
///
/// The body is returned byte-for-byte, including its leading newline if
/// the author left a blank line after the closing delimiter.
pub fn split_envelope(text: &str) -> Result<RawEnvelope<'_>> {
    let text = text.strip_prefix(BOM).unwrap_or(text);

    let mut lines = text.split_inclusive('\n');
    let mut offset = 0;
    let mut metadata = 0..0;
    let mut body_start = 0;
    let mut state = ParseState::SeekEnvelope;

    loop {
        match state {
            ParseState::SeekEnvelope => {
                let line = lines
                    .next()
                    .ok_or_else(|| IngestError::malformed("document is empty"))?;
                if !is_delimiter(line) {
                    return Err(IngestError::malformed(
                        "document must start with a '---' delimiter line",
                    ));
                }
                offset += line.len();
                metadata = offset..offset;
                state = ParseState::ParseMetadataBlock;
            }
            ParseState::ParseMetadataBlock => {
                let line = lines.next().ok_or_else(|| {
                    IngestError::malformed("metadata block is not closed by a '---' line")
                })?;
                if is_delimiter(line) {
                    metadata.end = offset;
                    state = ParseState::ParseBody;
                }
                offset += line.len();
            }
            // everything after the closing delimiter is body, unparsed
            ParseState::ParseBody => {
                body_start = offset;
                state = ParseState::Done;
            }
            ParseState::Done => break,
        }
    }

    let metadata = &text[metadata];
    if metadata.trim().is_empty() {
        return Err(IngestError::malformed("metadata block is empty"));
    }

    Ok(RawEnvelope {
        metadata,
        body: &text[body_start..],
    })
}
