//! Reading and writing zsh extended-history text.
//!
//! On-disk format, one record per line:
//!
//! ```text
//! : 1700000000:0;git status
//! legacy command without a timestamp
//! ```
//!
//! A line ending in `\` continues onto the next physical line; the command
//! keeps the backslash-newline verbatim so the shell reads it back unchanged.
//! Backslashes left dangling at the very end of the text are dropped.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::record::{HistoryRecord, HistorySet};
use crate::errors::ParseError;

/// Text encodings tried, in order, when decoding a history file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

impl TextEncoding {
    /// Default priority list: strict UTF-8, then Latin-1.
    pub fn defaults() -> Vec<TextEncoding> {
        vec![TextEncoding::Utf8, TextEncoding::Latin1]
    }

    fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            TextEncoding::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

/// Decode raw bytes with the first encoding that accepts them.
///
/// Never fails: if every listed encoding rejects the input, falls back to a
/// lossy UTF-8 decode.
pub fn decode(bytes: &[u8], encodings: &[TextEncoding]) -> String {
    for encoding in encodings {
        if let Some(text) = encoding.decode(bytes) {
            if *encoding != TextEncoding::Utf8 {
                debug!(?encoding, "decoded history with fallback encoding");
            }
            return text;
        }
    }
    warn!("no configured encoding accepted history bytes, decoding lossily");
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parse history text into a normalized set. Malformed lines are dropped.
pub fn parse(raw_text: &str) -> HistorySet {
    let mut records = Vec::new();
    let mut dropped = 0usize;

    for logical in logical_lines(raw_text) {
        match parse_line(&logical) {
            Ok(record) => records.push(record),
            Err(ParseError::Blank) => {}
            Err(err) => {
                dropped += 1;
                debug!(error = %err, "dropping malformed history line");
            }
        }
    }

    if dropped > 0 {
        debug!(dropped, "malformed history lines dropped");
    }
    HistorySet::from_records(records)
}

/// Render a set back to history text, one record per line.
pub fn serialize(history: &HistorySet) -> String {
    let mut out = String::new();
    for record in history {
        out.push_str(&record.to_string());
        out.push('\n');
    }
    out
}

/// Parse a single logical line (continuations already joined).
pub fn parse_line(line: &str) -> Result<HistoryRecord, ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::Blank);
    }

    if let Some((timestamp, elapsed, command)) = split_marker(line) {
        return HistoryRecord::new(timestamp, elapsed, command, line)
            .ok_or_else(|| ParseError::EmptyCommand(line.to_string()));
    }

    // No usable marker: keep the whole line as an untimed command.
    HistoryRecord::new(0, 0, line, line).ok_or(ParseError::Blank)
}

/// Split `: <epoch>:<elapsed>;<command>` into its parts.
fn split_marker(line: &str) -> Option<(i64, u64, &str)> {
    let rest = line.strip_prefix(':')?;
    if !rest.starts_with(' ') {
        return None;
    }
    let (header, command) = rest.split_once(';')?;
    let (epoch, elapsed) = header.trim_start().split_once(':')?;
    if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if elapsed.is_empty() || !elapsed.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((epoch.parse().ok()?, elapsed.parse().ok()?, command))
}

/// Join backslash-continued physical lines.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Option<String> = None;

    for physical in text.split('\n') {
        let physical = physical.strip_suffix('\r').unwrap_or(physical);
        let joined = match current.take() {
            Some(mut acc) => {
                acc.push('\n');
                acc.push_str(physical);
                acc
            }
            None => physical.to_string(),
        };
        if joined.ends_with('\\') {
            current = Some(joined);
        } else {
            lines.push(joined);
        }
    }
    // A truncated file can end mid-continuation. Written back as is, the
    // dangling backslash would swallow whatever record follows it.
    if let Some(rest) = current {
        lines.push(rest.trim_end_matches('\\').to_string());
    }
    lines
}

/// Read and parse a history file. A missing file is an empty history.
pub fn read_history_file(path: &Path, encodings: &[TextEncoding]) -> std::io::Result<HistorySet> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let history = parse(&decode(&bytes, encodings));
            debug!(path = %path.display(), records = history.len(), "read history file");
            Ok(history)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "history file missing, treating as empty");
            Ok(HistorySet::new())
        }
        Err(e) => Err(e),
    }
}

/// Replace a history file atomically: write a sibling temp file, then rename.
pub fn write_history_file(path: &Path, history: &HistorySet) -> std::io::Result<()> {
    write_text_atomically(path, &serialize(history))?;
    debug!(path = %path.display(), records = history.len(), "wrote history file");
    Ok(())
}

pub(crate) fn write_text_atomically(path: &Path, text: &str) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(text.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
