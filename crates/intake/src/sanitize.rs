//! Helpers for trimming data before it reaches span attributes, logs or
//! persisted error columns.
//!
//! Storage paths can embed tenant and group identifiers; only the file name
//! goes into spans.

use std::path::Path;

/// Returns only the filename component of a storage path.
pub fn redact_path(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Truncates `text` to at most `max_chars` characters, appending `…` when
/// something was cut. Never splits a UTF-8 sequence.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
