//! Trigger-phrase parsing and normalization.
//!
//! Phrase lists arrive from the environment as single-quoted, comma-separated
//! entries (`'thanks, goodbye','have a nice day'`). Entries are NFKC-normalized
//! and lower-cased once at load time; assistant transcripts get the same
//! treatment before substring matching, so the comparison is accent- and
//! width-insensitive.

use unicode_normalization::UnicodeNormalization;

/// Normalize a phrase or transcript for matching: NFKC, lower-case, trimmed.
pub fn normalize_phrase(raw: &str) -> String {
    raw.nfkc().collect::<String>().to_lowercase().trim().to_string()
}

/// Parse a single-quoted, comma-separated phrase list.
///
/// Text outside quotes (including the separating commas) is ignored, so
/// phrases may themselves contain commas. As a convenience, input without any
/// quotes at all is split on commas. Entries are normalized; empty entries are
/// dropped.
pub fn parse_phrase_list(raw: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut saw_quote = false;

    for c in raw.chars() {
        match c {
            '\'' => {
                saw_quote = true;
                if in_quote {
                    entries.push(std::mem::take(&mut current));
                }
                in_quote = !in_quote;
            }
            _ if in_quote => current.push(c),
            _ => {}
        }
    }

    if !saw_quote {
        entries = raw.split(',').map(str::to_string).collect();
    }

    entries
        .iter()
        .map(|e| normalize_phrase(e))
        .filter(|e| !e.is_empty())
        .collect()
}
