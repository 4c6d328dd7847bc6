//! Caller identity sanitizing.
//!
//! Caller identities come straight from SIP headers and end up in transcript
//! filenames, so they are reduced to the characters that are safe there.

/// Sanitize a caller identity for use in a filename.
///
/// Keeps digits and `+` only; everything else is stripped. An identity that
/// sanitizes to the empty string becomes `"unknown"`.
pub fn sanitize_caller_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}
