//! Environment variable helpers.
//!
//! All configuration is environment-driven (populated from the deployment's
//! `.env` bundle by `dotenvy` before this module runs). Values are trimmed;
//! empty variables count as unset. Unparseable numeric values fall back to
//! their defaults with a warning rather than aborting startup.

use std::str::FromStr;

use tracing::warn;

/// Read a trimmed, non-empty environment variable.
pub(crate) fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a variable with a default.
pub(crate) fn var_or(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|| default.to_string())
}

/// Parse a variable into `T`, falling back to `default` on absence or parse
/// failure.
pub(crate) fn parse_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match var(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring invalid value for {key}: {raw:?}");
            default
        }),
    }
}

/// Parse a boolean variable. Accepts `true/false`, `1/0`, `yes/no`, `on/off`
/// (case-insensitive); anything else falls back to `default`.
pub(crate) fn var_bool(key: &str, default: bool) -> bool {
    match var(key) {
        None => default,
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            other => {
                warn!("ignoring invalid boolean for {key}: {other:?}");
                default
            }
        },
    }
}
