//! Small shared helpers
//!
//! This module groups utilities used across the bridge:
//! - `caller_id` - caller identity sanitizing for filenames
//! - `phrases` - trigger-phrase parsing and normalization

pub mod caller_id;
pub use caller_id::sanitize_caller_id;
pub mod phrases;
pub use phrases::{normalize_phrase, parse_phrase_list};
