//! Append-only call transcripts.
//!
//! One text file per call under a daily-partitioned directory tree:
//! `<recordings_dir>/YYYY/MM/DD/conversation-<caller>-<callId>.txt` (local
//! date, zero-padded). Lines are `ISO8601 SPEAKER: text`. Write failures are
//! logged and swallowed; a broken disk must not take the call down.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::utils::sanitize_caller_id;

/// Transcript line attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "USER"),
            Speaker::Assistant => write!(f, "ASSISTANT"),
        }
    }
}

/// Factory producing per-call transcript handles under a base directory.
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    base_dir: PathBuf,
}

impl TranscriptWriter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve the transcript path for a call starting now.
    ///
    /// The daily partition is fixed at call start so a call spanning midnight
    /// keeps writing to one file.
    pub fn open(&self, caller_identity: &str, call_id: &str) -> TranscriptHandle {
        let day = Local::now().format("%Y/%m/%d").to_string();
        let filename = format!(
            "conversation-{}-{}.txt",
            sanitize_caller_id(caller_identity),
            call_id
        );
        TranscriptHandle {
            path: self.base_dir.join(day).join(filename),
        }
    }
}

/// Append handle for one call's transcript file.
#[derive(Debug, Clone)]
pub struct TranscriptHandle {
    path: PathBuf,
}

impl TranscriptHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one transcript line. Blank text is skipped; I/O failures are
    /// logged at warn and otherwise ignored.
    pub async fn append(&self, speaker: Speaker, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let line = format!(
            "{} {}: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            speaker,
            text
        );
        if let Err(e) = self.write_line(&line).await {
            warn!(path = %self.path.display(), "transcript write failed: {e}");
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
