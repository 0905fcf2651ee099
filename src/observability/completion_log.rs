//! Structured completion log — one entry per fetched output or failure artifact
//!
//! Entries are emitted under the `completion_log` tracing target so they can
//! be filtered or routed separately from operational logs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::ObjectLocation;

/// Which kind of completion artifact an entry describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    /// Written by the endpoint under the output prefix
    Success,
    /// Written by the endpoint under the failure prefix
    Failure,
}

impl std::fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// A single completion log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionLogEntry {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub bucket: String,
    pub key: String,
    pub kind: CompletionKind,
    /// Full artifact size in bytes
    pub size_bytes: u64,
    /// Whether `body` was cut at the configured limit
    pub truncated: bool,
    /// Artifact content, lossily decoded as UTF-8
    pub body: String,
}

impl CompletionLogEntry {
    /// Build an entry from a fetched artifact, keeping at most `max_body_bytes`
    /// of its content
    pub fn new(
        location: &ObjectLocation,
        kind: CompletionKind,
        content: &[u8],
        max_body_bytes: usize,
    ) -> Self {
        let truncated = content.len() > max_body_bytes;
        let kept = if truncated {
            &content[..max_body_bytes]
        } else {
            content
        };
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            kind,
            size_bytes: content.len() as u64,
            truncated,
            body: String::from_utf8_lossy(kept).into_owned(),
        }
    }

    pub fn location(&self) -> ObjectLocation {
        ObjectLocation::new(&self.bucket, &self.key)
    }
}

/// Tracks and emits structured entries
pub struct CompletionLog {
    total_entries: Arc<AtomicU64>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self {
            total_entries: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record and emit a log entry
    pub fn record(&self, entry: &CompletionLogEntry) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
        match entry.kind {
            CompletionKind::Success => tracing::info!(
                target: "completion_log",
                bucket = entry.bucket,
                key = entry.key,
                kind = %entry.kind,
                size_bytes = entry.size_bytes,
                truncated = entry.truncated,
                "{}",
                entry.body
            ),
            CompletionKind::Failure => tracing::warn!(
                target: "completion_log",
                bucket = entry.bucket,
                key = entry.key,
                kind = %entry.kind,
                size_bytes = entry.size_bytes,
                truncated = entry.truncated,
                "{}",
                entry.body
            ),
        }
    }

    /// Get total number of logged entries
    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }
}

impl Default for CompletionLog {
    fn default() -> Self {
        Self::new()
    }
}
