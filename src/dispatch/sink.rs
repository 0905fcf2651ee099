//! Completion sink — where fetched output and failure artifacts go
//!
//! - `LogSink` — structured entry on the `completion_log` tracing target
//! - `WebhookSink` — POSTs the entry as JSON to a configured URL
//! - `MemorySink` — records entries in memory (tests and dry runs)

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{SinkConfig, SinkKind};
use crate::error::{DispatchError, Result};
use crate::observability::{CompletionLog, CompletionLogEntry};

/// Receives completion artifacts
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Forward one completion entry
    async fn forward(&self, entry: &CompletionLogEntry) -> Result<()>;

    /// Sink name (for logging)
    fn name(&self) -> &str;
}

/// Build the sink described by the configuration
pub fn build_sink(config: &SinkConfig) -> Result<Arc<dyn CompletionSink>> {
    match config.kind {
        SinkKind::Log => Ok(Arc::new(LogSink::new())),
        SinkKind::Webhook => {
            let url = config.webhook_url.as_deref().ok_or_else(|| {
                DispatchError::Config("Webhook sink requires webhook_url".to_string())
            })?;
            Ok(Arc::new(WebhookSink::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

pub struct LogSink {
    log: CompletionLog,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            log: CompletionLog::new(),
        }
    }

    /// Entries emitted so far
    pub fn total_entries(&self) -> u64 {
        self.log.total_entries()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionSink for LogSink {
    async fn forward(&self, entry: &CompletionLogEntry) -> Result<()> {
        self.log.record(entry);
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ---------------------------------------------------------------------------
// WebhookSink
// ---------------------------------------------------------------------------

/// POSTs each completion entry as JSON
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl CompletionSink for WebhookSink {
    async fn forward(&self, entry: &CompletionLogEntry) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(entry)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Other(format!(
                    "Webhook request failed for '{}': {}",
                    entry.key, e
                ))
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Other(format!(
                "Webhook returned {} for '{}': {}",
                status, entry.key, body
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Sink that keeps every entry in memory
pub struct MemorySink {
    entries: Mutex<Vec<CompletionLogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<CompletionLogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CompletionSink for MemorySink {
    async fn forward(&self, entry: &CompletionLogEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
