//! Dispatch configuration — endpoint target, key namespace, and completion sink

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{DispatchError, Result};

/// Managed inference endpoint the handler submits to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name (default: "WhisperEndpoint")
    #[serde(default = "default_endpoint_name")]
    pub name: String,

    /// Production variant whose instance count the controller adjusts
    #[serde(default = "default_variant_name")]
    pub variant: String,

    /// Content type sent with every submission (default: "audio/x-audio")
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: default_endpoint_name(),
            variant: default_variant_name(),
            content_type: default_content_type(),
        }
    }
}

/// Key namespace and per-message processing budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Prefix of newly submitted audio objects (default: "input/")
    #[serde(default = "default_input_prefix")]
    pub input_prefix: String,

    /// Prefix the endpoint writes successful results under (default: "output/")
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,

    /// Prefix the endpoint writes failure reports under (default: "failure/")
    #[serde(default = "default_failure_prefix")]
    pub failure_prefix: String,

    /// Hard wall-clock budget for one queue message (default: 900)
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_secs: u64,

    /// Leave messages with failed records on the queue for redelivery (default: false)
    #[serde(default)]
    pub retry_failed_messages: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            input_prefix: default_input_prefix(),
            output_prefix: default_output_prefix(),
            failure_prefix: default_failure_prefix(),
            invocation_timeout_secs: default_invocation_timeout(),
            retry_failed_messages: false,
        }
    }
}

impl DispatchConfig {
    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }

    /// All three prefixes, in classification order
    pub fn prefixes(&self) -> [&str; 3] {
        [&self.input_prefix, &self.output_prefix, &self.failure_prefix]
    }
}

/// Where completion artifacts are forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Structured log entry on the `completion_log` target (default)
    #[default]
    Log,
    /// HTTP POST of a JSON completion entry
    Webhook,
}

/// Completion sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Sink type
    #[serde(default)]
    pub kind: SinkKind,

    /// Target URL when `kind = "webhook"`
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Webhook request timeout in seconds (default: 10)
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,

    /// Artifact bodies larger than this are truncated before forwarding (default: 65536)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            webhook_url: None,
            timeout_secs: default_sink_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_endpoint_name() -> String {
    "WhisperEndpoint".to_string()
}

fn default_variant_name() -> String {
    "WhisperVariant".to_string()
}

fn default_content_type() -> String {
    "audio/x-audio".to_string()
}

fn default_input_prefix() -> String {
    "input/".to_string()
}

fn default_output_prefix() -> String {
    "output/".to_string()
}

fn default_failure_prefix() -> String {
    "failure/".to_string()
}

fn default_invocation_timeout() -> u64 {
    900
}

fn default_sink_timeout() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

/// Validate endpoint, dispatch, and sink settings together
pub fn validate_dispatch(
    endpoint: &EndpointConfig,
    dispatch: &DispatchConfig,
    sink: &SinkConfig,
) -> Result<()> {
    if endpoint.name.trim().is_empty() {
        return Err(DispatchError::Config(
            "Endpoint name must not be empty".to_string(),
        ));
    }
    if endpoint.content_type.trim().is_empty() {
        return Err(DispatchError::Config(
            "Endpoint content_type must not be empty".to_string(),
        ));
    }

    let prefixes = dispatch.prefixes();
    for p in prefixes {
        if p.is_empty() {
            return Err(DispatchError::Config(
                "Dispatch prefixes must not be empty".to_string(),
            ));
        }
    }
    // Every key must fall into at most one class
    for (i, a) in prefixes.iter().enumerate() {
        for b in prefixes.iter().skip(i + 1) {
            if a.starts_with(b) || b.starts_with(a) {
                return Err(DispatchError::Config(format!(
                    "Dispatch prefixes '{}' and '{}' overlap",
                    a, b
                )));
            }
        }
    }

    if dispatch.invocation_timeout_secs == 0 {
        return Err(DispatchError::Config(
            "Dispatch invocation_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if sink.kind == SinkKind::Webhook
        && sink.webhook_url.as_deref().map_or(true, |u| u.trim().is_empty())
    {
        return Err(DispatchError::Config(
            "Sink kind 'webhook' requires webhook_url".to_string(),
        ));
    }

    Ok(())
}
