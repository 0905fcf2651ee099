//! Configuration types for whisper-dispatch
//!
//! One HCL file describes the store, queue, endpoint, dispatch rules, scaling
//! policy, registry and completion sink. Deployment identifiers (bucket,
//! queue, endpoint, region, account) can be overridden from the environment.

mod dispatch;
mod registry;
pub mod scaling;

pub use dispatch::{DispatchConfig, EndpointConfig, SinkConfig, SinkKind};
pub use registry::RegistryConfig;
pub use scaling::{ScalingPolicy, Statistic};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DispatchError, Result};

/// Top-level service configuration
///
/// # HCL Example
///
/// ```hcl
/// store {
///   bucket = "whisper-jobs-bucket"
/// }
///
/// queue {
///   name       = "whisper-jobs"
///   batch_size = 10
/// }
///
/// endpoint {
///   name    = "WhisperEndpoint"
///   variant = "WhisperVariant"
/// }
///
/// scaling {
///   max_capacity           = 1
///   scale_in_cooldown_secs = 300
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Object store holding input, output, and failure objects
    #[serde(default)]
    pub store: StoreConfig,

    /// Queue the store's creation events are delivered to
    #[serde(default)]
    pub queue: QueueConfig,

    /// Inference endpoint target
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Key namespace and processing budget
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Capacity controller policy
    #[serde(default)]
    pub scaling: ScalingPolicy,

    /// Registry credential exchange
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Completion artifact sink
    #[serde(default)]
    pub sink: SinkConfig,

    /// Cloud account and region
    #[serde(default)]
    pub aws: AwsConfig,

    /// Graceful shutdown timeout in seconds (default: 30)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            endpoint: EndpointConfig::default(),
            dispatch: DispatchConfig::default(),
            scaling: ScalingPolicy::default(),
            registry: RegistryConfig::default(),
            sink: SinkConfig::default(),
            aws: AwsConfig::default(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Bucket name (required)
    #[serde(default)]
    pub bucket: String,

    /// URI scheme used when handing input locations to the endpoint (default: "s3")
    #[serde(default = "default_location_scheme")]
    pub location_scheme: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            location_scheme: default_location_scheme(),
        }
    }
}

fn default_location_scheme() -> String {
    "s3".to_string()
}

/// Queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, used to create or look up the queue (default: "whisper-jobs")
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Queue URL; resolved from `name` when absent
    #[serde(default)]
    pub url: Option<String>,

    /// Messages received per poll, 1..=10 (default: 10)
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Long-poll wait in seconds, 0..=20 (default: 20)
    #[serde(default = "default_wait_time")]
    pub wait_time_secs: u32,

    /// Visibility timeout applied when the queue is created (default: 960)
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Pause after a failed receive before polling again (default: 5)
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    /// Pause after an empty short poll (`wait_time_secs = 0`) (default: 1)
    #[serde(default = "default_idle_backoff")]
    pub idle_backoff_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            url: None,
            batch_size: default_batch_size(),
            wait_time_secs: default_wait_time(),
            visibility_timeout_secs: default_visibility_timeout(),
            error_backoff_secs: default_error_backoff(),
            idle_backoff_secs: default_idle_backoff(),
        }
    }
}

fn default_queue_name() -> String {
    "whisper-jobs".to_string()
}

fn default_batch_size() -> u32 {
    10
}

fn default_wait_time() -> u32 {
    20
}

fn default_visibility_timeout() -> u64 {
    960
}

fn default_error_backoff() -> u64 {
    5
}

fn default_idle_backoff() -> u64 {
    1
}

/// Cloud account and region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// Region; falls back to the SDK's default provider chain
    #[serde(default)]
    pub region: Option<String>,

    /// Account id; appended to the registry ids for credential exchange
    #[serde(default)]
    pub account_id: Option<String>,

    /// Custom service endpoint (e.g. a local emulator)
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Values supplied by the environment or the command line that take
/// precedence over the configuration file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bucket: Option<String>,
    pub queue: Option<String>,
    pub queue_url: Option<String>,
    pub endpoint: Option<String>,
    pub variant: Option<String>,
    pub region: Option<String>,
    pub account_id: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from an HCL file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            DispatchError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| DispatchError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Apply environment/CLI overrides in place
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(bucket) = overrides.bucket {
            self.store.bucket = bucket;
        }
        if let Some(queue) = overrides.queue {
            self.queue.name = queue;
        }
        if let Some(url) = overrides.queue_url {
            self.queue.url = Some(url);
        }
        if let Some(endpoint) = overrides.endpoint {
            self.endpoint.name = endpoint;
        }
        if let Some(variant) = overrides.variant {
            self.endpoint.variant = variant;
        }
        if let Some(region) = overrides.region {
            self.aws.region = Some(region);
        }
        if let Some(account_id) = overrides.account_id {
            self.aws.account_id = Some(account_id);
        }
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<()> {
        if self.store.bucket.trim().is_empty() {
            return Err(DispatchError::Config(
                "Store bucket must be set".to_string(),
            ));
        }
        if self.store.location_scheme.trim().is_empty() {
            return Err(DispatchError::Config(
                "Store location_scheme must not be empty".to_string(),
            ));
        }

        if self.queue.name.trim().is_empty() && self.queue.url.is_none() {
            return Err(DispatchError::Config(
                "Queue name or url must be set".to_string(),
            ));
        }
        if !(1..=10).contains(&self.queue.batch_size) {
            return Err(DispatchError::Config(format!(
                "Queue batch_size ({}) must be in 1..=10",
                self.queue.batch_size
            )));
        }
        if self.queue.wait_time_secs > 20 {
            return Err(DispatchError::Config(format!(
                "Queue wait_time_secs ({}) must be <= 20",
                self.queue.wait_time_secs
            )));
        }
        // Short polling without a pause would spin on an empty queue
        if self.queue.wait_time_secs == 0 && self.queue.idle_backoff_secs == 0 {
            return Err(DispatchError::Config(
                "Queue idle_backoff_secs must be >= 1 when wait_time_secs is 0".to_string(),
            ));
        }
        // A message must not become visible again while it is still being handled
        if self.queue.visibility_timeout_secs < self.dispatch.invocation_timeout_secs {
            return Err(DispatchError::Config(format!(
                "Queue visibility_timeout_secs ({}) must be >= dispatch invocation_timeout_secs ({})",
                self.queue.visibility_timeout_secs, self.dispatch.invocation_timeout_secs
            )));
        }

        dispatch::validate_dispatch(&self.endpoint, &self.dispatch, &self.sink)?;
        scaling::validate_scaling(&self.scaling)?;
        registry::validate_registry(&self.registry, self.aws.account_id.as_deref())?;

        Ok(())
    }

    /// Registry ids including the deployment's own account
    pub fn registry_ids(&self) -> Vec<String> {
        self.registry
            .registry_ids_with(self.aws.account_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.store.bucket = "jobs".into();
        config
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert!(config.store.bucket.is_empty());
        assert_eq!(config.store.location_scheme, "s3");
        assert_eq!(config.queue.name, "whisper-jobs");
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.endpoint.name, "WhisperEndpoint");
        assert_eq!(config.shutdown_timeout_secs, 30);
    }

    #[test]
    fn test_default_config_requires_bucket() {
        let err = ServiceConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("bucket"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let hcl = r#"
            store {
                bucket = "audio"
            }
        "#;
        let config = ServiceConfig::from_hcl(hcl).unwrap();
        assert_eq!(config.store.bucket, "audio");
        assert_eq!(config.scaling.max_capacity, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let hcl = r#"
            store {
                bucket          = "audio"
                location_scheme = "s3"
            }
            queue {
                name           = "jobs"
                url            = "https://sqs.ap-northeast-1.amazonaws.com/123456789012/jobs"
                batch_size     = 5
                wait_time_secs = 10
            }
            endpoint {
                name         = "Whisper"
                variant      = "Primary"
                content_type = "audio/wav"
            }
            dispatch {
                invocation_timeout_secs = 120
                retry_failed_messages   = true
            }
            scaling {
                min_capacity           = 0
                max_capacity           = 2
                target_value           = 1.5
                scale_in_cooldown_secs = 600
                statistic              = "max"
            }
            registry {
                registry_ids = ["763104351884"]
                username     = "AWS"
            }
            sink {
                kind        = "webhook"
                webhook_url = "http://127.0.0.1:9000/hook"
            }
            aws {
                region     = "ap-northeast-1"
                account_id = "123456789012"
            }
            shutdown_timeout_secs = 10
        "#;
        let config = ServiceConfig::from_hcl(hcl).unwrap();
        assert_eq!(config.queue.batch_size, 5);
        assert_eq!(config.endpoint.content_type, "audio/wav");
        assert!(config.dispatch.retry_failed_messages);
        assert_eq!(config.scaling.max_capacity, 2);
        assert_eq!(config.scaling.statistic, Statistic::Max);
        assert_eq!(config.sink.kind, SinkKind::Webhook);
        assert_eq!(config.aws.region.as_deref(), Some("ap-northeast-1"));
        assert_eq!(config.shutdown_timeout_secs, 10);
        assert_eq!(config.registry_ids(), vec!["763104351884", "123456789012"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_hcl() {
        let err = ServiceConfig::from_hcl("store {").unwrap_err();
        assert!(err.to_string().contains("Failed to parse HCL"));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = valid_config();
        config.apply_overrides(ConfigOverrides {
            bucket: Some("other".into()),
            queue: Some("q2".into()),
            endpoint: Some("E2".into()),
            account_id: Some("111122223333".into()),
            ..ConfigOverrides::default()
        });
        assert_eq!(config.store.bucket, "other");
        assert_eq!(config.queue.name, "q2");
        assert_eq!(config.endpoint.name, "E2");
        assert_eq!(config.endpoint.variant, "WhisperVariant");
        assert_eq!(config.aws.account_id.as_deref(), Some("111122223333"));
    }

    #[test]
    fn test_validate_batch_size() {
        let mut config = valid_config();
        config.queue.batch_size = 0;
        assert!(config.validate().is_err());
        config.queue.batch_size = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_wait_time() {
        let mut config = valid_config();
        config.queue.wait_time_secs = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_short_poll_needs_idle_backoff() {
        let mut config = valid_config();
        config.queue.wait_time_secs = 0;
        assert!(config.validate().is_ok());
        config.queue.idle_backoff_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("idle_backoff_secs"));
        config.queue.wait_time_secs = 5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_registry_ids_include_account() {
        let mut config = valid_config();
        config.registry.registry_ids = vec!["763104351884".into(), "210987654321".into()];
        assert!(config.validate().is_ok());

        config.aws.account_id = Some("123456789012".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("registry ids"));

        config.aws.account_id = Some("210987654321".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_visibility_shorter_than_budget() {
        let mut config = valid_config();
        config.queue.visibility_timeout_secs = 60;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("visibility_timeout_secs"));
    }

    #[test]
    fn test_validate_nested_scaling_error() {
        let mut config = valid_config();
        config.scaling.min_capacity = 5;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.hcl");
        std::fs::write(&path, "store {\n  bucket = \"from-file\"\n}\n").unwrap();
        let config = ServiceConfig::from_file(&path).await.unwrap();
        assert_eq!(config.store.bucket, "from-file");
    }

    #[tokio::test]
    async fn test_from_missing_file() {
        let err = ServiceConfig::from_file("/nonexistent/dispatch.hcl")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
