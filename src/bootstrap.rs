//! Bootstrap — idempotent wiring of store notifications to the job queue
//!
//! Creates (or looks up) the queue, allows the bucket to publish to it, and
//! installs one object-created notification rule per job prefix. Every step
//! converges on the same end state when re-run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::error::{DispatchError, Result};

/// Store event pattern that triggers a notification
pub const OBJECT_CREATED_EVENTS: &str = "s3:ObjectCreated:*";

/// One notification rule: objects created under `prefix` are sent to the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    /// Stable rule id, so re-applying replaces instead of duplicating
    pub id: String,
    /// Key prefix filter
    pub prefix: String,
    /// Store event patterns
    pub events: Vec<String>,
}

/// A provisioned queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBinding {
    pub url: String,
    pub arn: String,
}

/// Desired resource graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub bucket: String,
    pub queue_name: String,
    pub visibility_timeout_secs: u64,
    pub rules: Vec<NotificationRule>,
}

impl Topology {
    /// Derive the topology from configuration: one rule per job prefix
    pub fn from_config(config: &ServiceConfig) -> Self {
        let rules = [
            ("input", &config.dispatch.input_prefix),
            ("output", &config.dispatch.output_prefix),
            ("failure", &config.dispatch.failure_prefix),
        ]
        .into_iter()
        .map(|(class, prefix)| NotificationRule {
            id: format!("{}-{}", config.queue.name, class),
            prefix: prefix.clone(),
            events: vec![OBJECT_CREATED_EVENTS.to_string()],
        })
        .collect();

        Self {
            bucket: config.store.bucket.clone(),
            queue_name: config.queue.name.clone(),
            visibility_timeout_secs: config.queue.visibility_timeout_secs,
            rules,
        }
    }
}

/// Creates and wires cloud resources
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the queue if missing and allow `bucket` to publish to it
    async fn ensure_queue(
        &self,
        name: &str,
        visibility_timeout_secs: u64,
        bucket: &str,
    ) -> Result<QueueBinding>;

    /// Replace the bucket's queue notification rules with `rules`
    async fn ensure_notifications(
        &self,
        bucket: &str,
        queue: &QueueBinding,
        rules: &[NotificationRule],
    ) -> Result<()>;

    /// Provisioner name (for logging)
    fn name(&self) -> &str;
}

/// Outcome of a bootstrap run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub queue: QueueBinding,
    pub rules: Vec<NotificationRule>,
}

/// Applies a [`Topology`] through a [`Provisioner`]
pub struct Bootstrap {
    provisioner: Arc<dyn Provisioner>,
}

impl Bootstrap {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }

    /// Apply the topology. Safe to re-run.
    pub async fn apply(&self, topology: &Topology) -> Result<BootstrapReport> {
        if topology.bucket.is_empty() {
            return Err(DispatchError::Config(
                "Bootstrap requires a bucket".to_string(),
            ));
        }

        tracing::info!(
            provisioner = self.provisioner.name(),
            bucket = topology.bucket,
            queue = topology.queue_name,
            "Bootstrapping notification wiring"
        );

        let queue = self
            .provisioner
            .ensure_queue(
                &topology.queue_name,
                topology.visibility_timeout_secs,
                &topology.bucket,
            )
            .await?;
        tracing::info!(url = queue.url, arn = queue.arn, "Queue ready");

        self.provisioner
            .ensure_notifications(&topology.bucket, &queue, &topology.rules)
            .await?;
        for rule in &topology.rules {
            tracing::info!(id = rule.id, prefix = rule.prefix, "Notification rule installed");
        }

        Ok(BootstrapReport {
            queue,
            rules: topology.rules.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryProvisioner, MemoryQueue, MemoryStore};

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.store.bucket = "B".into();
        config
    }

    #[test]
    fn test_topology_from_config() {
        let topology = Topology::from_config(&config());
        assert_eq!(topology.bucket, "B");
        assert_eq!(topology.queue_name, "whisper-jobs");
        let prefixes: Vec<&str> = topology.rules.iter().map(|r| r.prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["input/", "output/", "failure/"]);
        assert_eq!(topology.rules[0].id, "whisper-jobs-input");
        assert!(topology
            .rules
            .iter()
            .all(|r| r.events == vec![OBJECT_CREATED_EVENTS.to_string()]));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new("whisper-jobs"));
        let provisioner = Arc::new(MemoryProvisioner::new(store.clone(), queue));
        let bootstrap = Bootstrap::new(provisioner.clone());
        let topology = Topology::from_config(&config());

        let first = bootstrap.apply(&topology).await.unwrap();
        let second = bootstrap.apply(&topology).await.unwrap();

        assert_eq!(first.queue, second.queue);
        assert_eq!(store.notification_rules("B").len(), 3);
        assert_eq!(provisioner.queues_created(), 1);
    }

    #[tokio::test]
    async fn test_apply_requires_bucket() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new("q"));
        let bootstrap = Bootstrap::new(Arc::new(MemoryProvisioner::new(store, queue)));
        let topology = Topology::from_config(&ServiceConfig::default());
        assert!(bootstrap.apply(&topology).await.is_err());
    }
}
