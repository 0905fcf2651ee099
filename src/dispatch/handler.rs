//! Dispatch handler — turns store notifications into endpoint submissions
//! and completion artifacts into sink entries
//!
//! The handler holds no job state: every record is processed on its own, and
//! errors are logged with the triggering payload rather than propagated.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{InferenceEndpoint, InvocationRequest, ObjectLocation, ObjectStore, QueueMessage};
use crate::config::{DispatchConfig, EndpointConfig, ServiceConfig};
use crate::dispatch::notification::{parse_envelope, Envelope, JobNotification, KeyClass};
use crate::dispatch::sink::CompletionSink;
use crate::error::{DispatchError, Result};
use crate::observability::{CompletionKind, CompletionLogEntry, DispatchMetrics};

/// What happened to one notification record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outcome {
    /// Input submitted to the endpoint
    Submitted {
        input_location: String,
        inference_id: Option<String>,
    },
    /// Completion artifact fetched and forwarded
    Forwarded {
        kind: CompletionKind,
        key: String,
        size_bytes: u64,
    },
    /// Key outside the job namespace
    Ignored { key: String },
    /// Store test event
    TestEvent,
}

/// Result of handling one queue message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReport {
    pub message_id: String,
    pub outcomes: Vec<Outcome>,
    /// One entry per failed record (or one for an unreadable body)
    pub failures: Vec<String>,
    /// The message exceeded its processing budget
    pub timed_out: bool,
}

impl MessageReport {
    fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            ..Self::default()
        }
    }

    /// Whether the delivery should be removed from the queue.
    ///
    /// Timed-out messages are always redelivered. Messages with failed records
    /// are redelivered only when `retry_failed` is set.
    pub fn should_acknowledge(&self, retry_failed: bool) -> bool {
        if self.timed_out {
            return false;
        }
        !(retry_failed && !self.failures.is_empty())
    }
}

/// A planned action for one record, computed without touching any backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlannedAction {
    Invoke { request: InvocationRequest },
    Fetch { location: ObjectLocation, kind: CompletionKind },
    Ignore { key: String },
    SkipTestEvent,
    Reject { error: String },
}

/// Classify a message body and list what handling it would do
pub fn plan(
    body: &str,
    endpoint: &EndpointConfig,
    dispatch: &DispatchConfig,
    location_scheme: &str,
) -> Result<Vec<PlannedAction>> {
    let records = match parse_envelope(body)? {
        Envelope::TestEvent => return Ok(vec![PlannedAction::SkipTestEvent]),
        Envelope::Records(records) => records,
    };

    Ok(records
        .into_iter()
        .map(|record| match record {
            Err(e) => PlannedAction::Reject {
                error: e.to_string(),
            },
            Ok(n) => match KeyClass::classify(&n.key, dispatch) {
                KeyClass::Input => PlannedAction::Invoke {
                    request: InvocationRequest {
                        endpoint_name: endpoint.name.clone(),
                        input_location: n.location().uri(location_scheme),
                        content_type: endpoint.content_type.clone(),
                    },
                },
                KeyClass::Output => PlannedAction::Fetch {
                    location: n.location(),
                    kind: CompletionKind::Success,
                },
                KeyClass::Failure => PlannedAction::Fetch {
                    location: n.location(),
                    kind: CompletionKind::Failure,
                },
                KeyClass::Unclassified => PlannedAction::Ignore { key: n.key },
            },
        })
        .collect())
}

/// Stateless notification handler
pub struct DispatchHandler {
    store: Arc<dyn ObjectStore>,
    endpoint: Arc<dyn InferenceEndpoint>,
    sink: Arc<dyn CompletionSink>,
    endpoint_config: EndpointConfig,
    dispatch: DispatchConfig,
    location_scheme: String,
    max_body_bytes: usize,
    message_timeout: Duration,
    metrics: Arc<DispatchMetrics>,
}

impl DispatchHandler {
    pub fn new(
        config: &ServiceConfig,
        store: Arc<dyn ObjectStore>,
        endpoint: Arc<dyn InferenceEndpoint>,
        sink: Arc<dyn CompletionSink>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            store,
            endpoint,
            sink,
            endpoint_config: config.endpoint.clone(),
            dispatch: config.dispatch.clone(),
            location_scheme: config.store.location_scheme.clone(),
            max_body_bytes: config.sink.max_body_bytes,
            message_timeout: config.dispatch.invocation_timeout(),
            metrics,
        }
    }

    /// Override the per-message budget
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn dispatch_config(&self) -> &DispatchConfig {
        &self.dispatch
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Handle a received batch concurrently; one report per message, in order
    pub async fn handle_batch(&self, messages: &[QueueMessage]) -> Vec<MessageReport> {
        self.metrics.record_messages_received(messages.len());
        join_all(messages.iter().map(|m| self.handle_within_budget(m))).await
    }

    async fn handle_within_budget(&self, message: &QueueMessage) -> MessageReport {
        match tokio::time::timeout(
            self.message_timeout,
            self.handle_message(&message.message_id, &message.body),
        )
        .await
        {
            Ok(report) => report,
            Err(_) => {
                self.metrics.record_timeout();
                let error = DispatchError::Timeout(format!(
                    "message exceeded {:?} budget",
                    self.message_timeout
                ));
                tracing::error!(
                    message_id = message.message_id,
                    error = %error,
                    payload = message.body,
                    "Message processing timed out, leaving it for redelivery"
                );
                let mut report = MessageReport::new(&message.message_id);
                report.failures.push(error.to_string());
                report.timed_out = true;
                report
            }
        }
    }

    /// Handle one message body. Never fails: errors are logged with the
    /// payload and collected in the report.
    pub async fn handle_message(&self, message_id: &str, body: &str) -> MessageReport {
        let mut report = MessageReport::new(message_id);

        let records = match parse_envelope(body) {
            Ok(Envelope::TestEvent) => {
                self.metrics.record_test_event();
                tracing::info!(message_id, "Skipping store test event");
                report.outcomes.push(Outcome::TestEvent);
                return report;
            }
            Ok(Envelope::Records(records)) => records,
            Err(e) => {
                self.metrics.record_failure();
                tracing::error!(message_id, error = %e, payload = body, "Malformed notification");
                report.failures.push(e.to_string());
                return report;
            }
        };

        let results = join_all(records.into_iter().map(|record| async move {
            match record {
                Ok(notification) => self.handle_notification(&notification).await,
                Err(e) => Err(e),
            }
        }))
        .await;

        for result in results {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    self.metrics.record_failure();
                    tracing::error!(
                        message_id,
                        error = %e,
                        payload = body,
                        "Failed to handle notification record"
                    );
                    report.failures.push(e.to_string());
                }
            }
        }

        report
    }

    /// Route a single notification by its key prefix
    pub async fn handle_notification(&self, notification: &JobNotification) -> Result<Outcome> {
        let class = KeyClass::classify(&notification.key, &self.dispatch);
        self.metrics.record_notification(class);

        match class {
            KeyClass::Input => self.submit(notification).await,
            KeyClass::Output => self.forward(notification, CompletionKind::Success).await,
            KeyClass::Failure => self.forward(notification, CompletionKind::Failure).await,
            KeyClass::Unclassified => {
                tracing::trace!(
                    bucket = notification.bucket,
                    key = notification.key,
                    "Key outside job namespace"
                );
                Ok(Outcome::Ignored {
                    key: notification.key.clone(),
                })
            }
        }
    }

    async fn submit(&self, notification: &JobNotification) -> Result<Outcome> {
        let request = InvocationRequest {
            endpoint_name: self.endpoint_config.name.clone(),
            input_location: notification.location().uri(&self.location_scheme),
            content_type: self.endpoint_config.content_type.clone(),
        };

        let ack = self.endpoint.invoke_async(&request).await?;
        self.metrics.record_invocation();

        tracing::info!(
            endpoint = request.endpoint_name,
            input = request.input_location,
            inference_id = ack.inference_id.as_deref().unwrap_or("-"),
            output = ack.output_location.as_deref().unwrap_or("-"),
            "Submitted inference"
        );

        Ok(Outcome::Submitted {
            input_location: request.input_location,
            inference_id: ack.inference_id,
        })
    }

    async fn forward(&self, notification: &JobNotification, kind: CompletionKind) -> Result<Outcome> {
        let location = notification.location();
        let content = self.store.get_object(&location).await?;
        let entry = CompletionLogEntry::new(&location, kind, &content, self.max_body_bytes);

        self.sink.forward(&entry).await.map_err(|e| {
            DispatchError::Other(format!(
                "Sink '{}' rejected '{}': {}",
                self.sink.name(),
                location,
                e
            ))
        })?;
        self.metrics.record_completion();

        Ok(Outcome::Forwarded {
            kind,
            key: notification.key.clone(),
            size_bytes: entry.size_bytes,
        })
    }
}
