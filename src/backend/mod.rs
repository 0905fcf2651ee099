//! External collaborators — object store, job queue, inference endpoint
//!
//! Every component receives these as `Arc<dyn Trait>` handles at construction
//! time. `memory` provides in-process implementations used by tests and
//! local dry runs; `aws` (feature-gated) talks to the real services.

#[cfg(feature = "aws")]
pub mod aws;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Location of an object in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// URI form handed to the inference endpoint, e.g. `s3://bucket/input/a.wav`
    pub fn uri(&self, scheme: &str) -> String {
        format!("{}://{}/{}", scheme, self.bucket, self.key)
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Durable blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's full body
    async fn get_object(&self, location: &ObjectLocation) -> Result<Bytes>;

    /// Store name (for logging)
    fn name(&self) -> &str;
}

/// A message received from the job queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned message id
    pub message_id: String,
    /// Handle used to acknowledge (delete) this delivery
    pub receipt_handle: String,
    /// Raw body, a store notification document
    pub body: String,
}

/// At-least-once delivery queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Receive up to `max_messages`, long-polling for at most `wait_time_secs`
    async fn receive(&self, max_messages: u32, wait_time_secs: u32) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a delivery so it is not redelivered
    async fn acknowledge(&self, message: &QueueMessage) -> Result<()>;

    /// Queue name (for logging)
    fn name(&self) -> &str;
}

/// Asynchronous inference submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InvocationRequest {
    pub endpoint_name: String,
    pub input_location: String,
    pub content_type: String,
}

/// Acceptance acknowledgment returned by the endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationAck {
    /// Endpoint-assigned id; logged only, never tracked
    pub inference_id: Option<String>,
    /// Where the endpoint says it will write the result
    pub output_location: Option<String>,
}

/// Managed inference endpoint accepting asynchronous submissions
#[async_trait]
pub trait InferenceEndpoint: Send + Sync {
    /// Submit one input; returns once the endpoint has accepted it
    async fn invoke_async(&self, request: &InvocationRequest) -> Result<InvocationAck>;

    /// Endpoint client name (for logging)
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_uri() {
        let loc = ObjectLocation::new("B", "input/a.wav");
        assert_eq!(loc.uri("s3"), "s3://B/input/a.wav");
        assert_eq!(loc.uri("store"), "store://B/input/a.wav");
        assert_eq!(loc.to_string(), "B/input/a.wav");
    }

    #[test]
    fn test_invocation_request_wire_names() {
        let req = InvocationRequest {
            endpoint_name: "E".into(),
            input_location: "s3://B/input/a.wav".into(),
            content_type: "audio/x-audio".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["EndpointName"], "E");
        assert_eq!(json["InputLocation"], "s3://B/input/a.wav");
        assert_eq!(json["ContentType"], "audio/x-audio");
    }

    #[test]
    fn test_traits_are_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ObjectStore>();
        assert_send_sync::<dyn JobQueue>();
        assert_send_sync::<dyn InferenceEndpoint>();
    }
}
