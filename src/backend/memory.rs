//! In-process backends for tests and local dry runs
//!
//! `MemoryStore` emits creation notifications into a `MemoryQueue` once the
//! `MemoryProvisioner` has wired them, so the full
//! store → queue → handler → endpoint → store cycle can run without a cloud.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

use super::{
    InferenceEndpoint, InvocationAck, InvocationRequest, JobQueue, ObjectLocation, ObjectStore,
    QueueMessage,
};
use crate::bootstrap::{NotificationRule, Provisioner, QueueBinding};
use crate::dispatch::notification::StoreEvent;
use crate::error::{DispatchError, Result};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Object store backed by a map, with optional creation notifications
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectLocation, Bytes>>,
    rules: RwLock<HashMap<String, Vec<NotificationRule>>>,
    target: RwLock<Option<Arc<MemoryQueue>>>,
    fetches: Mutex<Vec<ObjectLocation>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            rules: RwLock::new(HashMap::new()),
            target: RwLock::new(None),
            fetches: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Write an object; notifies the wired queue if a rule matches the key
    pub fn put_object(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let body = body.into();
        let size = body.len() as u64;
        self.objects
            .write()
            .unwrap()
            .insert(ObjectLocation::new(bucket, key), body);

        let matched = self
            .rules
            .read()
            .unwrap()
            .get(bucket)
            .is_some_and(|rules| rules.iter().any(|r| key.starts_with(&r.prefix)));
        if matched {
            if let Some(queue) = self.target.read().unwrap().as_ref() {
                queue.push_body(StoreEvent::object_created(bucket, key, Some(size)).to_body());
            }
        }
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .read()
            .unwrap()
            .contains_key(&ObjectLocation::new(bucket, key))
    }

    /// Every `get_object` call, in order
    pub fn fetches(&self) -> Vec<ObjectLocation> {
        self.fetches.lock().unwrap().clone()
    }

    /// Make every subsequent `get_object` fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Installed notification rules for a bucket
    pub fn notification_rules(&self, bucket: &str) -> Vec<NotificationRule> {
        self.rules
            .read()
            .unwrap()
            .get(bucket)
            .cloned()
            .unwrap_or_default()
    }

    fn wire(&self, bucket: &str, queue: Arc<MemoryQueue>, rules: &[NotificationRule]) {
        self.rules
            .write()
            .unwrap()
            .insert(bucket.to_string(), rules.to_vec());
        *self.target.write().unwrap() = Some(queue);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get_object(&self, location: &ObjectLocation) -> Result<Bytes> {
        self.fetches.lock().unwrap().push(location.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Store(format!(
                "simulated failure fetching '{}'",
                location
            )));
        }
        self.objects
            .read()
            .unwrap()
            .get(location)
            .cloned()
            .ok_or_else(|| DispatchError::Store(format!("NoSuchKey: '{}'", location)))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

/// FIFO queue with explicit visibility: received messages stay in flight
/// until acknowledged or returned with [`MemoryQueue::expire_in_flight`]
pub struct MemoryQueue {
    name: String,
    next_id: AtomicU64,
    pending: Mutex<VecDeque<QueueMessage>>,
    in_flight: Mutex<HashMap<String, QueueMessage>>,
    acknowledged: Mutex<Vec<String>>,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            acknowledged: Mutex::new(Vec::new()),
            arrivals: Notify::new(),
        }
    }

    /// Enqueue a raw body; returns the message id
    pub fn push_body(&self, body: impl Into<String>) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = QueueMessage {
            message_id: format!("msg-{}", n),
            receipt_handle: receipt_handle(),
            body: body.into(),
        };
        let id = message.message_id.clone();
        self.pending.lock().unwrap().push_back(message);
        self.arrivals.notify_one();
        id
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Ids of acknowledged messages, in order
    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    /// Return every unacknowledged in-flight message to the queue, as if its
    /// visibility timeout had expired. Redeliveries get a fresh receipt handle.
    pub fn expire_in_flight(&self) -> usize {
        let expired: Vec<QueueMessage> = self.in_flight.lock().unwrap().drain().map(|(_, m)| m).collect();
        let count = expired.len();
        let mut pending = self.pending.lock().unwrap();
        for mut message in expired {
            message.receipt_handle = receipt_handle();
            pending.push_back(message);
        }
        drop(pending);
        if count > 0 {
            self.arrivals.notify_one();
        }
        count
    }
}

/// Opaque, unique per delivery
fn receipt_handle() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn receive(&self, max_messages: u32, wait_time_secs: u32) -> Result<Vec<QueueMessage>> {
        // long poll: wait for an arrival when nothing is pending
        let empty = self.pending.lock().unwrap().is_empty();
        if empty && wait_time_secs > 0 {
            let _ = tokio::time::timeout(
                Duration::from_secs(wait_time_secs as u64),
                self.arrivals.notified(),
            )
            .await;
        }

        let mut pending = self.pending.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();
        let take = (max_messages as usize).min(pending.len());
        let batch: Vec<QueueMessage> = pending.drain(..take).collect();
        for message in &batch {
            in_flight.insert(message.receipt_handle.clone(), message.clone());
        }
        Ok(batch)
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
        let removed = self
            .in_flight
            .lock()
            .unwrap()
            .remove(&message.receipt_handle);
        match removed {
            Some(m) => {
                self.acknowledged.lock().unwrap().push(m.message_id);
                Ok(())
            }
            None => Err(DispatchError::Queue(format!(
                "receipt handle '{}' is not in flight",
                message.receipt_handle
            ))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// RecordingEndpoint
// ---------------------------------------------------------------------------

/// Inference endpoint that records submissions and can later "complete" them
/// by writing result objects into a [`MemoryStore`]
pub struct RecordingEndpoint {
    invocations: Mutex<Vec<InvocationRequest>>,
    completed: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingEndpoint {
    pub fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Hold every submission for `delay` before accepting it
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn invocations(&self) -> Vec<InvocationRequest> {
        self.invocations.lock().unwrap().clone()
    }

    /// Make every subsequent submission fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write a result for every submission not yet completed. The result key
    /// is `<prefix><input file name>.out.json`.
    pub fn complete_pending(&self, store: &MemoryStore, prefix: &str) -> usize {
        let invocations = self.invocations.lock().unwrap();
        let start = self.completed.swap(invocations.len(), Ordering::SeqCst);
        let mut written = 0;
        for request in invocations.iter().skip(start) {
            let Some((bucket, key)) = split_location(&request.input_location) else {
                continue;
            };
            let file_name = key.rsplit('/').next().unwrap_or(key);
            let body = serde_json::json!({ "text": format!("transcript of {}", file_name) });
            store.put_object(
                bucket,
                &format!("{}{}.out.json", prefix, file_name),
                body.to_string(),
            );
            written += 1;
        }
        written
    }
}

impl Default for RecordingEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `scheme://bucket/key` into `(bucket, key)`
fn split_location(uri: &str) -> Option<(&str, &str)> {
    let (_, rest) = uri.split_once("://")?;
    rest.split_once('/')
}

#[async_trait]
impl InferenceEndpoint for RecordingEndpoint {
    async fn invoke_async(&self, request: &InvocationRequest) -> Result<InvocationAck> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::Endpoint(format!(
                "simulated failure invoking '{}'",
                request.endpoint_name
            )));
        }
        let mut invocations = self.invocations.lock().unwrap();
        invocations.push(request.clone());
        Ok(InvocationAck {
            inference_id: Some(format!("inference-{}", invocations.len())),
            output_location: None,
        })
    }

    fn name(&self) -> &str {
        "recording"
    }
}

// ---------------------------------------------------------------------------
// MemoryProvisioner
// ---------------------------------------------------------------------------

/// Provisioner that wires a [`MemoryStore`] to a [`MemoryQueue`]
pub struct MemoryProvisioner {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    queues: Mutex<HashMap<String, QueueBinding>>,
}

impl MemoryProvisioner {
    pub fn new(store: Arc<MemoryStore>, queue: Arc<MemoryQueue>) -> Self {
        Self {
            store,
            queue,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct queues created so far
    pub fn queues_created(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

#[async_trait]
impl Provisioner for MemoryProvisioner {
    async fn ensure_queue(
        &self,
        name: &str,
        _visibility_timeout_secs: u64,
        _bucket: &str,
    ) -> Result<QueueBinding> {
        let mut queues = self.queues.lock().unwrap();
        let binding = queues
            .entry(name.to_string())
            .or_insert_with(|| QueueBinding {
                url: format!("memory://{}", name),
                arn: format!("arn:memory:queue:{}", name),
            });
        Ok(binding.clone())
    }

    async fn ensure_notifications(
        &self,
        bucket: &str,
        _queue: &QueueBinding,
        rules: &[NotificationRule],
    ) -> Result<()> {
        self.store.wire(bucket, self.queue.clone(), rules);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
