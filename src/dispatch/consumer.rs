//! Queue consumer — receive, dispatch, acknowledge

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::backend::JobQueue;
use crate::config::QueueConfig;
use crate::dispatch::handler::{DispatchHandler, MessageReport};
use crate::error::Result;

/// Summary of one poll
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub acknowledged: usize,
    /// Left on the queue for redelivery (timed out, retried, or failed ack)
    pub retained: usize,
}

/// Long-polls the job queue and feeds batches to the handler
pub struct QueueConsumer {
    queue: Arc<dyn JobQueue>,
    handler: Arc<DispatchHandler>,
    batch_size: u32,
    wait_time_secs: u32,
    error_backoff: Duration,
    idle_backoff: Duration,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<DispatchHandler>, config: &QueueConfig) -> Self {
        Self {
            queue,
            handler,
            batch_size: config.batch_size,
            wait_time_secs: config.wait_time_secs,
            error_backoff: Duration::from_secs(config.error_backoff_secs),
            idle_backoff: Duration::from_secs(config.idle_backoff_secs),
        }
    }

    /// Receive one batch, handle it, and acknowledge what should not be redelivered
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let messages = self
            .queue
            .receive(self.batch_size, self.wait_time_secs)
            .await?;
        if messages.is_empty() {
            return Ok(PollSummary::default());
        }

        tracing::debug!(queue = self.queue.name(), count = messages.len(), "Received batch");

        let reports = self.handler.handle_batch(&messages).await;
        let retry_failed = self.handler.dispatch_config().retry_failed_messages;

        let mut summary = PollSummary {
            received: messages.len(),
            ..PollSummary::default()
        };

        for (message, report) in messages.iter().zip(reports.iter()) {
            if !report.should_acknowledge(retry_failed) {
                log_retained(report);
                summary.retained += 1;
                continue;
            }
            match self.queue.acknowledge(message).await {
                Ok(()) => {
                    self.handler.metrics().record_acknowledged();
                    summary.acknowledged += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        queue = self.queue.name(),
                        message_id = message.message_id,
                        error = %e,
                        "Failed to acknowledge message"
                    );
                    summary.retained += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Poll until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            queue = self.queue.name(),
            batch_size = self.batch_size,
            wait_time_secs = self.wait_time_secs,
            "Queue consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = tokio::select! {
                result = self.poll_once() => match result {
                    Ok(summary) if summary.received == 0 && self.wait_time_secs == 0 => {
                        Some(self.idle_backoff)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(
                            queue = self.queue.name(),
                            error = %e,
                            backoff_secs = self.error_backoff.as_secs(),
                            "Failed to receive from queue"
                        );
                        Some(self.error_backoff)
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    None
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(queue = self.queue.name(), "Queue consumer stopped");
    }
}

fn log_retained(report: &MessageReport) {
    tracing::warn!(
        message_id = report.message_id,
        timed_out = report.timed_out,
        failures = report.failures.len(),
        "Leaving message for redelivery"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryQueue, MemoryStore, RecordingEndpoint};
    use crate::config::ServiceConfig;
    use crate::dispatch::notification::StoreEvent;
    use crate::dispatch::sink::MemorySink;
    use crate::backend::QueueMessage;
    use crate::observability::DispatchMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts `receive` calls on the wrapped queue
    struct CountingQueue {
        inner: MemoryQueue,
        receives: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for CountingQueue {
        async fn receive(&self, max_messages: u32, wait_time_secs: u32) -> Result<Vec<QueueMessage>> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            self.inner.receive(max_messages, wait_time_secs).await
        }

        async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
            self.inner.acknowledge(message).await
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn consumer(config: &ServiceConfig) -> (QueueConsumer, Arc<MemoryQueue>, Arc<RecordingEndpoint>) {
        let queue = Arc::new(MemoryQueue::new("q"));
        let endpoint = Arc::new(RecordingEndpoint::new());
        let handler = Arc::new(DispatchHandler::new(
            config,
            Arc::new(MemoryStore::new()),
            endpoint.clone(),
            Arc::new(MemorySink::new()),
            Arc::new(DispatchMetrics::new()),
        ));
        (
            QueueConsumer::new(queue.clone(), handler, &config.queue),
            queue,
            endpoint,
        )
    }

    fn input_body(key: &str) -> String {
        StoreEvent::object_created("B", key, None).to_body()
    }

    #[tokio::test]
    async fn test_poll_empty_queue() {
        let mut config = ServiceConfig::default();
        config.queue.wait_time_secs = 0;
        let (consumer, _, _) = consumer(&config);
        assert_eq!(consumer.poll_once().await.unwrap(), PollSummary::default());
    }

    #[tokio::test]
    async fn test_poll_acknowledges_handled_messages() {
        let (consumer, queue, endpoint) = consumer(&ServiceConfig::default());
        queue.push_body(input_body("input/a.wav"));
        queue.push_body("garbage");

        let summary = consumer.poll_once().await.unwrap();
        assert_eq!(summary.received, 2);
        assert_eq!(summary.acknowledged, 2);
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(endpoint.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_retains_failed_when_retrying() {
        let mut config = ServiceConfig::default();
        config.dispatch.retry_failed_messages = true;
        let (consumer, queue, endpoint) = consumer(&config);
        endpoint.set_failing(true);
        queue.push_body(input_body("input/a.wav"));
        queue.push_body(input_body("other/b.wav"));

        let summary = consumer.poll_once().await.unwrap();
        assert_eq!(summary.acknowledged, 1);
        assert_eq!(summary.retained, 1);
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[tokio::test]
    async fn test_poll_respects_batch_size() {
        let mut config = ServiceConfig::default();
        config.queue.batch_size = 2;
        let (consumer, queue, _) = consumer(&config);
        for i in 0..5 {
            queue.push_body(input_body(&format!("input/{}.wav", i)));
        }
        assert_eq!(consumer.poll_once().await.unwrap().received, 2);
        assert_eq!(queue.pending_len(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (consumer, queue, endpoint) = consumer(&ServiceConfig::default());
        queue.push_body(input_body("input/a.wav"));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(rx));

        for _ in 0..50 {
            if !queue.acknowledged().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(endpoint.invocations().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_short_poll_pauses_on_empty_queue() {
        let mut config = ServiceConfig::default();
        config.store.bucket = "B".into();
        config.queue.wait_time_secs = 0;
        config.queue.idle_backoff_secs = 1;
        assert!(config.validate().is_ok());

        let queue = Arc::new(CountingQueue {
            inner: MemoryQueue::new("q"),
            receives: AtomicUsize::new(0),
        });
        let handler = Arc::new(DispatchHandler::new(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingEndpoint::new()),
            Arc::new(MemorySink::new()),
            Arc::new(DispatchMetrics::new()),
        ));
        let consumer = QueueConsumer::new(queue.clone(), handler, &config.queue);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(rx));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let receives = queue.receives.load(Ordering::SeqCst);
        assert!((1..=2).contains(&receives), "receive called {} times", receives);

        // shutdown interrupts the idle pause
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
