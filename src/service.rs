//! Service orchestrator — runs the queue consumer and the scaling controller
//!
//! Ties together configuration, backends, the dispatch handler, the scaling
//! controller, and metrics into a single manageable unit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::backend::{InferenceEndpoint, JobQueue, ObjectStore};
use crate::config::ServiceConfig;
use crate::dispatch::{CompletionSink, DispatchHandler, QueueConsumer};
use crate::error::{DispatchError, Result};
use crate::observability::DispatchMetrics;
use crate::scaling::{BacklogSource, CapacityExecutor, ScalingController, ScalingTarget};
use crate::{HealthStatus, ServiceState};

/// Interval between Prometheus textfile exports
const METRICS_EXPORT_INTERVAL: Duration = Duration::from_secs(15);

/// External collaborators the service runs against
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn JobQueue>,
    pub endpoint: Arc<dyn InferenceEndpoint>,
    pub backlog: Arc<dyn BacklogSource>,
    pub executor: Arc<dyn CapacityExecutor>,
    pub sink: Arc<dyn CompletionSink>,
}

#[cfg(feature = "aws")]
impl Backends {
    /// Build AWS-backed collaborators from configuration
    pub async fn aws(config: &ServiceConfig) -> Result<Self> {
        use crate::backend::aws;

        let sdk = aws::load_sdk_config(&config.aws).await;
        let queue_url = match &config.queue.url {
            Some(url) => url.clone(),
            None => aws::SqsQueue::resolve_url(&sdk, &config.queue.name).await?,
        };

        Ok(Self {
            store: Arc::new(aws::S3Store::new(&sdk)),
            queue: Arc::new(aws::SqsQueue::new(&sdk, queue_url)),
            endpoint: Arc::new(aws::SageMakerEndpoint::new(&sdk)),
            backlog: Arc::new(aws::CloudWatchBacklogSource::new(&sdk)),
            executor: Arc::new(aws::SageMakerCapacityExecutor::new(&sdk)),
            sink: crate::dispatch::build_sink(&config.sink)?,
        })
    }
}

/// Runs the queue consumer and the scaling controller as one unit
pub struct DispatchService {
    config: ServiceConfig,
    backends: Backends,
    /// Service runtime state
    state: Arc<RwLock<ServiceState>>,
    start_time: Instant,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    metrics: Arc<DispatchMetrics>,
    metrics_file: Option<PathBuf>,
    /// Active task handles
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl DispatchService {
    /// Create a new service from configuration and backends
    pub fn new(config: ServiceConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            backends,
            state: Arc::new(RwLock::new(ServiceState::Created)),
            start_time: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            metrics: Arc::new(DispatchMetrics::new()),
            metrics_file: None,
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Periodically write Prometheus text metrics to `path`
    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }

    /// Start the queue consumer and, if enabled, the scaling controller
    ///
    /// A service starts at most once; later calls fail without spawning tasks.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if *state != ServiceState::Created {
                return Err(DispatchError::Other(format!(
                    "Service cannot start from state '{}'",
                    state
                )));
            }
            tracing::debug!(from = %*state, to = %ServiceState::Starting, "State transition");
            *state = ServiceState::Starting;
        }

        let handler = Arc::new(DispatchHandler::new(
            &self.config,
            self.backends.store.clone(),
            self.backends.endpoint.clone(),
            self.backends.sink.clone(),
            self.metrics.clone(),
        ));
        let consumer = QueueConsumer::new(self.backends.queue.clone(), handler, &self.config.queue);

        let mut new_handles = vec![tokio::spawn(consumer.run(self.shutdown_tx.subscribe()))];

        if self.config.scaling.enabled {
            let controller = ScalingController::new(
                self.config.scaling.clone(),
                ScalingTarget::new(&self.config.endpoint.name, &self.config.endpoint.variant),
                self.backends.backlog.clone(),
                self.backends.executor.clone(),
                self.metrics.clone(),
            );
            new_handles.push(tokio::spawn(controller.run(self.shutdown_tx.subscribe())));
        } else {
            tracing::info!("Scaling controller disabled");
        }

        if let Some(path) = &self.metrics_file {
            new_handles.push(tokio::spawn(export_metrics(
                path.clone(),
                self.metrics.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        tracing::info!(
            tasks = new_handles.len(),
            bucket = self.config.store.bucket,
            endpoint = self.config.endpoint.name,
            "Service tasks started"
        );
        *self.handles.write().unwrap() = new_handles;

        self.set_state(ServiceState::Running);
        tracing::info!("Service is running");
        Ok(())
    }

    /// Initiate graceful shutdown: signal tasks, wait up to the configured
    /// timeout, then abort what is left
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return; // Already shutting down
        }

        self.set_state(ServiceState::Stopping);
        tracing::info!("Service shutting down");

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = self.handles.write().unwrap().drain(..).collect();
        let deadline = Duration::from_secs(self.config.shutdown_timeout_secs);
        for mut handle in handles {
            if tokio::time::timeout(deadline, &mut handle).await.is_err() {
                tracing::warn!("Task did not stop in time, aborting");
                handle.abort();
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            received = snapshot.messages_received,
            invocations = snapshot.invocations_submitted,
            completions = snapshot.completions_forwarded,
            failures = snapshot.failures,
            "Service stopped"
        );
        self.set_state(ServiceState::Stopped);
    }

    /// Wait for a shutdown signal (Ctrl+C)
    pub async fn wait_for_shutdown(&self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
        }
        self.shutdown().await;
    }

    /// Get the current service state
    pub fn state(&self) -> ServiceState {
        self.state.read().unwrap().clone()
    }

    /// Get a health status snapshot
    pub fn health(&self) -> HealthStatus {
        let snapshot = self.metrics.snapshot();
        HealthStatus {
            state: self.state(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            messages_received: snapshot.messages_received,
            desired_capacity: snapshot.desired_capacity as u32,
        }
    }

    /// Get the metrics collector
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn set_state(&self, new_state: ServiceState) {
        let mut state = self.state.write().unwrap();
        tracing::debug!(from = %*state, to = %new_state, "State transition");
        *state = new_state;
    }
}

async fn export_metrics(
    path: PathBuf,
    metrics: Arc<DispatchMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(METRICS_EXPORT_INTERVAL);
    loop {
        let stopping = tokio::select! {
            _ = interval.tick() => false,
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        };
        // write a final snapshot on the way out
        if let Err(e) = tokio::fs::write(&path, metrics.render_prometheus()).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to write metrics file");
        }
        if stopping {
            break;
        }
    }
}
