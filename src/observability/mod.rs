//! Observability — completion logging and metrics
//!
//! Provides the structured completion log and Prometheus-compatible
//! dispatch and scaling metrics.

pub mod completion_log;
pub mod metrics;

pub use completion_log::{CompletionKind, CompletionLog, CompletionLogEntry};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
