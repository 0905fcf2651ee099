//! Dispatch — notification parsing, routing, completion sinks, and the queue consumer

pub mod consumer;
pub mod handler;
pub mod notification;
pub mod sink;

pub use consumer::{PollSummary, QueueConsumer};
pub use handler::{plan, DispatchHandler, MessageReport, Outcome, PlannedAction};
pub use notification::{parse_envelope, Envelope, JobNotification, KeyClass, StoreEvent};
pub use sink::{build_sink, CompletionSink, LogSink, MemorySink, WebhookSink};
