//! Dispatch metrics — lightweight counters and gauges
//!
//! Provides in-process metrics tracking without external dependencies.
//! Metrics can be exported as JSON or rendered as Prometheus text format.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::dispatch::notification::KeyClass;

/// Point-in-time view of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Queue messages received
    pub messages_received: u64,
    /// Queue messages acknowledged
    pub messages_acknowledged: u64,
    /// Messages that exceeded their processing budget
    pub message_timeouts: u64,
    /// Notification records by key class
    pub notifications: HashMap<String, u64>,
    /// Inference submissions accepted by the endpoint
    pub invocations_submitted: u64,
    /// Completion artifacts forwarded to the sink
    pub completions_forwarded: u64,
    /// Store test events skipped
    pub test_events: u64,
    /// Failed records or messages (parse, store, endpoint, sink)
    pub failures: u64,
    /// Scale-out actions applied
    pub scale_outs: u64,
    /// Scale-in actions applied
    pub scale_ins: u64,
    /// Skipped scaling cycles (metric or capacity API failures)
    pub scaling_errors: u64,
    /// Capacity last committed by the controller
    pub desired_capacity: u64,
    /// Most recent backlog sample
    pub last_backlog: f64,
}

/// Dispatch metrics collector
pub struct DispatchMetrics {
    messages_received: AtomicU64,
    messages_acknowledged: AtomicU64,
    message_timeouts: AtomicU64,
    notifications: Arc<RwLock<HashMap<String, u64>>>,
    invocations_submitted: AtomicU64,
    completions_forwarded: AtomicU64,
    test_events: AtomicU64,
    failures: AtomicU64,
    scale_outs: AtomicU64,
    scale_ins: AtomicU64,
    scaling_errors: AtomicU64,
    desired_capacity: AtomicU64,
    /// f64 bits
    last_backlog: AtomicU64,
}

impl DispatchMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_acknowledged: AtomicU64::new(0),
            message_timeouts: AtomicU64::new(0),
            notifications: Arc::new(RwLock::new(HashMap::new())),
            invocations_submitted: AtomicU64::new(0),
            completions_forwarded: AtomicU64::new(0),
            test_events: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            scale_outs: AtomicU64::new(0),
            scale_ins: AtomicU64::new(0),
            scaling_errors: AtomicU64::new(0),
            desired_capacity: AtomicU64::new(0),
            last_backlog: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn record_messages_received(&self, count: usize) {
        self.messages_received
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_acknowledged(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.message_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a parsed notification record by its key class
    pub fn record_notification(&self, class: KeyClass) {
        let mut map = self.notifications.write().unwrap();
        *map.entry(class.to_string()).or_insert(0) += 1;
    }

    pub fn record_invocation(&self) {
        self.invocations_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_test_event(&self) {
        self.test_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an applied capacity change
    pub fn record_scale(&self, from: u32, to: u32) {
        if to > from {
            self.scale_outs.fetch_add(1, Ordering::Relaxed);
        } else if to < from {
            self.scale_ins.fetch_add(1, Ordering::Relaxed);
        }
        self.set_desired_capacity(to);
    }

    pub fn record_scaling_error(&self) {
        self.scaling_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_desired_capacity(&self, capacity: u32) {
        self.desired_capacity
            .store(capacity as u64, Ordering::Relaxed);
    }

    pub fn set_last_backlog(&self, value: f64) {
        self.last_backlog.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Get total invocations submitted
    pub fn invocations_submitted(&self) -> u64 {
        self.invocations_submitted.load(Ordering::Relaxed)
    }

    /// Get total failures
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
            message_timeouts: self.message_timeouts.load(Ordering::Relaxed),
            notifications: self.notifications.read().unwrap().clone(),
            invocations_submitted: self.invocations_submitted.load(Ordering::Relaxed),
            completions_forwarded: self.completions_forwarded.load(Ordering::Relaxed),
            test_events: self.test_events.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            scale_outs: self.scale_outs.load(Ordering::Relaxed),
            scale_ins: self.scale_ins.load(Ordering::Relaxed),
            scaling_errors: self.scaling_errors.load(Ordering::Relaxed),
            desired_capacity: self.desired_capacity.load(Ordering::Relaxed),
            last_backlog: f64::from_bits(self.last_backlog.load(Ordering::Relaxed)),
        }
    }

    /// Render metrics in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut output = String::new();

        let counters = [
            ("dispatch_messages_received_total", "Queue messages received", snap.messages_received),
            ("dispatch_messages_acknowledged_total", "Queue messages acknowledged", snap.messages_acknowledged),
            ("dispatch_message_timeouts_total", "Messages that exceeded their budget", snap.message_timeouts),
            ("dispatch_invocations_total", "Inference submissions accepted", snap.invocations_submitted),
            ("dispatch_completions_total", "Completion artifacts forwarded", snap.completions_forwarded),
            ("dispatch_test_events_total", "Store test events skipped", snap.test_events),
            ("dispatch_failures_total", "Failed records or messages", snap.failures),
            ("scaling_scale_outs_total", "Scale-out actions applied", snap.scale_outs),
            ("scaling_scale_ins_total", "Scale-in actions applied", snap.scale_ins),
            ("scaling_errors_total", "Skipped scaling cycles", snap.scaling_errors),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        if !snap.notifications.is_empty() {
            output.push_str("# HELP dispatch_notifications_total Notification records by key class\n");
            output.push_str("# TYPE dispatch_notifications_total counter\n");
            let mut classes: Vec<_> = snap.notifications.iter().collect();
            classes.sort();
            for (class, count) in classes {
                output.push_str(&format!(
                    "dispatch_notifications_total{{class=\"{}\"}} {}\n",
                    class, count
                ));
            }
        }

        output.push_str("# HELP scaling_desired_capacity Capacity last committed by the controller\n");
        output.push_str("# TYPE scaling_desired_capacity gauge\n");
        output.push_str(&format!("scaling_desired_capacity {}\n", snap.desired_capacity));

        output.push_str("# HELP scaling_backlog_per_instance Most recent backlog sample\n");
        output.push_str("# TYPE scaling_backlog_per_instance gauge\n");
        output.push_str(&format!("scaling_backlog_per_instance {}\n", snap.last_backlog));

        output
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}
