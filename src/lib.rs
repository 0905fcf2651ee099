//! # Whisper Dispatch
//!
//! Event-driven dispatch for asynchronous audio transcription with a
//! backlog-driven, scale-to-zero inference endpoint.
//!
//! ## Architecture
//!
//! ```text
//! Store (input/) → Queue → Dispatch Handler → Inference Endpoint (async)
//!                                                   │
//! Store (output/, failure/) ← ──────────────────────┘
//!        │
//!        └→ Queue → Dispatch Handler → Completion Sink
//!
//! Backlog Metric → Scaling Controller → Endpoint Capacity (0..=max)
//! ```
//!
//! ## Core Features
//!
//! - **Dispatch**: every notification record routed by key prefix; partial
//!   batch failures never hide valid siblings
//! - **Scaling**: backlog target tracking with asymmetric cooldowns and
//!   scale-to-zero
//! - **Credentials**: fresh registry tokens for container image pulls
//! - **Bootstrap**: idempotent store → queue notification wiring
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use whisper_dispatch::{service::Backends, DispatchService, config::ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> whisper_dispatch::Result<()> {
//!     let config = ServiceConfig::from_file("whisper.hcl").await?;
//!     let backends = Backends::aws(&config).await?;
//!     let service = DispatchService::new(config, backends)?;
//!     service.start().await?;
//!     service.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod observability;
pub mod registry;
pub mod scaling;
pub mod service;

// Re-export main types
pub use error::{DispatchError, Result};
pub use service::{Backends, DispatchService};

use serde::{Deserialize, Serialize};

/// Service runtime state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceState {
    /// Service has been created but not yet started
    #[default]
    Created,
    /// Service is spawning its tasks
    Starting,
    /// Consumer (and controller, if enabled) are running
    Running,
    /// Tasks have been signalled to stop
    Stopping,
    /// Service has fully stopped
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Service health status snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Current service state
    pub state: ServiceState,
    /// Uptime in seconds since the service was created
    pub uptime_secs: u64,
    /// Queue messages received since start
    pub messages_received: u64,
    /// Capacity last committed by the scaling controller
    pub desired_capacity: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state_default() {
        assert_eq!(ServiceState::default(), ServiceState::Created);
    }

    #[test]
    fn test_service_state_display() {
        assert_eq!(ServiceState::Created.to_string(), "created");
        assert_eq!(ServiceState::Starting.to_string(), "starting");
        assert_eq!(ServiceState::Running.to_string(), "running");
        assert_eq!(ServiceState::Stopping.to_string(), "stopping");
        assert_eq!(ServiceState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_service_state_serialization() {
        let json = serde_json::to_string(&ServiceState::Running).unwrap();
        let parsed: ServiceState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ServiceState::Running);
    }

    #[test]
    fn test_health_status_serialization() {
        let health = HealthStatus {
            state: ServiceState::Running,
            uptime_secs: 3600,
            messages_received: 42,
            desired_capacity: 1,
        };
        let json = serde_json::to_string(&health).unwrap();
        let parsed: HealthStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.state, ServiceState::Running);
        assert_eq!(parsed.messages_received, 42);
        assert_eq!(parsed.desired_capacity, 1);
    }
}
