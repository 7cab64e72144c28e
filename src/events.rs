//! Supervisor notifications
//!
//! The supervisor reports status transitions and failures through the
//! [`EventSink`] trait. Sinks are fire-and-forget: a slow or absent observer
//! never blocks a start or stop. Events for one configuration are emitted
//! from one place at a time, so their order is preserved per id.

use crate::error::ErrorCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Externally observed run state of a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Running,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Stopped => write!(f, "stopped"),
            RunState::Running => write!(f, "running"),
        }
    }
}

/// Receiver of supervisor notifications
pub trait EventSink: Send + Sync {
    fn on_status_changed(&self, config_id: &str, state: RunState);

    fn on_error(&self, config_id: &str, code: ErrorCode, message: &str);

    fn on_initialization_error(&self, message: &str);
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StatusChanged {
        config_id: String,
        state: RunState,
    },
    Error {
        config_id: String,
        code: ErrorCode,
        message: String,
    },
    InitializationError {
        message: String,
    },
}

/// A timestamped supervisor event
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl SupervisorEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    /// The configuration this event concerns, if any
    pub fn config_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::StatusChanged { config_id, .. } | EventKind::Error { config_id, .. } => {
                Some(config_id)
            }
            EventKind::InitializationError { .. } => None,
        }
    }
}

/// Sink that fans events out to any number of broadcast receivers
pub struct BroadcastSink {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, kind: EventKind) {
        // No receivers is not an error
        let _ = self.tx.send(SupervisorEvent::new(kind));
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastSink {
    fn on_status_changed(&self, config_id: &str, state: RunState) {
        self.send(EventKind::StatusChanged {
            config_id: config_id.to_string(),
            state,
        });
    }

    fn on_error(&self, config_id: &str, code: ErrorCode, message: &str) {
        self.send(EventKind::Error {
            config_id: config_id.to_string(),
            code,
            message: message.to_string(),
        });
    }

    fn on_initialization_error(&self, message: &str) {
        self.send(EventKind::InitializationError {
            message: message.to_string(),
        });
    }
}

/// Sink that writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_status_changed(&self, config_id: &str, state: RunState) {
        info!(config_id, %state, "Proxy status changed");
    }

    fn on_error(&self, config_id: &str, code: ErrorCode, message: &str) {
        warn!(config_id, %code, detail = message, "Proxy error");
    }

    fn on_initialization_error(&self, message: &str) {
        error!(detail = message, "Supervisor initialization failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_sink_multiple_subscribers() {
        let sink = BroadcastSink::default();
        let mut a = sink.subscribe();
        let mut b = sink.subscribe();
        assert_eq!(sink.receiver_count(), 2);

        sink.on_status_changed("cfg", RunState::Running);

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await.unwrap();
            assert_eq!(
                event.kind,
                EventKind::StatusChanged {
                    config_id: "cfg".to_string(),
                    state: RunState::Running,
                }
            );
            assert_eq!(event.config_id(), Some("cfg"));
        }
    }

    #[test]
    fn test_broadcast_sink_without_subscribers() {
        let sink = BroadcastSink::default();
        sink.on_error("cfg", ErrorCode::RuntimeFailure, "boom");
        sink.on_initialization_error("no binary");
    }

    #[tokio::test]
    async fn test_broadcast_sink_preserves_order() {
        let sink = BroadcastSink::default();
        let mut rx = sink.subscribe();

        sink.on_status_changed("cfg", RunState::Stopped);
        sink.on_error("cfg", ErrorCode::RuntimeFailure, "exited with code 1");

        assert!(matches!(
            rx.recv().await.unwrap().kind,
            EventKind::StatusChanged { state: RunState::Stopped, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().kind,
            EventKind::Error { code: ErrorCode::RuntimeFailure, .. }
        ));
    }

    #[test]
    fn test_event_json() {
        let event = SupervisorEvent::new(EventKind::Error {
            config_id: "cfg".to_string(),
            code: ErrorCode::SpawnFailure,
            message: "not found".to_string(),
        });
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"SPAWN_FAILURE\""));
        assert!(json.contains("\"config_id\":\"cfg\""));
        assert!(json.contains("\"timestamp\""));
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Running.to_string(), "running");
        assert_eq!(RunState::Stopped.to_string(), "stopped");
        assert_eq!(
            serde_json::to_string(&RunState::Stopped).unwrap(),
            "\"stopped\""
        );
    }
}
