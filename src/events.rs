//! Lifecycle event emission.
//!
//! Emission is best-effort and non-blocking: handlers must not fail the
//! caller, and slow sinks must buffer or drop rather than stall a
//! partial execution.

use serde::{Deserialize, Serialize};

/// Request lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    RequestStarted {
        flow_name: String,
        request_id: String,
    },
    NodeCompleted {
        flow_name: String,
        request_id: String,
        node: String,
        duration_ms: u64,
    },
    RequestFinished {
        flow_name: String,
        request_id: String,
    },
    RequestFailed {
        flow_name: String,
        request_id: String,
        reason: String,
    },
    /// A message was rejected at the tail of the push chain and dropped.
    MessageDropped { queue: String },
}

/// Sink for lifecycle events.
pub trait EventHandler: Send + Sync {
    fn emit(&self, event: Event);
}

/// Production sink: events become structured log lines.
pub struct TracingEventHandler;

impl EventHandler for TracingEventHandler {
    fn emit(&self, event: Event) {
        match &event {
            Event::RequestStarted { flow_name, request_id } => {
                tracing::info!(flow = %flow_name, request = %request_id, "request started");
            }
            Event::NodeCompleted { flow_name, request_id, node, duration_ms } => {
                tracing::info!(
                    flow = %flow_name,
                    request = %request_id,
                    node = %node,
                    duration_ms,
                    "node completed"
                );
            }
            Event::RequestFinished { flow_name, request_id } => {
                tracing::info!(flow = %flow_name, request = %request_id, "request finished");
            }
            Event::RequestFailed { flow_name, request_id, reason } => {
                tracing::warn!(flow = %flow_name, request = %request_id, %reason, "request failed");
            }
            Event::MessageDropped { queue } => {
                tracing::warn!(%queue, "message dropped at end of push chain");
            }
        }
    }
}

/// Collecting sink for tests and inspection.
pub struct BufferingEventHandler {
    events: parking_lot::RwLock<Vec<Event>>,
}

impl BufferingEventHandler {
    pub fn new() -> Self {
        Self {
            events: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Default for BufferingEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for BufferingEventHandler {
    fn emit(&self, event: Event) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffering_handler_collects_in_order() {
        let sink = BufferingEventHandler::new();
        sink.emit(Event::RequestStarted {
            flow_name: "f".into(),
            request_id: "r".into(),
        });
        sink.emit(Event::RequestFinished {
            flow_name: "f".into(),
            request_id: "r".into(),
        });
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::RequestStarted { .. }));
        assert!(matches!(events[1], Event::RequestFinished { .. }));
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
