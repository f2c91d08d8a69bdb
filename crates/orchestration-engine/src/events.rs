//! Event types published to external consumers
//!
//! Status aggregation, UI summaries and notifications subscribe through an
//! [`EventSink`]. Delivery is at-least-once: a handler that is re-run after
//! a crash may publish the same event again, so consumers must be
//! idempotent.

use pipeline_contracts::Status;
use serde::{Deserialize, Serialize};

use crate::interrupts::{InterruptState, InterruptType};

/// Trait for publishing orchestration events
///
/// This abstracts over the transport (in-process channel, message bus, etc.)
/// so the engine can be embedded in different hosts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted while plans execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OrchestrationEvent {
    /// A node execution changed status
    #[serde(rename_all = "camelCase")]
    NodeStatusChanged {
        plan_execution_id: String,
        node_execution_id: String,
        node_id: String,
        identifier: String,
        from: Status,
        to: Status,
        /// Position in the plan's event log
        sequence: u64,
    },

    /// A plan execution changed status
    #[serde(rename_all = "camelCase")]
    PlanStatusChanged {
        plan_execution_id: String,
        plan_id: String,
        status: Status,
    },

    /// An interrupt finished processing
    #[serde(rename_all = "camelCase")]
    InterruptProcessed {
        plan_execution_id: String,
        interrupt_id: String,
        interrupt_type: InterruptType,
        state: InterruptState,
    },
}

impl OrchestrationEvent {
    pub fn plan_execution_id(&self) -> &str {
        match self {
            Self::NodeStatusChanged {
                plan_execution_id, ..
            }
            | Self::PlanStatusChanged {
                plan_execution_id, ..
            }
            | Self::InterruptProcessed {
                plan_execution_id, ..
            } => plan_execution_id,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: OrchestrationEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<OrchestrationEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().clone()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    sender: tokio::sync::mpsc::UnboundedSender<OrchestrationEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<OrchestrationEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with the receiving end
    pub fn channel() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<OrchestrationEvent>,
    ) {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: OrchestrationEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
