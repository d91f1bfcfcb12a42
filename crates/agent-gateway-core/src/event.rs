//! Step-level execution events and the frames that carry them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the first frame written on every push stream.
pub const INIT_EVENT: &str = "init";

/// An event emitted by an execution while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEvent {
    /// Event name (e.g. `step`, `debug`, `done`).
    pub event: String,
    /// Event payload.
    pub data: Value,
}

impl StepEvent {
    /// Create a new event.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Progress of a single step.
    #[must_use]
    pub fn step(data: Value) -> Self {
        Self::new("step", data)
    }

    /// Convert to a push frame.
    #[must_use]
    pub fn to_frame(&self) -> PushFrame {
        let data = match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        PushFrame {
            event: Some(self.event.clone()),
            data,
        }
    }

    /// Convert to an SSE event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        self.to_frame().to_sse_event()
    }
}

/// A single frame on a push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFrame {
    /// Optional event name.
    pub event: Option<String>,
    /// Text payload.
    pub data: String,
}

impl PushFrame {
    /// The `init` frame announcing a connection id.
    #[must_use]
    pub fn init(connection_id: &str) -> Self {
        Self {
            event: Some(INIT_EVENT.to_string()),
            data: connection_id.to_string(),
        }
    }

    /// SSE event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        let event = match &self.event {
            Some(name) => axum::response::sse::Event::default().event(name),
            None => axum::response::sse::Event::default(),
        };
        event.data(&self.data)
    }
}
