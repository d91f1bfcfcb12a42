//! Wire types for the gateway's HTTP surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query flag asking for a fresh state snapshot in the response.
pub const INCLUDE_NEW_STATE: &str = "includeNewState";

/// Body of `GET /agent/{ownerKey}/debugSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSessionResponse {
    /// Token of the pending session, if any.
    pub token: Option<String>,
}

/// Acknowledgement of a stop control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAck {
    /// Whether a pending session was stopped.
    pub stopped: bool,
}

/// Health check body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Outcome of a dispatched execution call.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    /// HTTP status.
    pub status: u16,
    /// JSON body.
    pub body: Value,
}

impl DispatchResponse {
    /// A 200 response.
    #[must_use]
    pub const fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// Session token carried by a direct-path body.
    #[must_use]
    pub fn session_token(&self) -> Option<&str> {
        self.body.get("sessionToken").and_then(Value::as_str)
    }
}

impl From<StopAck> for DispatchResponse {
    fn from(ack: StopAck) -> Self {
        Self::ok(serde_json::json!({ "stopped": ack.stopped }))
    }
}

impl IntoResponse for DispatchResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.body)).into_response()
    }
}
