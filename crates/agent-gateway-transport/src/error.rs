//! Gateway errors and their HTTP mapping.

use agent_gateway_core::ExecutorError;
use agent_gateway_session::SessionError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Agent not found")]
    SubjectNotFound,

    #[error("Endpoint not found")]
    EndpointNotFound,

    #[error("{source}")]
    UpstreamExecution {
        owner_key: String,
        source: ExecutorError,
    },

    #[error("Agent State Unavailable")]
    StateUnavailable,

    #[error("{source}")]
    Session {
        owner_key: String,
        source: SessionError,
    },
}

impl GatewayError {
    /// HTTP status this error maps to.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::SubjectNotFound | Self::EndpointNotFound => StatusCode::NOT_FOUND,
            Self::StateUnavailable => StatusCode::BAD_REQUEST,
            Self::UpstreamExecution { source, .. } => match source {
                ExecutorError::Failed {
                    status: Some(status),
                    ..
                } => StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Session { source, .. } => match source {
                SessionError::Stopped | SessionError::Interrupted { .. } => {
                    StatusCode::BAD_REQUEST
                }
                SessionError::Expired | SessionError::Abandoned => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    /// JSON body for this error.
    #[must_use]
    pub fn body(&self) -> Value {
        match self {
            Self::UpstreamExecution { owner_key, source } => {
                let mut body = match source {
                    ExecutorError::Failed {
                        body: Value::Object(extra),
                        ..
                    } => extra.clone(),
                    _ => Map::new(),
                };
                body.insert("error".into(), Value::String(source.to_string()));
                body.insert("agentId".into(), Value::String(owner_key.clone()));
                Value::Object(body)
            }
            Self::Session {
                owner_key,
                source: SessionError::Interrupted { previous_token },
            } => json!({
                "error": self.to_string(),
                "details": { "ownerKey": owner_key, "session": previous_token },
            }),
            _ => json!({ "error": self.to_string() }),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
