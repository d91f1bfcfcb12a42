//! HTTP routes for the gateway.

use std::{collections::HashMap, convert::Infallible};

use agent_gateway_core::request::HEADER_AGENT_ID;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, Uri, header, uri::Authority},
    response::{IntoResponse, Response, Sse},
    routing::{any, get},
};
use futures::StreamExt;
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    dispatcher::{DualPathDispatcher, InboundCall},
    protocol::{DebugSessionResponse, HealthResponse},
};

/// Build the gateway router.
///
/// Debug session and monitor routes are only mounted when the matching
/// feature is enabled; trigger routes only when triggers are enabled.
#[must_use]
pub fn create_router(dispatcher: DualPathDispatcher) -> Router {
    let config = dispatcher.config().clone();

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/api/{*rest}", any(execute))
        .route("/{version}/api/{*rest}", any(execute));
    if config.triggers_enabled {
        router = router.route("/trigger/{*name}", any(execute));
    }
    if config.debugger_enabled {
        router = router.route("/agent/{owner_key}/debugSession", get(debug_session));
    }
    if config.monitor_enabled {
        router = router.route("/agent/{owner_key}/monitor", get(monitor));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
    })
}

async fn debug_session(
    State(dispatcher): State<DualPathDispatcher>,
    Path(owner_key): Path<String>,
) -> Json<DebugSessionResponse> {
    Json(DebugSessionResponse {
        token: dispatcher.broker().peek_token(&owner_key),
    })
}

async fn monitor(
    State(dispatcher): State<DualPathDispatcher>,
    Path(owner_key): Path<String>,
) -> impl IntoResponse {
    let (connection_id, stream) = dispatcher.registry().open();
    info!(owner_key = %owner_key, connection_id = %connection_id, "Monitor opened");

    let events = stream.map(|frame| Ok::<_, Infallible>(frame.to_sse_event()));
    ([(header::CACHE_CONTROL, "no-cache")], Sse::new(events))
}

async fn execute(
    State(dispatcher): State<DualPathDispatcher>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let owner_key = headers
        .get(HEADER_AGENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(Authority::as_str))
        .unwrap_or_default()
        .to_string();

    let body = if method == Method::GET {
        serde_json::to_value(&query).unwrap_or_default()
    } else {
        parse_body(&body)
    };

    let call = InboundCall {
        owner_key,
        host,
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body,
    };

    match dispatcher.dispatch(call).await {
        Ok(response) => response.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Empty bodies become `{}`; non-JSON bodies are passed as a string.
fn parse_body(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
