//! Loopback calls from the debug path into the direct path.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use agent_gateway_core::{
    ExecutionRequest,
    request::{HEADER_AGENT_ID, HEADER_AGENT_VERSION},
};
use async_trait::async_trait;
use reqwest::{Client, Method};
use thiserror::Error;
use tracing::debug;

use crate::dispatcher::{DispatcherInner, DualPathDispatcher};

/// Headers never forwarded on an HTTP loopback.
const EXCLUDED_HEADERS: [&str; 3] = ["host", "content-length", "accept-encoding"];

/// Time allowed to reach the loopback target.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loopback error.
#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("Loopback transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Loopback returned status {status}")]
    Status { status: u16 },
    #[error("Loopback run rejected: {0}")]
    Rejected(String),
    #[error("Loopback target is gone")]
    Unavailable,
}

/// Trait for launching the paused run of a debug call.
///
/// `launch` returns once the executor acknowledged the run (its first
/// envelope), never waiting for the session to complete.
#[async_trait]
pub trait Loopback: Send + Sync {
    /// Launch a paused run.
    async fn launch(&self, request: ExecutionRequest) -> Result<(), LoopbackError>;
}

/// Runs the direct path of the owning dispatcher in-process.
pub struct InProcessLoopback {
    dispatcher: Weak<DispatcherInner>,
}

impl InProcessLoopback {
    pub(crate) const fn new(dispatcher: Weak<DispatcherInner>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Loopback for InProcessLoopback {
    async fn launch(&self, request: ExecutionRequest) -> Result<(), LoopbackError> {
        let inner = self.dispatcher.upgrade().ok_or(LoopbackError::Unavailable)?;
        DualPathDispatcher::from_inner(inner)
            .run_direct(request)
            .await
            .map(|_| ())
            .map_err(|e| LoopbackError::Rejected(e.to_string()))
    }
}

/// Re-issues the call over HTTP to this server.
#[derive(Debug, Clone)]
pub struct HttpLoopback {
    client: Client,
    base_url: String,
}

impl HttpLoopback {
    /// Create a loopback targeting `http://127.0.0.1:{port}`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(port: u16) -> Result<Self, LoopbackError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: format!("http://127.0.0.1:{port}"),
        })
    }
}

#[async_trait]
impl Loopback for HttpLoopback {
    async fn launch(&self, request: ExecutionRequest) -> Result<(), LoopbackError> {
        let method = Method::from_bytes(request.method.as_bytes()).unwrap_or(Method::POST);
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = self
            .client
            .request(method.clone(), &url)
            .query(&request.query)
            .header(HEADER_AGENT_ID, &request.owner_key);
        // The paused run loads the same deployment as its caller.
        if let Some(version) = &request.version {
            builder = builder.header(HEADER_AGENT_VERSION, version);
        }
        for (name, value) in &request.headers {
            if EXCLUDED_HEADERS.contains(&name.as_str())
                || name == HEADER_AGENT_ID
                || name == HEADER_AGENT_VERSION
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if method != Method::GET {
            builder = builder.json(&request.body);
        }

        debug!(owner_key = %request.owner_key, url = %url, "Issuing loopback call");
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LoopbackError::Status {
                status: status.as_u16(),
            })
        }
    }
}

/// Shared loopback handle.
pub type LoopbackRef = Arc<dyn Loopback>;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{
        Json, Router,
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;

    type Seen = mpsc::UnboundedSender<(HeaderMap, HashMap<String, String>, Value)>;

    async fn record(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let _ = seen.send((headers, query, body));
        StatusCode::OK
    }

    async fn serve(router: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, router).await });
        port
    }

    #[tokio::test]
    async fn http_loopback_forwards_the_paused_run() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let port = serve(Router::new().route("/api/go", post(record)).with_state(tx)).await;

        let mut request = ExecutionRequest::new("agent-1", "POST", "/api/go")
            .with_body(json!({ "text": "hi" }))
            .into_loopback("s1".into());
        request.query.insert("lang".into(), "en".into());
        request.headers.insert("host".into(), "agents.example.com".into());
        request.headers.insert("x-trace".into(), "t1".into());
        request.headers.insert("x-agent-version".into(), "9".into());
        request.version = Some("1.2".into());

        HttpLoopback::new(port).unwrap().launch(request).await.unwrap();

        let (headers, query, body) = rx.recv().await.unwrap();
        assert_eq!(headers["x-agent-id"], "agent-1");
        assert_eq!(headers["x-debug-session"], "s1");
        assert!(headers.contains_key("x-debug-run"));
        assert_eq!(headers["x-trace"], "t1");
        assert_eq!(headers["x-agent-version"], "1.2");
        assert_ne!(headers["host"], "agents.example.com");
        assert_eq!(query["lang"], "en");
        assert_eq!(body, json!({ "text": "hi" }));
    }

    #[tokio::test]
    async fn http_loopback_reports_error_status() {
        let port = serve(Router::new().route(
            "/api/go",
            post(|| async { StatusCode::SERVICE_UNAVAILABLE }),
        ))
        .await;

        let request = ExecutionRequest::new("agent-1", "POST", "/api/go").into_loopback("s1".into());
        let err = HttpLoopback::new(port).unwrap().launch(request).await.unwrap_err();
        assert!(matches!(err, LoopbackError::Status { status: 503 }));
    }
}
