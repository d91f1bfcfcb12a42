//! Dual-path dispatch of execution calls.
//!
//! Every inbound execution call either runs the executor directly or, for
//! eligible test callers of debug-enabled subjects, registers a pending
//! debug session, launches a paused run through the loopback and waits
//! for the session outcome.

use std::{collections::HashMap, sync::Arc};

use agent_gateway_core::{
    ControlIntent, EndpointKind, EndpointPath, EventEmitter, ExecutionRequest, Executor,
    MockDataSource, PushConnectionRegistry, RequestIntent, Subject, SubjectDirectory,
    request::{HEADER_AGENT_VERSION, HEADER_DEBUG_SESSION, LATEST_VERSION},
};
use agent_gateway_session::SessionBroker;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::{GatewayConfig, LoopbackMode},
    error::GatewayError,
    loopback::{HttpLoopback, InProcessLoopback, LoopbackError, LoopbackRef},
    protocol::{DispatchResponse, INCLUDE_NEW_STATE, StopAck},
};

/// An execution call as it arrives at the gateway.
#[derive(Debug, Clone, Default)]
pub struct InboundCall {
    /// Explicit owner key (`X-AGENT-ID`), if sent.
    pub owner_key: Option<String>,
    /// Host the call was addressed to.
    pub host: String,
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Raw headers; names are matched case-insensitively.
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl InboundCall {
    /// Create a call with no headers and a null body.
    #[must_use]
    pub fn new(host: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the owner key.
    #[must_use]
    pub fn owner(mut self, owner_key: impl Into<String>) -> Self {
        self.owner_key = Some(owner_key.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Add a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// First value of a header, matched case-insensitively.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) struct DispatcherInner {
    executor: Arc<dyn Executor>,
    subjects: Arc<dyn SubjectDirectory>,
    mock_data: Option<Arc<dyn MockDataSource>>,
    loopback: LoopbackRef,
    broker: SessionBroker,
    registry: PushConnectionRegistry,
    config: GatewayConfig,
}

/// Builder for [`DualPathDispatcher`].
pub struct DispatcherBuilder {
    executor: Arc<dyn Executor>,
    subjects: Arc<dyn SubjectDirectory>,
    mock_data: Option<Arc<dyn MockDataSource>>,
    loopback: Option<LoopbackRef>,
    config: GatewayConfig,
}

impl DispatcherBuilder {
    /// Start a builder around the executor and subject directory.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>, subjects: Arc<dyn SubjectDirectory>) -> Self {
        Self {
            executor,
            subjects,
            mock_data: None,
            loopback: None,
            config: GatewayConfig::default(),
        }
    }

    /// Source of stored mock outputs for debug runs.
    #[must_use]
    pub fn mock_data(mut self, source: Arc<dyn MockDataSource>) -> Self {
        self.mock_data = Some(source);
        self
    }

    /// Override the loopback chosen from the config.
    #[must_use]
    pub fn loopback(mut self, loopback: LoopbackRef) -> Self {
        self.loopback = Some(loopback);
        self
    }

    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    /// Returns error if the HTTP loopback client cannot be built.
    pub fn build(self) -> Result<DualPathDispatcher, LoopbackError> {
        let loopback: Option<LoopbackRef> = match (self.loopback, &self.config.loopback) {
            (Some(loopback), _) => Some(loopback),
            (None, LoopbackMode::Http { port }) => Some(Arc::new(HttpLoopback::new(*port)?)),
            (None, LoopbackMode::InProcess) => None,
        };
        let broker = SessionBroker::new(self.config.session_ttl);
        let registry = PushConnectionRegistry::new(self.config.idle_timeout);

        let inner = Arc::new_cyclic(|weak| DispatcherInner {
            executor: self.executor,
            subjects: self.subjects,
            mock_data: self.mock_data,
            loopback: loopback
                .unwrap_or_else(|| Arc::new(InProcessLoopback::new(weak.clone()))),
            broker,
            registry,
            config: self.config,
        });
        Ok(DualPathDispatcher { inner })
    }
}

/// Routes execution calls to the direct or the debug path.
#[derive(Clone)]
pub struct DualPathDispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for DualPathDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualPathDispatcher")
            .field("broker", &self.inner.broker)
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl DualPathDispatcher {
    pub(crate) const fn from_inner(inner: Arc<DispatcherInner>) -> Self {
        Self { inner }
    }

    /// Session broker shared by every call.
    #[must_use]
    pub fn broker(&self) -> &SessionBroker {
        &self.inner.broker
    }

    /// Push connection registry shared by every call.
    #[must_use]
    pub fn registry(&self) -> &PushConnectionRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Close every push connection. Returns how many were open.
    pub fn shutdown(&self) -> usize {
        let closed = self.inner.registry.close_all();
        info!(closed, "Closed push connections");
        closed
    }

    /// Dispatch one execution call.
    ///
    /// # Errors
    /// Returns the gateway error the caller should see.
    #[instrument(skip(self, call), fields(method = %call.method, path = %call.path))]
    pub async fn dispatch(&self, call: InboundCall) -> Result<DispatchResponse, GatewayError> {
        let inner = &self.inner;
        let mut intent = RequestIntent::from_headers(
            call.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            inner.config.marker_policy(),
        );

        let (owner_key, host_resolved) = match call.owner_key.clone() {
            Some(owner_key) => (owner_key, false),
            None => {
                let owner_key = inner
                    .subjects
                    .owner_for_host(&call.host)
                    .await
                    .ok_or(GatewayError::SubjectNotFound)?;
                (owner_key, true)
            }
        };
        let endpoint = EndpointPath::parse(&call.path);
        let version = self.select_version(&call, endpoint.as_ref(), host_resolved, &intent);
        let subject = inner
            .subjects
            .lookup(&owner_key, version.as_deref())
            .await
            .ok_or(GatewayError::SubjectNotFound)?;
        debug!(owner_key = %owner_key, version = ?version, "Subject loaded");

        let is_test_caller = self.is_test_caller(&call.host, &subject, &intent);
        if !is_test_caller {
            intent.observers.clear();
        }
        let mut request = build_request(owner_key, call, intent);
        request.version = version;
        let include_new_state = request.query_flag(INCLUDE_NEW_STATE);

        match &request.intent.control {
            ControlIntent::Stop => {
                let stopped = inner.broker.stop(&request.owner_key);
                debug!(owner_key = %request.owner_key, stopped, "Stop handled");
                return Ok(StopAck { stopped }.into());
            }
            ControlIntent::ReadState { state_id } => {
                let state_id = state_id.clone();
                return self.read_state(&request, &state_id).await.map(DispatchResponse::ok);
            }
            _ => {}
        }

        endpoint
            .filter(|e| e.kind == EndpointKind::Api || inner.config.triggers_enabled)
            .ok_or(GatewayError::EndpointNotFound)?;

        let eligible = inner.config.debugger_enabled
            && subject.debug_session_enabled
            && is_test_caller
            && !request.intent.control.is_marked();
        let debugging = eligible || request.intent.has_debug_markers;

        if debugging {
            self.inject_mock_data(&mut request).await;
        }

        let emitter = inner.registry.emitter_for(&request.intent.observers);
        let mut response = if eligible {
            self.debug_path(request.clone(), emitter).await?
        } else {
            self.direct_path(request.clone(), emitter).await?
        };

        if include_new_state && debugging {
            self.attach_new_state(&request, &mut response).await;
        }
        Ok(response)
    }

    /// Run the executor directly. Used by the in-process loopback.
    pub(crate) async fn run_direct(
        &self,
        request: ExecutionRequest,
    ) -> Result<DispatchResponse, GatewayError> {
        self.direct_path(request, EventEmitter::default()).await
    }

    async fn direct_path(
        &self,
        request: ExecutionRequest,
        mut emitter: EventEmitter,
    ) -> Result<DispatchResponse, GatewayError> {
        let inner = &self.inner;
        let owner_key = request.owner_key.clone();
        if let Some(attached) = inner.broker.attached_emitter(&owner_key) {
            emitter.merge(&attached);
        }

        let envelope = match inner.executor.run(request, emitter).await {
            Ok(envelope) => envelope,
            Err(source) => {
                if source.is_killed() {
                    debug!(owner_key = %owner_key, "Execution killed");
                } else {
                    error!(owner_key = %owner_key, error = %source, "Execution failed");
                }
                return Err(GatewayError::UpstreamExecution { owner_key, source });
            }
        };

        if let Some((token, data)) = envelope.final_result() {
            let resolved = inner.broker.resolve(&owner_key, token, data.clone());
            debug!(owner_key = %owner_key, token, resolved, "Final result delivered");
        }
        Ok(DispatchResponse {
            status: envelope.status,
            body: envelope.into_body(),
        })
    }

    async fn debug_path(
        &self,
        request: ExecutionRequest,
        emitter: EventEmitter,
    ) -> Result<DispatchResponse, GatewayError> {
        let inner = &self.inner;
        let owner_key = request.owner_key.clone();
        let attached = (!emitter.is_empty()).then_some(emitter);
        let session = inner.broker.register(&owner_key, attached);
        let token = session.token().to_string();
        debug!(owner_key = %owner_key, token = %token, "Launching paused run");

        let loopback = Arc::clone(&inner.loopback);
        let paused_run = request.into_loopback(token);
        let launch_owner = owner_key.clone();
        tokio::spawn(async move {
            if let Err(e) = loopback.launch(paused_run).await {
                warn!(owner_key = %launch_owner, error = %e, "Loopback launch failed");
            }
        });

        match session.outcome().await {
            Ok(data) => Ok(DispatchResponse::ok(data)),
            Err(source) => {
                info!(owner_key = %owner_key, reason = %source, "Live debug session ended");
                Err(GatewayError::Session { owner_key, source })
            }
        }
    }

    async fn read_state(
        &self,
        request: &ExecutionRequest,
        state_id: &str,
    ) -> Result<Value, GatewayError> {
        self.inner
            .executor
            .read_snapshot(request, state_id)
            .await
            .map_err(|e| {
                warn!(owner_key = %request.owner_key, state_id, error = %e, "State read failed");
                GatewayError::StateUnavailable
            })
    }

    async fn inject_mock_data(&self, request: &mut ExecutionRequest) {
        let Some(source) = &self.inner.mock_data else {
            return;
        };
        match source.mock_data(&request.owner_key).await {
            Ok(settings) => {
                let appended = request.inject_mock_data(&settings);
                debug!(owner_key = %request.owner_key, appended, "Mock data injected");
            }
            Err(e) => {
                warn!(owner_key = %request.owner_key, error = %e, "Mock data unavailable");
            }
        }
    }

    /// Embed the session's state snapshot. Only a 200 result carries one.
    async fn attach_new_state(&self, request: &ExecutionRequest, response: &mut DispatchResponse) {
        let Some(token) = response.session_token().map(str::to_string) else {
            return;
        };
        let state = if response.status == 200 {
            self.read_state(request, &token).await.unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        if let Value::Object(body) = &mut response.body {
            body.insert("newState".into(), state);
        }
    }

    /// Path prefix first, then `X-AGENT-VERSION`. Production hosts that
    /// resolved the owner themselves and send no debugger marker get
    /// the latest deployment.
    fn select_version(
        &self,
        call: &InboundCall,
        endpoint: Option<&EndpointPath>,
        host_resolved: bool,
        intent: &RequestIntent,
    ) -> Option<String> {
        endpoint
            .and_then(|e| e.version.clone())
            .or_else(|| {
                call.header_value(HEADER_AGENT_VERSION)
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .or_else(|| {
                let production = host_resolved
                    && !self.inner.config.is_test_host(&call.host)
                    && !intent.control.is_debugger_marker();
                production.then(|| LATEST_VERSION.to_string())
            })
    }

    /// Whether the caller may debug and attach observers.
    fn is_test_caller(&self, host: &str, subject: &Subject, intent: &RequestIntent) -> bool {
        if self.inner.config.is_test_host(host) {
            return true;
        }
        subject.debug_session_enabled && intent.control.is_debugger_marker()
    }
}

fn build_request(owner_key: String, call: InboundCall, intent: RequestIntent) -> ExecutionRequest {
    let headers: HashMap<String, String> = call
        .headers
        .into_iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value))
        .collect();
    let session_token = headers
        .get(HEADER_DEBUG_SESSION)
        .filter(|token| !token.is_empty())
        .cloned();

    let mut request = ExecutionRequest::new(owner_key, call.method, call.path)
        .with_body(call.body)
        .with_intent(intent);
    request.query = call.query;
    request.headers = headers;
    request.session_token = session_token;
    request
}
