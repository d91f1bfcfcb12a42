//! Inbound execution requests and the control intents they carry.

use std::{collections::HashMap, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Header naming the execution subject.
pub const HEADER_AGENT_ID: &str = "x-agent-id";
/// Deployed version to load when the path carries none.
pub const HEADER_AGENT_VERSION: &str = "x-agent-version";
/// Version served to production hosts that name none.
pub const LATEST_VERSION: &str = "latest";
/// Stop the pending debug session for the subject.
pub const HEADER_DEBUG_STOP: &str = "x-debug-stop";
/// Run (step) a paused execution.
pub const HEADER_DEBUG_RUN: &str = "x-debug-run";
/// Read a debug state snapshot; value is the state id.
pub const HEADER_DEBUG_READ: &str = "x-debug-read";
/// Skip the current step.
pub const HEADER_DEBUG_SKIP: &str = "x-debug-skip";
/// Inject data into the paused execution.
pub const HEADER_DEBUG_INJECT: &str = "x-debug-inj";
/// Session token quoted by loopback runs.
pub const HEADER_DEBUG_SESSION: &str = "x-debug-session";
/// Comma-separated push connection ids to attach.
pub const HEADER_MONITOR_ID: &str = "x-monitor-id";
/// Set on requests whose body carries stored mock outputs.
pub const HEADER_MOCK_DATA_INJECTED: &str = "x-mock-data-inj";

const DEBUG_PREFIX: &str = "x-debug-";

/// Markers dropped when the debugger is disabled.
const DEBUGGER_MARKERS: [&str; 4] = [
    HEADER_DEBUG_SKIP,
    HEADER_DEBUG_RUN,
    HEADER_DEBUG_INJECT,
    HEADER_DEBUG_READ,
];

/// Which caller-facing debug features are switched on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerPolicy {
    /// Accept run/skip/inject/read markers.
    pub debugger_enabled: bool,
    /// Accept observer id lists.
    pub monitor_enabled: bool,
}

/// The control intent of a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ControlIntent {
    /// Stop the pending debug session.
    Stop,
    /// Read a state snapshot instead of running.
    ReadState { state_id: String },
    /// Step a paused execution.
    Run,
    /// Skip the current step.
    Skip,
    /// Inject data into the execution.
    Inject,
    /// No control marker.
    #[default]
    None,
}

impl ControlIntent {
    /// Whether any marker was present.
    #[must_use]
    pub const fn is_marked(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Stop, run, inject and read markers. Skip does not count.
    #[must_use]
    pub const fn is_debugger_marker(&self) -> bool {
        matches!(self, Self::Stop | Self::Run | Self::Inject | Self::ReadState { .. })
    }
}

/// Everything the dispatcher needs to know about the caller's markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIntent {
    /// Parsed control intent.
    pub control: ControlIntent,
    /// Push connection ids to attach, in request order.
    pub observers: Vec<String>,
    /// Any `x-debug-*` marker survived the policy filter.
    pub has_debug_markers: bool,
}

impl RequestIntent {
    /// Parse header-style markers.
    ///
    /// Names are matched case-insensitively. Precedence is stop, read,
    /// run, skip, inject. Markers disabled by `policy` are ignored.
    pub fn from_headers<'a, I>(headers: I, policy: MarkerPolicy) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut markers: HashMap<String, &str> = HashMap::new();
        let mut observers: Vec<String> = Vec::new();

        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name == HEADER_MONITOR_ID {
                if policy.monitor_enabled {
                    for id in value.split(',').map(str::trim).filter(|id| !id.is_empty()) {
                        if !observers.iter().any(|seen| seen == id) {
                            observers.push(id.to_string());
                        }
                    }
                }
                continue;
            }
            if !name.starts_with(DEBUG_PREFIX) {
                continue;
            }
            if !policy.debugger_enabled && DEBUGGER_MARKERS.contains(&name.as_str()) {
                continue;
            }
            markers.insert(name, value);
        }

        let read_state = markers
            .get(HEADER_DEBUG_READ)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty());

        let control = if markers.contains_key(HEADER_DEBUG_STOP) {
            ControlIntent::Stop
        } else if let Some(state_id) = read_state {
            ControlIntent::ReadState {
                state_id: state_id.to_string(),
            }
        } else if markers.contains_key(HEADER_DEBUG_RUN) {
            ControlIntent::Run
        } else if markers.contains_key(HEADER_DEBUG_SKIP) {
            ControlIntent::Skip
        } else if markers.contains_key(HEADER_DEBUG_INJECT) {
            ControlIntent::Inject
        } else {
            ControlIntent::None
        };

        Self {
            control,
            observers,
            has_debug_markers: !markers.is_empty(),
        }
    }
}

/// Kind of operation an endpoint path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// `/api/...`
    Api,
    /// `/trigger/...`
    Trigger,
}

static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:/v([0-9]+(?:\.[0-9]+)?))?/(api|trigger)/(.*)$").expect("valid endpoint regex")
});

/// A validated execution endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPath {
    /// Deployed version from a `/vX.Y` prefix; live subjects have none.
    pub version: Option<String>,
    /// Operation kind.
    pub kind: EndpointKind,
    /// Operation name (everything after the kind segment).
    pub name: String,
}

impl EndpointPath {
    /// Parse a request path. Returns `None` for paths that address no operation.
    ///
    /// The kind segment must be the first segment, or follow a `/vN` or
    /// `/vN.M` version prefix. Any other leading segment (`/dev/api/x`)
    /// addresses no operation.
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        let caps = ENDPOINT_RE.captures(path)?;
        let kind = match caps.get(2)?.as_str() {
            "api" => EndpointKind::Api,
            _ => EndpointKind::Trigger,
        };
        Some(Self {
            version: caps.get(1).map(|m| m.as_str().to_string()),
            kind,
            name: caps.get(3).map_or_else(String::new, |m| m.as_str().to_string()),
        })
    }

    /// Path without the version prefix.
    #[must_use]
    pub fn unversioned(&self) -> String {
        let segment = match self.kind {
            EndpointKind::Api => "api",
            EndpointKind::Trigger => "trigger",
        };
        format!("/{segment}/{}", self.name)
    }
}

/// An execution request as seen by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Identity of the execution subject.
    pub owner_key: String,
    /// HTTP method of the originating call.
    pub method: String,
    /// Original request path.
    pub path: String,
    /// Query parameters.
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Request body (JSON body for POST, query object for GET).
    #[serde(default)]
    pub body: Value,
    /// Forwarded headers, lower-cased names.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Parsed control markers.
    #[serde(default)]
    pub intent: RequestIntent,
    /// Deployed version the subject was loaded at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Token of the debug session this run belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Body carries stored mock outputs.
    #[serde(default)]
    pub mock_data_injected: bool,
}

impl ExecutionRequest {
    /// Create a request with an empty body.
    #[must_use]
    pub fn new(
        owner_key: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            owner_key: owner_key.into(),
            method: method.into(),
            path: path.into(),
            query: HashMap::new(),
            body: Value::Null,
            headers: HashMap::new(),
            intent: RequestIntent::default(),
            version: None,
            session_token: None,
            mock_data_injected: false,
        }
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Replace the intent.
    #[must_use]
    pub fn with_intent(mut self, intent: RequestIntent) -> Self {
        self.intent = intent;
        self
    }

    /// Get a query parameter.
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Whether a truthy query flag is present.
    #[must_use]
    pub fn query_flag(&self, key: &str) -> bool {
        self.query_param(key)
            .is_some_and(|v| !matches!(v, "" | "0" | "false"))
    }

    /// Derive the paused run the debug path launches for this request.
    #[must_use]
    pub fn into_loopback(mut self, session_token: String) -> Self {
        self.intent.control = ControlIntent::Run;
        self.intent.has_debug_markers = true;
        self.headers
            .insert(HEADER_DEBUG_RUN.to_string(), String::new());
        self.headers
            .insert(HEADER_DEBUG_SESSION.to_string(), session_token.clone());
        self.session_token = Some(session_token);
        self
    }

    /// Append stored mock outputs to the body.
    ///
    /// `settings` maps component ids to `{ data: { outputs } }`.
    /// Components already present in an array body are kept as sent.
    /// Returns how many components were appended.
    pub fn inject_mock_data(&mut self, settings: &Value) -> usize {
        let components = mock_components(settings);
        if components.is_empty() {
            return 0;
        }
        self.mock_data_injected = true;
        self.headers
            .insert(HEADER_MOCK_DATA_INJECTED.to_string(), String::new());

        if self.body.is_null() || self.body.as_object().is_some_and(serde_json::Map::is_empty) {
            self.body = Value::Array(Vec::new());
        }
        let Some(existing) = self.body.as_array_mut() else {
            return 0;
        };

        let existing_ids: Vec<Value> = existing
            .iter()
            .filter_map(|item| item.get("id").cloned())
            .collect();
        let before = existing.len();
        existing.extend(
            components
                .into_iter()
                .filter(|c| c.get("id").is_none_or(|id| !existing_ids.contains(id))),
        );
        existing.len() - before
    }
}

fn mock_components(settings: &Value) -> Vec<Value> {
    let Some(entries) = settings.as_object() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(id, value)| {
            let output = value.pointer("/data/outputs")?;
            let non_empty = output.as_object().is_some_and(|o| !o.is_empty());
            non_empty.then(|| {
                json!({
                    "id": id,
                    "ctx": { "active": false, "output": output },
                })
            })
        })
        .collect()
}

/// Result of one executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResultEnvelope {
    /// Status the executor reports.
    pub status: u16,
    /// Result payload.
    pub data: Value,
    /// Session this run belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// This run completes its session.
    #[serde(default)]
    pub is_final: bool,
}

impl ExecutionResultEnvelope {
    /// A session-less completed run.
    #[must_use]
    pub const fn ok(data: Value) -> Self {
        Self {
            status: 200,
            data,
            session_token: None,
            is_final: false,
        }
    }

    /// An intermediate result of a paused run.
    #[must_use]
    pub const fn paused(session_token: String, data: Value) -> Self {
        Self {
            status: 200,
            data,
            session_token: Some(session_token),
            is_final: false,
        }
    }

    /// The final result completing a session.
    #[must_use]
    pub const fn completed(session_token: String, data: Value) -> Self {
        Self {
            status: 200,
            data,
            session_token: Some(session_token),
            is_final: true,
        }
    }

    /// Response body for the direct path.
    #[must_use]
    pub fn into_body(self) -> Value {
        let mut body = serde_json::Map::new();
        body.insert("status".into(), Value::from(self.status));
        body.insert("data".into(), self.data);
        if let Some(token) = self.session_token {
            body.insert("sessionToken".into(), Value::String(token));
        }
        body.insert("isFinal".into(), Value::Bool(self.is_final));
        Value::Object(body)
    }

    /// Token and payload of a session-completing result.
    #[must_use]
    pub fn final_result(&self) -> Option<(&str, &Value)> {
        match (&self.session_token, self.is_final) {
            (Some(token), true) => Some((token.as_str(), &self.data)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: MarkerPolicy = MarkerPolicy {
        debugger_enabled: true,
        monitor_enabled: true,
    };

    #[test]
    fn stop_wins_over_everything() {
        let intent = RequestIntent::from_headers(
            [("X-DEBUG-RUN", ""), ("X-DEBUG-STOP", ""), ("X-DEBUG-READ", "s1")],
            ALL,
        );
        assert_eq!(intent.control, ControlIntent::Stop);
        assert!(intent.has_debug_markers);
    }

    #[test]
    fn read_requires_a_state_id() {
        let intent = RequestIntent::from_headers([("x-debug-read", " "), ("x-debug-inj", "")], ALL);
        assert_eq!(intent.control, ControlIntent::Inject);

        let intent = RequestIntent::from_headers([("X-Debug-Read", "state-9")], ALL);
        assert_eq!(
            intent.control,
            ControlIntent::ReadState {
                state_id: "state-9".into()
            }
        );
    }

    #[test]
    fn observers_are_trimmed_and_deduplicated() {
        let intent = RequestIntent::from_headers([("X-MONITOR-ID", " m1, m2 ,,m1")], ALL);
        assert_eq!(intent.observers, vec!["m1", "m2"]);
        assert_eq!(intent.control, ControlIntent::None);
        assert!(!intent.has_debug_markers);
    }

    #[test]
    fn disabled_features_strip_markers() {
        let policy = MarkerPolicy::default();
        let intent = RequestIntent::from_headers(
            [("x-debug-run", ""), ("x-monitor-id", "m1"), ("x-debug-stop", "")],
            policy,
        );
        // Stop is not a debugger marker and survives.
        assert_eq!(intent.control, ControlIntent::Stop);
        assert!(intent.observers.is_empty());

        let intent = RequestIntent::from_headers([("x-debug-skip", "")], policy);
        assert_eq!(intent.control, ControlIntent::None);
        assert!(!intent.has_debug_markers);
    }

    #[test]
    fn endpoint_paths() {
        let live = EndpointPath::parse("/api/summarize").unwrap();
        assert_eq!(live.kind, EndpointKind::Api);
        assert_eq!(live.version, None);
        assert_eq!(live.name, "summarize");

        let deployed = EndpointPath::parse("/v1.2/api/a/b").unwrap();
        assert_eq!(deployed.version.as_deref(), Some("1.2"));
        assert_eq!(deployed.unversioned(), "/api/a/b");

        let trigger = EndpointPath::parse("/trigger/nightly").unwrap();
        assert_eq!(trigger.kind, EndpointKind::Trigger);

        assert!(EndpointPath::parse("/storage/file.txt").is_none());
    }

    #[test]
    fn only_numeric_prefixes_are_versions() {
        assert_eq!(
            EndpointPath::parse("/v2/trigger/t").unwrap().version.as_deref(),
            Some("2")
        );
        assert!(EndpointPath::parse("/dev/api/x").is_none());
        assert!(EndpointPath::parse("/vlatest/api/x").is_none());
        assert!(EndpointPath::parse("/v1.2.3/api/x").is_none());
        assert!(EndpointPath::parse("/x/v1/api/x").is_none());
    }

    #[test]
    fn skip_is_not_a_debugger_marker() {
        assert!(ControlIntent::Run.is_debugger_marker());
        assert!(
            ControlIntent::ReadState {
                state_id: "s".into()
            }
            .is_debugger_marker()
        );
        assert!(!ControlIntent::Skip.is_debugger_marker());
        assert!(!ControlIntent::None.is_debugger_marker());
    }

    #[test]
    fn loopback_marks_a_paused_run() {
        let request = ExecutionRequest::new("agent-1", "POST", "/api/go").into_loopback("s1".into());
        assert_eq!(request.intent.control, ControlIntent::Run);
        assert_eq!(request.session_token.as_deref(), Some("s1"));
        assert_eq!(request.headers.get(HEADER_DEBUG_SESSION).map(String::as_str), Some("s1"));
    }

    #[test]
    fn mock_data_is_appended_without_overriding_sent_components() {
        let settings = json!({
            "c1": { "data": { "outputs": { "text": "stored" } } },
            "c2": { "data": { "outputs": { "n": 1 } } },
            "c3": { "data": { "outputs": {} } },
        });
        let mut request = ExecutionRequest::new("agent-1", "POST", "/api/go")
            .with_body(json!([{ "id": "c1", "ctx": { "output": "sent" } }]));

        let appended = request.inject_mock_data(&settings);

        assert_eq!(appended, 1);
        assert!(request.mock_data_injected);
        let body = request.body.as_array().unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body[0]["ctx"]["output"], "sent");
        assert_eq!(body[1]["id"], "c2");
        assert_eq!(body[1]["ctx"]["active"], false);
    }

    #[test]
    fn mock_data_turns_empty_object_body_into_array() {
        let settings = json!({ "c1": { "data": { "outputs": { "x": 1 } } } });
        let mut request = ExecutionRequest::new("agent-1", "POST", "/api/go").with_body(json!({}));
        assert_eq!(request.inject_mock_data(&settings), 1);
        assert!(request.body.is_array());
    }

    #[test]
    fn final_result_requires_token_and_flag() {
        assert!(ExecutionResultEnvelope::ok(json!(1)).final_result().is_none());
        assert!(ExecutionResultEnvelope::paused("s1".into(), json!(1)).final_result().is_none());
        let done = ExecutionResultEnvelope::completed("s1".into(), json!({ "answer": 42 }));
        assert_eq!(done.final_result(), Some(("s1", &json!({ "answer": 42 }))));
    }
}
