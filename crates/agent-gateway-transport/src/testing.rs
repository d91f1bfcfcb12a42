//! In-memory collaborators for tests.

use std::collections::HashMap;

use agent_gateway_core::{
    EventEmitter, ExecutionRequest, ExecutionResultEnvelope, Executor, ExecutorError,
    MockDataSource, StepEvent, Subject, SubjectDirectory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Executor whose behavior is picked by the request path.
///
/// - `/api/kill` fails with [`ExecutorError::Killed`]
/// - `/api/pause` pauses and never completes
/// - `/api/queued` pauses with status 202
/// - anything else echoes the body, or for runs carrying a session
///   token emits two `step` events and completes with `{ "answer": 42 }`
pub struct ScriptedExecutor;

impl ScriptedExecutor {
    pub const MISSING_STATE: &'static str = "missing";
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(
        &self,
        request: ExecutionRequest,
        emitter: EventEmitter,
    ) -> Result<ExecutionResultEnvelope, ExecutorError> {
        if request.path.ends_with("/kill") {
            return Err(ExecutorError::Killed);
        }
        let Some(token) = request.session_token.clone() else {
            return Ok(ExecutionResultEnvelope::ok(request.body));
        };
        if request.path.ends_with("/pause") {
            return Ok(ExecutionResultEnvelope::paused(token, json!({ "paused": true })));
        }
        if request.path.ends_with("/queued") {
            return Ok(ExecutionResultEnvelope {
                status: 202,
                ..ExecutionResultEnvelope::paused(token, json!({ "queued": true }))
            });
        }
        emitter.emit(&StepEvent::step(json!({ "step": 1 })));
        emitter.emit(&StepEvent::step(json!({ "step": 2 })));
        Ok(ExecutionResultEnvelope::completed(token, json!({ "answer": 42 })))
    }

    async fn read_snapshot(
        &self,
        _request: &ExecutionRequest,
        state_id: &str,
    ) -> Result<Value, ExecutorError> {
        if state_id == Self::MISSING_STATE {
            return Err(ExecutorError::failed("no such state"));
        }
        Ok(json!({ "stateId": state_id }))
    }
}

/// Fixed set of subjects keyed by owner key.
pub struct StaticDirectory {
    subjects: HashMap<String, Subject>,
}

impl StaticDirectory {
    pub fn new<'a>(subjects: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        Self {
            subjects: subjects
                .into_iter()
                .map(|(owner, debug)| (owner.to_string(), Subject::new(owner, debug)))
                .collect(),
        }
    }
}

#[async_trait]
impl SubjectDirectory for StaticDirectory {
    async fn lookup(&self, owner_key: &str, _version: Option<&str>) -> Option<Subject> {
        self.subjects.get(owner_key).cloned()
    }
}

/// [`StaticDirectory`] that records the version of every lookup and
/// serves hosts whose first label is an owner key.
pub struct RecordingDirectory {
    directory: StaticDirectory,
    versions: Mutex<Vec<Option<String>>>,
}

impl RecordingDirectory {
    pub fn new<'a>(subjects: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        Self {
            directory: StaticDirectory::new(subjects),
            versions: Mutex::new(Vec::new()),
        }
    }

    /// Versions seen so far; clears the record.
    pub fn take_versions(&self) -> Vec<Option<String>> {
        std::mem::take(&mut *self.versions.lock())
    }
}

#[async_trait]
impl SubjectDirectory for RecordingDirectory {
    async fn lookup(&self, owner_key: &str, version: Option<&str>) -> Option<Subject> {
        self.versions.lock().push(version.map(str::to_string));
        self.directory.lookup(owner_key, version).await
    }

    async fn owner_for_host(&self, host: &str) -> Option<String> {
        let label = host.split(['.', ':']).next()?;
        self.directory
            .subjects
            .contains_key(label)
            .then(|| label.to_string())
    }
}

pub struct FixedMockData(pub Value);

#[async_trait]
impl MockDataSource for FixedMockData {
    async fn mock_data(&self, _owner_key: &str) -> Result<Value, ExecutorError> {
        Ok(self.0.clone())
    }
}
