//! In-memory collaborators for the demo server.

use std::{collections::HashMap, time::Duration};

use agent_gateway_core::{
    ControlIntent, EventEmitter, ExecutionRequest, ExecutionResultEnvelope, Executor,
    ExecutorError, StepEvent, Subject, SubjectDirectory,
};
use async_trait::async_trait;
use serde_json::{Value, json};

/// Executor that echoes the body, or plays a few steps for debug runs.
pub struct ScriptedExecutor {
    steps: u32,
    step_delay: Duration,
}

impl ScriptedExecutor {
    pub const fn new(steps: u32, step_delay: Duration) -> Self {
        Self { steps, step_delay }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(
        &self,
        request: ExecutionRequest,
        emitter: EventEmitter,
    ) -> Result<ExecutionResultEnvelope, ExecutorError> {
        if request.intent.control == ControlIntent::Skip {
            return Ok(ExecutionResultEnvelope::ok(json!({ "skipped": true })));
        }
        let Some(token) = request.session_token.clone() else {
            return Ok(ExecutionResultEnvelope::ok(json!({ "echo": request.body })));
        };

        for step in 1..=self.steps {
            tokio::time::sleep(self.step_delay).await;
            emitter.emit(&StepEvent::step(json!({
                "step": step,
                "of": self.steps,
                "path": request.path,
            })));
        }
        Ok(ExecutionResultEnvelope::completed(
            token,
            json!({ "echo": request.body, "steps": self.steps }),
        ))
    }

    async fn read_snapshot(
        &self,
        request: &ExecutionRequest,
        state_id: &str,
    ) -> Result<Value, ExecutorError> {
        Ok(json!({ "stateId": state_id, "ownerKey": request.owner_key }))
    }
}

/// Subjects declared on the command line as `name` or `name:debug`.
pub struct StaticDirectory {
    subjects: HashMap<String, Subject>,
}

impl StaticDirectory {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Self {
        let subjects = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                let (name, debug) = entry
                    .strip_suffix(":debug")
                    .map_or((entry, false), |name| (name, true));
                (!name.is_empty()).then(|| (name.to_string(), Subject::new(name, debug)))
            })
            .collect();
        Self { subjects }
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }
}

#[async_trait]
impl SubjectDirectory for StaticDirectory {
    async fn lookup(&self, owner_key: &str, _version: Option<&str>) -> Option<Subject> {
        self.subjects.get(owner_key).cloned()
    }

    /// `agent-1.localhost:3000` is served by `agent-1`.
    async fn owner_for_host(&self, host: &str) -> Option<String> {
        let label = host.split(['.', ':']).next()?;
        self.subjects.contains_key(label).then(|| label.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_parses_debug_suffix() {
        let directory = StaticDirectory::parse(&["agent-1:debug", " agent-2 ", ""]);
        assert_eq!(directory.len(), 2);
        assert!(directory.lookup("agent-1", None).await.unwrap().debug_session_enabled);
        assert!(!directory.lookup("agent-2", None).await.unwrap().debug_session_enabled);
        assert_eq!(
            directory.owner_for_host("agent-2.localhost:3000").await.as_deref(),
            Some("agent-2")
        );
        assert_eq!(directory.owner_for_host("localhost:3000").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn debug_runs_complete_with_their_token() {
        let executor = ScriptedExecutor::new(2, Duration::from_millis(500));
        let request = ExecutionRequest::new("agent-1", "POST", "/api/go").into_loopback("s1".into());
        let envelope = executor.run(request, EventEmitter::default()).await.unwrap();
        assert_eq!(envelope.final_result().map(|(token, _)| token), Some("s1"));
        assert_eq!(envelope.data["steps"], 2);
    }
}
