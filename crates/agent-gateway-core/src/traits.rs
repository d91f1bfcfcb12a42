//! Traits for the collaborators the gateway drives.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    push::EventEmitter,
    request::{ExecutionRequest, ExecutionResultEnvelope},
};

/// Cause reported by executions terminated by an operator.
pub const KILLED_CAUSE: &str = "AGENT_KILLED";

/// An execution subject resolved for a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// Owner key (at most one pending debug session per key).
    pub owner_key: String,
    /// Subject allows live debug sessions.
    #[serde(default)]
    pub debug_session_enabled: bool,
}

impl Subject {
    /// Create a subject.
    #[must_use]
    pub fn new(owner_key: impl Into<String>, debug_session_enabled: bool) -> Self {
        Self {
            owner_key: owner_key.into(),
            debug_session_enabled,
        }
    }
}

/// Executor error.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("AGENT_KILLED")]
    Killed,
    #[error("Execution failed: {message}")]
    Failed {
        /// Status to surface, if the executor chose one.
        status: Option<u16>,
        /// Human-readable cause.
        message: String,
        /// Extra payload merged into the error body.
        body: Value,
    },
    #[error("Executor unavailable: {0}")]
    Unavailable(String),
}

impl ExecutorError {
    /// A failure without status or payload.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            status: None,
            message: message.into(),
            body: Value::Null,
        }
    }

    /// Whether this is the expected operator-kill cause.
    #[must_use]
    pub const fn is_killed(&self) -> bool {
        matches!(self, Self::Killed)
    }
}

/// Trait for the engine that runs executions.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one execution to completion or to a paused state.
    ///
    /// Step events go to `emitter`; the executor only ever writes to
    /// it and never sees the connection registry.
    async fn run(
        &self,
        request: ExecutionRequest,
        emitter: EventEmitter,
    ) -> Result<ExecutionResultEnvelope, ExecutorError>;

    /// Read a debug state snapshot.
    async fn read_snapshot(
        &self,
        request: &ExecutionRequest,
        state_id: &str,
    ) -> Result<Value, ExecutorError>;
}

/// Trait for resolving the subject of a call.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    /// Look up a subject by owner key and optional deployed version.
    async fn lookup(&self, owner_key: &str, version: Option<&str>) -> Option<Subject>;

    /// Owner key served under a host name, for calls without an explicit id.
    async fn owner_for_host(&self, _host: &str) -> Option<String> {
        None
    }
}

/// Trait for per-subject stored mock outputs.
#[async_trait]
pub trait MockDataSource: Send + Sync {
    /// Stored outputs keyed by component id, as `{ data: { outputs } }`.
    async fn mock_data(&self, owner_key: &str) -> Result<Value, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_renders_as_cause() {
        assert_eq!(ExecutorError::Killed.to_string(), KILLED_CAUSE);
        assert!(ExecutorError::Killed.is_killed());
        assert!(!ExecutorError::failed("boom").is_killed());
    }
}
