//! Core primitives for the agent gateway.
//!
//! This crate provides the fundamental building blocks:
//! - `EvictionTimer` - Cancellable, restartable one-shot timer
//! - `PushConnectionRegistry` - Push streams with sliding idle eviction
//! - `StepEvent` - Execution events relayed to observers
//! - `ExecutionRequest` / `RequestIntent` - Typed request model
//! - Executor and collaborator traits

pub mod event;
pub mod push;
pub mod request;
pub mod timer;
pub mod traits;

pub use event::{PushFrame, StepEvent};
pub use push::{ConnectionId, EventEmitter, PushConnectionRegistry, PushSink, PushStream};
pub use request::{
    ControlIntent, EndpointKind, EndpointPath, ExecutionRequest, ExecutionResultEnvelope,
    MarkerPolicy, RequestIntent,
};
pub use timer::EvictionTimer;
pub use traits::{Executor, ExecutorError, MockDataSource, Subject, SubjectDirectory};
