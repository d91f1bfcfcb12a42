//! HTTP surface for the agent gateway.
//!
//! Provides:
//! - `DualPathDispatcher` - Direct or live-debug execution per call
//! - Loopback launchers (in-process and HTTP)
//! - Axum router with SSE monitors and debug session polling
//! - Gateway configuration and error mapping

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod loopback;
pub mod protocol;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, GatewayConfig, LoopbackMode};
pub use dispatcher::{DispatcherBuilder, DualPathDispatcher, InboundCall};
pub use error::GatewayError;
pub use loopback::{HttpLoopback, InProcessLoopback, Loopback, LoopbackError};
pub use protocol::{DebugSessionResponse, DispatchResponse, HealthResponse, StopAck};
pub use router::create_router;
