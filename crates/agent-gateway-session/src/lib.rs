//! Debug session brokering for the agent gateway.
//!
//! Provides:
//! - `SessionBroker` - One pending session per owner, with preemption,
//!   stop, and deadline expiry
//! - `PendingSession` - The waiter side of a registered session

pub mod broker;

pub use broker::{
    DEFAULT_SESSION_TTL, PendingSession, SessionBroker, SessionError, SessionOutcome,
};
