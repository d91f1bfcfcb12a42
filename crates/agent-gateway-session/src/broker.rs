//! Broker for pending debug sessions.
//!
//! A debug call registers a session under the subject's owner key and
//! waits on it. The paused execution, a stop call, the deadline, or a
//! newer registration settles it. Whichever path removes the entry from
//! the map first is the only one that gets to deliver an outcome.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use agent_gateway_core::{EventEmitter, EvictionTimer};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default session lifetime (1 hour).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// Why a pending session ended without a result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Debug Session Expired")]
    Expired,
    #[error("Debug Session Stopped")]
    Stopped,
    #[error("Debug session interrupted by another request")]
    Interrupted { previous_token: String },
    #[error("Debug session abandoned")]
    Abandoned,
}

/// Outcome delivered to a session's waiter.
pub type SessionOutcome = Result<Value, SessionError>;

struct Entry {
    token: String,
    sender: oneshot::Sender<SessionOutcome>,
    timer: EvictionTimer,
    attached: Option<EventEmitter>,
}

impl Entry {
    fn settle(self, outcome: SessionOutcome) -> bool {
        let Self { sender, timer, .. } = self;
        timer.cancel();
        sender.send(outcome).is_ok()
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl Inner {
    /// Remove the entry for `owner_key`, if present and (when given) holding `token`.
    fn take(&self, owner_key: &str, token: Option<&str>) -> Option<Entry> {
        let mut sessions = self.sessions.lock();
        let current = sessions.get(owner_key)?;
        if token.is_some_and(|t| t != current.token) {
            return None;
        }
        sessions.remove(owner_key)
    }

    fn expire(&self, owner_key: &str, token: &str) -> bool {
        let Some(entry) = self.take(owner_key, Some(token)) else {
            return false;
        };
        warn!(owner_key, token, "Debug session expired");
        entry.settle(Err(SessionError::Expired));
        true
    }
}

/// Process-wide broker of pending debug sessions, keyed by owner.
///
/// Cheap to clone; all clones share the same mapping.
#[derive(Clone)]
pub struct SessionBroker {
    inner: Arc<Inner>,
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl fmt::Debug for SessionBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBroker")
            .field("sessions", &self.len())
            .field("ttl", &self.inner.ttl)
            .finish()
    }
}

impl SessionBroker {
    /// Create a broker whose sessions expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                ttl,
            }),
        }
    }

    /// Register a new pending session for `owner_key`.
    ///
    /// An existing session for the same owner is rejected with
    /// `SessionError::Interrupted` before the new one is installed.
    #[must_use]
    pub fn register(&self, owner_key: &str, attached: Option<EventEmitter>) -> PendingSession {
        let token = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        let created_at = SystemTime::now();
        let deadline = Instant::now() + self.inner.ttl;

        {
            let mut sessions = self.inner.sessions.lock();

            if let Some(previous) = sessions.remove(owner_key) {
                warn!(
                    owner_key,
                    previous_token = %previous.token,
                    token = %token,
                    "Debug session already running, interrupting it"
                );
                let previous_token = previous.token.clone();
                previous.settle(Err(SessionError::Interrupted { previous_token }));
            }

            let weak = Arc::downgrade(&self.inner);
            let (expired_owner, expired_token) = (owner_key.to_string(), token.clone());
            let timer = EvictionTimer::start(self.inner.ttl, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.expire(&expired_owner, &expired_token);
                }
                true
            });

            sessions.insert(
                owner_key.to_string(),
                Entry {
                    token: token.clone(),
                    sender,
                    timer,
                    attached,
                },
            );
        }

        info!(owner_key, token = %token, "Debug session started");

        PendingSession {
            owner_key: owner_key.to_string(),
            token,
            created_at,
            deadline,
            receiver: Some(receiver),
            broker: Arc::downgrade(&self.inner),
            settled: false,
        }
    }

    /// Fulfil the session with `result`.
    ///
    /// No-op (returns `false`) when nothing is pending for `owner_key`
    /// or the pending session holds a different token.
    pub fn resolve(&self, owner_key: &str, token: &str, result: Value) -> bool {
        let Some(entry) = self.inner.take(owner_key, Some(token)) else {
            debug!(owner_key, token, "No matching debug session to resolve");
            return false;
        };
        info!(owner_key, token, "Debug session resolved with final result");
        entry.settle(Ok(result));
        true
    }

    /// Reject the session holding `token` with `error`.
    pub fn reject(&self, owner_key: &str, token: &str, error: SessionError) -> bool {
        let Some(entry) = self.inner.take(owner_key, Some(token)) else {
            return false;
        };
        info!(owner_key, token, reason = %error, "Debug session rejected");
        entry.settle(Err(error));
        true
    }

    /// Stop whatever session is pending for `owner_key`.
    pub fn stop(&self, owner_key: &str) -> bool {
        let Some(entry) = self.inner.take(owner_key, None) else {
            debug!(owner_key, "Stop requested but no debug session is pending");
            return false;
        };
        info!(owner_key, token = %entry.token, "Debug session stopped");
        entry.settle(Err(SessionError::Stopped));
        true
    }

    /// Expire the session holding `token` now.
    pub fn expire(&self, owner_key: &str, token: &str) -> bool {
        self.inner.expire(owner_key, token)
    }

    /// Token of the pending session, if any.
    #[must_use]
    pub fn peek_token(&self, owner_key: &str) -> Option<String> {
        self.inner
            .sessions
            .lock()
            .get(owner_key)
            .map(|entry| entry.token.clone())
    }

    /// Observers attached when the pending session was registered.
    #[must_use]
    pub fn attached_emitter(&self, owner_key: &str) -> Option<EventEmitter> {
        self.inner
            .sessions
            .lock()
            .get(owner_key)
            .and_then(|entry| entry.attached.clone())
    }

    /// Whether a session is pending for `owner_key`.
    #[must_use]
    pub fn contains(&self, owner_key: &str) -> bool {
        self.inner.sessions.lock().contains_key(owner_key)
    }

    /// Number of pending sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Whether no sessions are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Waiter side of a registered session.
///
/// Dropping it before an outcome arrives withdraws the session, as long
/// as it has not been replaced in the meantime.
pub struct PendingSession {
    owner_key: String,
    token: String,
    created_at: SystemTime,
    deadline: Instant,
    receiver: Option<oneshot::Receiver<SessionOutcome>>,
    broker: Weak<Inner>,
    settled: bool,
}

impl fmt::Debug for PendingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSession")
            .field("owner_key", &self.owner_key)
            .field("token", &self.token)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl PendingSession {
    /// Owner key this session is registered under.
    #[must_use]
    pub fn owner_key(&self) -> &str {
        &self.owner_key
    }

    /// Session token handed to the paused execution.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Registration time.
    #[must_use]
    pub const fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Instant at which the session expires.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for the session's outcome.
    ///
    /// Always completes by the deadline.
    pub async fn outcome(mut self) -> SessionOutcome {
        let Some(receiver) = self.receiver.take() else {
            return Err(SessionError::Abandoned);
        };
        let outcome = receiver.await.unwrap_or(Err(SessionError::Abandoned));
        self.settled = true;
        outcome
    }
}

impl Drop for PendingSession {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(inner) = self.broker.upgrade() else {
            return;
        };
        if let Some(entry) = inner.take(&self.owner_key, Some(&self.token)) {
            debug!(
                owner_key = %self.owner_key,
                token = %self.token,
                "Debug session waiter went away, withdrawing session"
            );
            entry.settle(Err(SessionError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_gateway_core::PushConnectionRegistry;
    use serde_json::json;

    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    #[tokio::test]
    async fn second_registration_interrupts_the_first() {
        let broker = SessionBroker::default();
        let first = broker.register("agent-1", None);
        let first_token = first.token().to_string();
        let second = broker.register("agent-1", None);

        assert_eq!(
            first.outcome().await,
            Err(SessionError::Interrupted {
                previous_token: first_token
            })
        );
        assert_eq!(broker.peek_token("agent-1").as_deref(), Some(second.token()));
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test]
    async fn resolve_is_one_shot() {
        let broker = SessionBroker::default();
        let session = broker.register("agent-1", None);
        let token = session.token().to_string();

        assert!(broker.resolve("agent-1", &token, json!({ "answer": 42 })));
        assert!(!broker.resolve("agent-1", &token, json!("again")));
        assert!(!broker.reject("agent-1", &token, SessionError::Stopped));
        assert!(!broker.expire("agent-1", &token));
        assert!(!broker.stop("agent-1"));

        assert_eq!(session.outcome().await, Ok(json!({ "answer": 42 })));
        assert!(broker.peek_token("agent-1").is_none());
    }

    #[tokio::test]
    async fn outcome_stays_pending_until_resolved() {
        let broker = SessionBroker::default();
        let session = broker.register("agent-1", None);
        let token = session.token().to_string();
        let mut outcome = tokio_test::task::spawn(session.outcome());

        tokio_test::assert_pending!(outcome.poll());
        assert!(broker.resolve("agent-1", &token, json!("done")));
        assert!(outcome.is_woken());
        tokio_test::assert_ready_eq!(outcome.poll(), Ok(json!("done")));
    }

    #[tokio::test]
    async fn stale_token_cannot_resolve_the_replacement() {
        let broker = SessionBroker::default();
        let stale = broker.register("agent-1", None);
        let stale_token = stale.token().to_string();
        let current = broker.register("agent-1", None);

        assert!(!broker.resolve("agent-1", &stale_token, json!("stale")));
        assert!(broker.contains("agent-1"));

        let token = current.token().to_string();
        assert!(broker.resolve("agent-1", &token, json!("fresh")));
        assert_eq!(current.outcome().await, Ok(json!("fresh")));
        drop(stale);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_session_expires_at_deadline() {
        let broker = SessionBroker::new(HOUR);
        let started = Instant::now();
        let session = broker.register("agent-1", None);
        assert_eq!(session.deadline(), started + HOUR);

        let outcome = session.outcome().await;

        assert_eq!(outcome, Err(SessionError::Expired));
        assert!(started.elapsed() >= HOUR);
        assert!(!broker.contains("agent-1"));
    }

    #[tokio::test]
    async fn stop_rejects_pending_session() {
        let broker = SessionBroker::default();
        let session = broker.register("agent-1", None);
        let other = broker.register("agent-2", None);

        assert!(broker.stop("agent-1"));
        assert!(!broker.stop("agent-1"));
        assert_eq!(session.outcome().await, Err(SessionError::Stopped));
        assert!(broker.contains("agent-2"));
        drop(other);
    }

    #[tokio::test]
    async fn stop_without_session_is_noop() {
        let broker = SessionBroker::default();
        let _other = broker.register("agent-2", None);
        assert!(!broker.stop("agent-1"));
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test]
    async fn dropped_waiter_withdraws_its_session() {
        let broker = SessionBroker::default();
        let session = broker.register("agent-1", None);
        drop(session);
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn dropped_stale_waiter_keeps_the_replacement() {
        let broker = SessionBroker::default();
        let stale = broker.register("agent-1", None);
        let current = broker.register("agent-1", None);
        drop(stale);
        assert_eq!(broker.peek_token("agent-1").as_deref(), Some(current.token()));
    }

    #[tokio::test]
    async fn attached_observers_are_exposed() {
        let registry = PushConnectionRegistry::default();
        let (id, _stream) = registry.open();
        let broker = SessionBroker::default();
        let _session = broker.register("agent-1", Some(registry.emitter_for([&id])));

        let emitter = broker.attached_emitter("agent-1").unwrap();
        assert_eq!(emitter.connection_ids().collect::<Vec<_>>(), vec![id.as_str()]);
        assert!(broker.attached_emitter("agent-2").is_none());
    }
}
