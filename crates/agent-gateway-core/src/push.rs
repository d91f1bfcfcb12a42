//! Registry of long-lived push connections with sliding idle eviction.
//!
//! Observers open a stream and get back a connection id. Executions
//! later ask for that id to be attached; every write goes through the
//! registry so it can slide the connection's idle window.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::{
    event::{PushFrame, StepEvent},
    timer::EvictionTimer,
};

/// Default idle window (1 hour).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Push connection identifier.
pub type ConnectionId = String;

struct Entry {
    sender: mpsc::UnboundedSender<PushFrame>,
    timer: EvictionTimer,
    last_activity_at: Instant,
}

struct Inner {
    connections: Mutex<HashMap<ConnectionId, Entry>>,
    idle_timeout: Duration,
}

impl Inner {
    fn write(&self, connection_id: &str, frame: PushFrame) -> bool {
        let mut connections = self.connections.lock();
        let Some(entry) = connections.get_mut(connection_id) else {
            trace!(connection_id, "Write to unknown push connection ignored");
            return false;
        };

        if entry.sender.send(frame).is_ok() {
            entry.timer.restart();
            entry.last_activity_at = Instant::now();
            return true;
        }

        // Receiver is gone but its guard has not run yet.
        let stale = connections.remove(connection_id);
        drop(connections);
        drop(stale);
        false
    }

    // Dropping the returned entry drops the sender, which ends the stream.
    fn remove(&self, connection_id: &str) -> Option<Entry> {
        self.connections.lock().remove(connection_id)
    }

    /// Evict the connection if its idle deadline has passed. Returns
    /// `false` when a write slid the deadline after the timer fired.
    fn evict_if_idle(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.lock();
        let Some(entry) = connections.get(connection_id) else {
            return true;
        };
        if entry.timer.deadline() > Instant::now() {
            trace!(connection_id, "Push connection written to, eviction skipped");
            return false;
        }
        let evicted = connections.remove(connection_id);
        drop(connections);
        drop(evicted);
        info!(connection_id, "Push connection idle, evicted");
        true
    }
}

/// Process-wide registry of open push connections.
///
/// Cheap to clone; all clones share the same mapping.
#[derive(Clone)]
pub struct PushConnectionRegistry {
    inner: Arc<Inner>,
}

impl Default for PushConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl fmt::Debug for PushConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushConnectionRegistry")
            .field("connections", &self.len())
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

impl PushConnectionRegistry {
    /// Create a registry evicting connections idle for `idle_timeout`.
    #[must_use]
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                idle_timeout,
            }),
        }
    }

    /// Open a new connection.
    ///
    /// The returned stream yields the `init` frame (carrying the id)
    /// first. Dropping the stream closes the connection.
    #[must_use]
    pub fn open(&self) -> (ConnectionId, PushStream) {
        let connection_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        {
            let mut connections = self.inner.connections.lock();
            // Created under the lock so eviction cannot run before the insert.
            let weak = Arc::downgrade(&self.inner);
            let evicted_id = connection_id.clone();
            let timer = EvictionTimer::start(self.inner.idle_timeout, move || {
                weak.upgrade().is_none_or(|inner| inner.evict_if_idle(&evicted_id))
            });
            connections.insert(
                connection_id.clone(),
                Entry {
                    sender,
                    timer,
                    last_activity_at: Instant::now(),
                },
            );
        }

        self.inner
            .write(&connection_id, PushFrame::init(&connection_id));
        info!(connection_id = %connection_id, "Push connection opened");

        let stream = PushStream {
            connection_id: connection_id.clone(),
            receiver,
            registry: Arc::downgrade(&self.inner),
        };
        (connection_id, stream)
    }

    /// Write a frame to a connection, sliding its idle window.
    ///
    /// Returns `false` if the connection does not exist.
    pub fn write(&self, connection_id: &str, frame: PushFrame) -> bool {
        self.inner.write(connection_id, frame)
    }

    /// Write a step event to a connection.
    pub fn send_event(&self, connection_id: &str, event: &StepEvent) -> bool {
        self.inner.write(connection_id, event.to_frame())
    }

    /// Hand a sink for every live id in `connection_ids` to `consumer`.
    ///
    /// Unknown ids are skipped. Returns how many sinks were handed out.
    pub fn attach<I, S, F>(&self, connection_ids: I, mut consumer: F) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(PushSink),
    {
        let live: Vec<ConnectionId> = {
            let connections = self.inner.connections.lock();
            let mut seen = HashSet::new();
            connection_ids
                .into_iter()
                .filter_map(|id| {
                    let id = id.as_ref();
                    (connections.contains_key(id) && seen.insert(id.to_string()))
                        .then(|| id.to_string())
                })
                .collect()
        };

        for connection_id in &live {
            debug!(connection_id = %connection_id, "Attaching push connection");
            consumer(PushSink {
                connection_id: connection_id.clone(),
                registry: Arc::downgrade(&self.inner),
            });
        }
        live.len()
    }

    /// Collect sinks for the live ids into an emitter.
    #[must_use]
    pub fn emitter_for<I, S>(&self, connection_ids: I) -> EventEmitter
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut emitter = EventEmitter::default();
        self.attach(connection_ids, |sink| emitter.add(sink));
        emitter
    }

    /// Close a connection. Returns `false` if it was already gone.
    pub fn close(&self, connection_id: &str) -> bool {
        let closed = self.inner.remove(connection_id).is_some();
        if closed {
            info!(connection_id, "Push connection closed");
        }
        closed
    }

    /// Close every connection, returning how many were open.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, Entry)> =
            self.inner.connections.lock().drain().collect();
        info!(count = drained.len(), "Closing all push connections");
        drained.len()
    }

    /// Whether a connection is open.
    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.inner.connections.lock().contains_key(connection_id)
    }

    /// Time of the last write to a connection.
    #[must_use]
    pub fn last_activity(&self, connection_id: &str) -> Option<Instant> {
        self.inner
            .connections
            .lock()
            .get(connection_id)
            .map(|entry| entry.last_activity_at)
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Whether no connections are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving half of a push connection.
///
/// Ends when the connection is evicted or closed. Dropping it (the
/// transport went away) removes the connection from the registry.
pub struct PushStream {
    connection_id: ConnectionId,
    receiver: mpsc::UnboundedReceiver<PushFrame>,
    registry: Weak<Inner>,
}

impl PushStream {
    /// Id of the connection this stream belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Stream for PushStream {
    type Item = PushFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if inner.remove(&self.connection_id).is_some() {
                info!(connection_id = %self.connection_id, "Push client disconnected");
            }
        }
    }
}

/// Write capability for one push connection.
///
/// Writes are routed back through the registry and become no-ops once
/// the connection is gone.
#[derive(Clone)]
pub struct PushSink {
    connection_id: ConnectionId,
    registry: Weak<Inner>,
}

impl fmt::Debug for PushSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PushSink").field(&self.connection_id).finish()
    }
}

impl PushSink {
    /// Id of the underlying connection.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Write a step event. Returns `false` if the connection is gone.
    pub fn send(&self, event: &StepEvent) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|inner| inner.write(&self.connection_id, event.to_frame()))
    }
}

/// Fan-out over the push sinks attached to one execution.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    sinks: Vec<PushSink>,
}

impl EventEmitter {
    /// Add a sink, ignoring duplicates.
    pub fn add(&mut self, sink: PushSink) {
        if !self
            .sinks
            .iter()
            .any(|s| s.connection_id == sink.connection_id)
        {
            self.sinks.push(sink);
        }
    }

    /// Merge another emitter's sinks into this one.
    pub fn merge(&mut self, other: &Self) {
        for sink in &other.sinks {
            self.add(sink.clone());
        }
    }

    /// Emit an event to every sink, returning how many accepted it.
    pub fn emit(&self, event: &StepEvent) -> usize {
        self.sinks.iter().filter(|sink| sink.send(event)).count()
    }

    /// Ids of the attached connections.
    pub fn connection_ids(&self) -> impl Iterator<Item = &str> {
        self.sinks.iter().map(PushSink::connection_id)
    }

    /// Number of attached sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
