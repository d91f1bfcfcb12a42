//! Single-shot delayed action with a restartable deadline.

use std::time::Duration;

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep_until},
};

/// A cancellable, restartable one-shot timer.
///
/// The action runs on the timer's own task when the current deadline
/// passes. `restart` slides the deadline forward; dropping the timer
/// cancels it.
///
/// The action returns whether it took effect. Returning `false` means
/// the deadline moved while it was firing; the timer then waits for the
/// next restart and fires again at the new deadline.
#[derive(Debug)]
pub struct EvictionTimer {
    delay: Duration,
    deadline_tx: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

impl EvictionTimer {
    /// Start a timer that fires `on_fire` after `delay`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<F>(delay: Duration, mut on_fire: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (deadline_tx, mut deadline_rx) = watch::channel(Instant::now() + delay);

        let task = tokio::spawn(async move {
            loop {
                let deadline = *deadline_rx.borrow_and_update();
                tokio::select! {
                    () = sleep_until(deadline) => {
                        if on_fire() || deadline_rx.changed().await.is_err() {
                            return;
                        }
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self {
            delay,
            deadline_tx,
            task,
        }
    }

    /// Push the deadline to `now + delay`.
    pub fn restart(&self) {
        self.deadline_tx.send_replace(Instant::now() + self.delay);
    }

    /// Current deadline.
    #[must_use]
    pub fn deadline(&self) -> Instant {
        *self.deadline_tx.borrow()
    }

    /// Window length this timer was started with.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the action has taken effect (or the timer was cancelled).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the timer without running the action.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for EvictionTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
