//! Debounced push scheduling.
//!
//! Bursts of local changes collapse into one outbound push per debounce
//! window: every change restarts a single timer, and when the timer expires
//! the coordinator reports one [`PushDue`] covering the union of collections
//! changed since the last successful push. A failed push is retried on its
//! own after a backoff that doubles with each consecutive failure.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::types::CollectionName;

/// Upper bound for the retry backoff after failed pushes.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Signal that a debounce window expired.
///
/// Carries the timer generation so a signal raced by a newer change can be
/// recognised as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushDue {
    pub generation: u64,
}

/// Result of a user-initiated push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// These collections were delivered
    Pushed(Vec<CollectionName>),
    /// Another pull or push held the gate
    Busy,
}

/// The single, cancelable debounce timer.
struct DebounceTimer {
    handle: JoinHandle<()>,
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Collects changed collections and schedules their push.
pub struct PushCoordinator {
    window: Duration,
    pending: BTreeSet<CollectionName>,
    timer: Option<DebounceTimer>,
    generation: u64,
    deferred: bool,
    failures: u32,
    due_tx: mpsc::UnboundedSender<PushDue>,
}

impl PushCoordinator {
    /// Create a coordinator reporting expiries on `due_tx`.
    pub fn new(window: Duration, due_tx: mpsc::UnboundedSender<PushDue>) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            timer: None,
            generation: 0,
            deferred: false,
            failures: 0,
            due_tx,
        }
    }

    /// Record changed collections and restart the debounce window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_local_change(&mut self, names: impl IntoIterator<Item = CollectionName>) {
        self.pending.extend(names);
        if !self.pending.is_empty() {
            self.arm();
        }
    }

    fn arm(&mut self) {
        self.arm_in(self.window);
    }

    fn arm_in(&mut self, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let deadline = tokio::time::Instant::now() + delay;
        let due_tx = self.due_tx.clone();

        // Replacing the timer drops (and aborts) the previous one.
        self.timer = Some(DebounceTimer {
            handle: tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let _ = due_tx.send(PushDue { generation });
            }),
        });
        trace!(generation, ?delay, pending = self.pending.len(), "Push timer armed");
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Take the pending collections for an expired window.
    ///
    /// Returns `None` when `due` is stale (a newer change restarted the
    /// window after it fired).
    pub fn take_due(&mut self, due: PushDue) -> Option<Vec<CollectionName>> {
        if due.generation != self.generation {
            trace!(due = due.generation, current = self.generation, "Stale push signal");
            return None;
        }
        self.timer = None;
        Some(std::mem::take(&mut self.pending).into_iter().collect())
    }

    /// Take everything pending right now, cancelling the window.
    pub fn take_all(&mut self) -> Vec<CollectionName> {
        self.timer = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Return collections of a failed push to the pending set and schedule
    /// a retry. Returns the backoff used.
    pub fn restore(&mut self, names: impl IntoIterator<Item = CollectionName>) -> Duration {
        self.pending.extend(names);
        self.failures = self.failures.saturating_add(1);
        let delay = self.retry_delay();
        if !self.pending.is_empty() {
            self.arm_in(delay);
        }
        delay
    }

    fn retry_delay(&self) -> Duration {
        let doublings = self.failures.saturating_sub(1).min(16);
        self.window
            .saturating_mul(1u32 << doublings)
            .min(MAX_RETRY_DELAY)
    }

    /// A push went through; the next failure starts the backoff over.
    pub fn succeeded(&mut self) {
        self.failures = 0;
    }

    /// Keep collections pending without arming a timer. Used for pushes that
    /// only reached local paths while the real-time link was down; they go
    /// out again once it reconnects.
    pub fn hold(&mut self, names: impl IntoIterator<Item = CollectionName>) {
        self.pending.extend(names);
    }

    /// Park a push that came due while the sync gate was held.
    pub fn defer(&mut self, names: impl IntoIterator<Item = CollectionName>) {
        self.pending.extend(names);
        self.deferred = true;
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Re-arm a deferred push once the gate is released.
    ///
    /// Returns `true` if a window was armed.
    pub fn release_deferred(&mut self) -> bool {
        if !self.deferred {
            return false;
        }
        self.deferred = false;
        self.rearm_if_pending()
    }

    /// Arm the window if anything is pending and no timer runs.
    pub fn rearm_if_pending(&mut self) -> bool {
        if self.pending.is_empty() || self.is_armed() {
            return false;
        }
        self.arm();
        true
    }

    /// Drop a collection from the pending set (its remote value was applied).
    pub fn forget(&mut self, name: CollectionName) {
        self.pending.remove(&name);
        if self.pending.is_empty() {
            self.timer = None;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = CollectionName> + '_ {
        self.pending.iter().copied()
    }
}
