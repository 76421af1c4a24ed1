//! Timer registry (C8): tracks timers announced by the upstream server and
//! runs their countdowns locally.
//!
//! The registry is a single actor confined to one task — its map is never
//! shared directly across tasks, matching the "no shared mutable maps"
//! resource-model rule. Callers interact through [`TimerRegistryHandle`],
//! which forwards commands over a channel.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, LifecycleEvent};

/// A timer as announced by the upstream server (§3 DATA MODEL).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timer {
    pub id: String,
    pub name: Option<String>,
    pub total_seconds: f64,
    pub remaining_seconds: f64,
    pub is_active: bool,
    pub started_hr_ts: i64,
    pub is_paused: bool,
    pub paused_hr_ts: Option<i64>,
}

enum Command {
    Started(Timer),
    Updated(Timer),
    Cancelled(String),
    Fired(String),
}

/// A lightweight, cloneable reference to a running [`TimerRegistry`] actor.
#[derive(Clone)]
pub struct TimerRegistryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl TimerRegistryHandle {
    pub fn on_started(&self, timer: Timer) {
        let _ = self.tx.send(Command::Started(timer));
    }

    pub fn on_updated(&self, timer: Timer) {
        let _ = self.tx.send(Command::Updated(timer));
    }

    pub fn on_cancelled(&self, id: impl Into<String>) {
        let _ = self.tx.send(Command::Cancelled(id.into()));
    }
}

/// Entry held by the registry actor: the timer plus a cancellation handle
/// for its countdown task.
struct Entry {
    timer: Timer,
    countdown_cancel: CancellationToken,
    /// Monotonic instant `remaining_seconds` was last anchored to (used to
    /// recompute remaining time on `OnUpdated` without trusting server
    /// wall-clock timestamps, per §4.8).
    anchored_at: Instant,
}

/// The timer registry actor (C8). Spawn via [`TimerRegistry::spawn`].
pub struct TimerRegistry {
    entries: HashMap<String, Entry>,
    emitter: std::sync::Arc<dyn EventEmitter>,
    cancel: CancellationToken,
}

impl TimerRegistry {
    /// Spawns the actor task and returns a handle to it.
    pub fn spawn(
        emitter: std::sync::Arc<dyn EventEmitter>,
        cancel: CancellationToken,
    ) -> TimerRegistryHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let fire_tx = tx.clone();
        let mut registry = TimerRegistry {
            entries: HashMap::new(),
            emitter,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = rx.recv() => {
                        match cmd {
                            Some(cmd) => registry.handle(cmd, &fire_tx),
                            None => break,
                        }
                    }
                }
            }
        });

        TimerRegistryHandle { tx }
    }

    fn handle(&mut self, cmd: Command, fire_tx: &mpsc::UnboundedSender<Command>) {
        match cmd {
            Command::Started(timer) => self.start_or_replace(timer, fire_tx),
            Command::Updated(timer) => self.update(timer, fire_tx),
            Command::Cancelled(id) => self.cancel_one(&id),
            Command::Fired(id) => self.fire(id),
        }
    }

    fn start_or_replace(&mut self, timer: Timer, fire_tx: &mpsc::UnboundedSender<Command>) {
        if let Some(prev) = self.entries.remove(&timer.id) {
            prev.countdown_cancel.cancel();
        }
        let entry = self.schedule(timer.clone(), fire_tx);
        self.entries.insert(timer.id.clone(), entry);
        self.emitter.emit(LifecycleEvent::TimerStarted { timer });
    }

    fn update(&mut self, timer: Timer, fire_tx: &mpsc::UnboundedSender<Command>) {
        if let Some(prev) = self.entries.remove(&timer.id) {
            prev.countdown_cancel.cancel();
        }
        let entry = self.schedule(timer.clone(), fire_tx);
        self.entries.insert(timer.id.clone(), entry);
        self.emitter.emit(LifecycleEvent::TimerUpdated { timer });
    }

    fn cancel_one(&mut self, id: &str) {
        match self.entries.remove(id) {
            Some(entry) => {
                entry.countdown_cancel.cancel();
                self.emitter
                    .emit(LifecycleEvent::TimerCancelled { id: id.to_string() });
            }
            None => {
                tracing::debug!(id, "timer-cancelled for unknown id, ignoring");
            }
        }
    }

    fn fire(&mut self, id: String) {
        if self.entries.remove(&id).is_some() {
            self.emitter
                .emit(LifecycleEvent::TimerFinished { id: id.clone() });
        }
    }

    /// Schedules (or, if paused, does not schedule) a countdown task for
    /// `timer`, returning the registry entry for it.
    fn schedule(&self, timer: Timer, fire_tx: &mpsc::UnboundedSender<Command>) -> Entry {
        let countdown_cancel = self.cancel.child_token();
        let anchored_at = Instant::now();

        if !timer.is_paused {
            let remaining = Duration::from_secs_f64(timer.remaining_seconds.max(0.0));
            let id = timer.id.clone();
            let fire_tx = fire_tx.clone();
            let token = countdown_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(remaining) => {
                        let _ = fire_tx.send(Command::Fired(id));
                    }
                }
            });
        }

        Entry {
            timer,
            countdown_cancel,
            anchored_at,
        }
    }
}

/// Derives the live `remaining_seconds` projection for a timer that is not
/// paused, given how long ago it was anchored (§3: `remaining_seconds` is a
/// derived projection when not paused).
pub fn project_remaining(timer: &Timer, elapsed: Duration) -> f64 {
    if timer.is_paused {
        timer.remaining_seconds
    } else {
        (timer.remaining_seconds - elapsed.as_secs_f64()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_timer(id: &str, remaining: f64) -> Timer {
        Timer {
            id: id.to_string(),
            name: None,
            total_seconds: remaining,
            remaining_seconds: remaining,
            is_active: true,
            started_hr_ts: 0,
            is_paused: false,
            paused_hr_ts: None,
        }
    }

    #[test]
    fn projection_holds_steady_while_paused() {
        let mut t = sample_timer("t1", 10.0);
        t.is_paused = true;
        assert_eq!(project_remaining(&t, Duration::from_secs(5)), 10.0);
    }

    #[test]
    fn projection_counts_down_while_active() {
        let t = sample_timer("t1", 10.0);
        assert_eq!(project_remaining(&t, Duration::from_secs(3)), 7.0);
    }

    #[test]
    fn projection_floors_at_zero() {
        let t = sample_timer("t1", 2.0);
        assert_eq!(project_remaining(&t, Duration::from_secs(5)), 0.0);
    }

    #[tokio::test]
    async fn cancelling_unknown_timer_is_a_noop() {
        let emitter = std::sync::Arc::new(crate::events::NoopEventEmitter);
        let cancel = CancellationToken::new();
        let handle = TimerRegistry::spawn(emitter, cancel.clone());
        handle.on_cancelled("does-not-exist");
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn started_then_updated_reschedules_without_duplicate_fire() {
        let emitter = std::sync::Arc::new(crate::events::NoopEventEmitter);
        let cancel = CancellationToken::new();
        let handle = TimerRegistry::spawn(emitter, cancel.clone());
        handle.on_started(sample_timer("t1", 60.0));
        handle.on_updated(sample_timer("t1", 30.0));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    }
}
