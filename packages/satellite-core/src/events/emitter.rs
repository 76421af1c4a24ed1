//! Event emitter abstraction for decoupling the state machine from fan-out.
//!
//! The state machine depends on [`EventEmitter`] rather than a concrete
//! channel, so tests can observe emitted events and alternate sinks (a
//! no-op sink for config validation, a logging sink for `--debug`) can be
//! swapped in without touching state machine logic.

use super::LifecycleEvent;

/// Trait for emitting lifecycle events without knowledge of fan-out.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: LifecycleEvent);
}

/// Discards every event. Used where an emitter is required structurally but
/// no observer is configured (e.g. during config validation).
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: LifecycleEvent) {}
}

/// Logs every event at debug level via `tracing`. The default emitter when
/// no richer sink is wired.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(?event, "lifecycle_event");
    }
}

/// Forwards every emitted event onto the fan-out dispatcher's inbox
/// (§4.7 C7). This is the emitter the composition root wires the state
/// machine, timer registry, and wake coordinator to.
pub struct ChannelEventEmitter {
    tx: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>,
}

impl ChannelEventEmitter {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self { tx }
    }
}

impl EventEmitter for ChannelEventEmitter {
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: LifecycleEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter {
            count: AtomicUsize::new(0),
        });
        emitter.emit(LifecycleEvent::Startup);
        emitter.emit(LifecycleEvent::Connected);
        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn noop_emitter_accepts_anything() {
        let emitter = NoopEventEmitter;
        emitter.emit(LifecycleEvent::Disconnected);
    }
}
