//! Lifecycle event model for the satellite runtime.
//!
//! This module provides:
//! - [`LifecycleEvent`], the closed tagged variant the state machine emits
//! - [`EventEnvelope`], the wire-adjacent shape a Wyoming frame's header/data
//!   section is parsed into before being classified
//! - [`EventEmitter`] and its default sinks, for components that only need
//!   to observe events rather than participate in fan-out (tests, logging)

mod emitter;
pub mod fanout;

pub use emitter::{ChannelEventEmitter, EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timers::Timer;

/// The parsed shape of a single Wyoming frame's header + optional data
/// section, before it has been classified into a [`LifecycleEvent`].
///
/// The framing codec (see [`crate::protocol::framing`]) always produces one
/// of these; the binary payload (if any) is carried separately since most
/// event types never need to look at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(skip)]
    pub payload_length: Option<usize>,
}

impl EventEnvelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            payload_length: None,
        }
    }

    pub fn with_data(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data: Some(data),
            payload_length: None,
        }
    }

    /// Reads a single field out of `data` as a string, if present.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.data.as_ref()?.get(name)?.as_str()
    }
}

/// Tagged variant over every lifecycle event the satellite can emit.
///
/// `Unknown` is the catch-all required by the design notes: the Wyoming
/// event map is large and sparse, so any header `type` this crate does not
/// recognize is preserved verbatim rather than rejected. The state machine
/// counts but otherwise ignores `Unknown`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    Startup,
    Connected,
    Disconnected,
    Detect { names: Vec<String> },
    Detection { name: String },
    VoiceStarted,
    VoiceStopped,
    Transcript { text: String },
    Synthesize { text: String },
    TtsStart,
    TtsStop,
    TtsPlayed,
    StreamingStart,
    StreamingStop,
    Error { text: String, code: Option<String> },
    TimerStarted { timer: Timer },
    TimerUpdated { timer: Timer },
    TimerCancelled { id: String },
    TimerFinished { id: String },
    #[serde(other)]
    Unknown,
}

impl LifecycleEvent {
    /// The canonical Wyoming message `type` this event becomes when relayed
    /// to an event peer (see §4.7 C7).
    pub fn wire_type(&self) -> &'static str {
        match self {
            LifecycleEvent::Startup => "startup",
            LifecycleEvent::Connected => "connected",
            LifecycleEvent::Disconnected => "disconnected",
            LifecycleEvent::Detect { .. } => "detect",
            LifecycleEvent::Detection { .. } => "detection",
            LifecycleEvent::VoiceStarted => "voice-started",
            LifecycleEvent::VoiceStopped => "voice-stopped",
            LifecycleEvent::Transcript { .. } => "transcript",
            LifecycleEvent::Synthesize { .. } => "synthesize",
            LifecycleEvent::TtsStart => "tts-start",
            LifecycleEvent::TtsStop => "tts-stop",
            LifecycleEvent::TtsPlayed => "played",
            LifecycleEvent::StreamingStart => "streaming-start",
            LifecycleEvent::StreamingStop => "streaming-stop",
            LifecycleEvent::Error { .. } => "error",
            LifecycleEvent::TimerStarted { .. } => "timer-started",
            LifecycleEvent::TimerUpdated { .. } => "timer-updated",
            LifecycleEvent::TimerCancelled { .. } => "timer-cancelled",
            LifecycleEvent::TimerFinished { .. } => "timer-finished",
            LifecycleEvent::Unknown => "unknown",
        }
    }

    /// Hook configuration key this event is dispatched under (see §6 Events
    /// group, `<kind>-command`).
    pub fn hook_kind(&self) -> &'static str {
        self.wire_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_events_round_trip_through_serde_other() {
        let env = EventEnvelope::new("run-satellite");
        assert_eq!(env.kind, "run-satellite");
    }

    #[test]
    fn wire_type_matches_expected_kebab_case() {
        assert_eq!(LifecycleEvent::VoiceStarted.wire_type(), "voice-started");
        assert_eq!(
            LifecycleEvent::Detection { name: "ok".into() }.wire_type(),
            "detection"
        );
    }
}
