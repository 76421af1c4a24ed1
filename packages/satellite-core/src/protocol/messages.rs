//! Wyoming message type constants (§6 EXTERNAL INTERFACES).
//!
//! Centralizing the wire strings here keeps every peer and the state
//! machine's `match` arms on the canonical spelling.

pub mod emitted {
    pub const DESCRIBE: &str = "describe";
    pub const INFO: &str = "info";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const RUN_PIPELINE: &str = "run-pipeline";
    pub const DETECT: &str = "detect";
    pub const DETECTION: &str = "detection";
    pub const AUDIO_START: &str = "audio-start";
    pub const AUDIO_CHUNK: &str = "audio-chunk";
    pub const AUDIO_STOP: &str = "audio-stop";
    pub const PLAYED: &str = "played";
    pub const PAUSE_SATELLITE: &str = "pause-satellite";
    pub const RESUME_SATELLITE: &str = "resume-satellite";
    pub const TIMER_STARTED: &str = "timer-started";
    pub const TIMER_UPDATED: &str = "timer-updated";
    pub const TIMER_CANCELLED: &str = "timer-cancelled";
    pub const TIMER_FINISHED: &str = "timer-finished";
}

pub mod consumed {
    pub const INFO: &str = "info";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const DETECT: &str = "detect";
    pub const DETECTION: &str = "detection";
    pub const TRANSCRIPT: &str = "transcription";
    pub const SYNTHESIZE: &str = "synthesize";
    pub const AUDIO_START: &str = "audio-start";
    pub const AUDIO_CHUNK: &str = "audio-chunk";
    pub const AUDIO_STOP: &str = "audio-stop";
    pub const VOICE_STARTED: &str = "voice-started";
    pub const VOICE_STOPPED: &str = "voice-stopped";
    pub const ERROR: &str = "error";
    pub const RUN_SATELLITE: &str = "run-satellite";
    pub const PAUSE_SATELLITE: &str = "pause-satellite";
    pub const RESUME_SATELLITE: &str = "resume-satellite";
    pub const TIMER_STARTED: &str = "timer-started";
    pub const TIMER_UPDATED: &str = "timer-updated";
    pub const TIMER_CANCELLED: &str = "timer-cancelled";
    pub const TIMER_FINISHED: &str = "timer-finished";
}

/// Outbound `info` satellite advertisement (§6): "MUST advertise satellite
/// `{name, area, snd_format?, supports_trigger, active_wake_word_names}`
/// plus software `{name, version}`".
#[derive(Debug, Clone, serde::Serialize)]
pub struct SatelliteInfo {
    pub name: String,
    pub area: Option<String>,
    pub snd_format: Option<crate::audio::AudioFormat>,
    pub supports_trigger: bool,
    pub active_wake_word_names: Vec<String>,
    pub software_name: &'static str,
    pub software_version: &'static str,
}

impl SatelliteInfo {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "satellite": {
                "name": self.name,
                "area": self.area,
                "snd_format": self.snd_format.map(|f| serde_json::json!({
                    "rate": f.rate, "width": f.width, "channels": f.channels,
                })),
                "supports_trigger": self.supports_trigger,
                "active_wake_word_names": self.active_wake_word_names,
            },
            "software": {
                "name": self.software_name,
                "version": self.software_version,
            },
        })
    }
}
