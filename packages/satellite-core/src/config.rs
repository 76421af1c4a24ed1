//! Configuration layer (C10, §4.10): typed form of every CLI option,
//! validated once at startup into the shapes the rest of the crate wants.
//!
//! Grounded on the teacher's `apps/server/src/config.rs` `ServerConfig`
//! (a flat `#[serde(default)]` struct with a `validate`/`to_core_config`
//! seam); here the seam is `validate()` producing a `SatelliteMode` plus
//! the per-component config structs those components already define.

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SatelliteError;
use crate::mic::{AutoGainLevel, MicPipelineConfig, NoiseSuppressionLevel};
use crate::state_machine::SatelliteMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub uri: String,
    pub name: Option<String>,
    pub area: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MicEndpointConfig {
    pub mic_uri: Option<String>,
    pub mic_command: Option<Vec<String>>,
    pub mic_command_rate: Option<u32>,
    pub mic_command_width: Option<u16>,
    pub mic_command_channels: Option<u16>,
    pub mic_command_samples_per_chunk: Option<u32>,
    pub mic_volume_multiplier: f32,
    pub mic_noise_suppression: Option<NoiseSuppressionLevel>,
    pub mic_auto_gain: Option<AutoGainLevel>,
    pub mic_channel_index: Option<usize>,
    pub mic_seconds_to_mute_after_awake_wav: f64,
    pub mic_no_mute_during_awake_wav: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SndEndpointConfig {
    pub snd_uri: Option<String>,
    pub snd_command: Option<Vec<String>>,
    pub snd_command_rate: Option<u32>,
    pub snd_command_width: Option<u16>,
    pub snd_command_channels: Option<u16>,
    pub snd_volume_multiplier: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WakeEndpointConfig {
    pub wake_uri: Option<String>,
    pub wake_command: Option<Vec<String>>,
    pub wake_command_rate: Option<u32>,
    pub wake_command_width: Option<u16>,
    pub wake_command_channels: Option<u16>,
    /// `name [pipeline]` pairs, repeatable on the CLI.
    pub wake_word_name: Vec<(String, Option<String>)>,
    pub wake_refractory_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    pub vad: bool,
    pub vad_threshold: f32,
    pub vad_trigger_level: u32,
    pub vad_buffer_seconds: f32,
    pub vad_wake_word_timeout: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            vad: false,
            vad_threshold: 0.5,
            vad_trigger_level: 1,
            vad_buffer_seconds: 2.0,
            vad_wake_word_timeout: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventsConfig {
    pub event_uri: Option<String>,
    /// `<kind>-command` hook argv, keyed by `LifecycleEvent::hook_kind()`.
    pub hook_commands: std::collections::HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SoundsConfig {
    pub awake_wav: Option<PathBuf>,
    pub done_wav: Option<PathBuf>,
    pub timer_finished_wav: Option<PathBuf>,
    pub timer_finished_wav_repeat: u32,
    pub timer_finished_wav_delay_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub no_zeroconf: bool,
    pub zeroconf_name: Option<String>,
    pub zeroconf_host: Option<IpAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            no_zeroconf: false,
            zeroconf_name: None,
            zeroconf_host: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MiscConfig {
    pub debug: bool,
    pub debug_recording_dir: Option<PathBuf>,
    pub log_format: LogFormat,
}

/// Every CLI option from spec.md §6, grouped the way the CLI table groups
/// them. Construction always goes through [`SatelliteConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SatelliteConfig {
    pub core: CoreConfig,
    pub mic: MicEndpointConfig,
    pub snd: SndEndpointConfig,
    pub wake: WakeEndpointConfig,
    pub vad: VadConfig,
    pub events: EventsConfig,
    pub sounds: SoundsConfig,
    pub discovery: DiscoveryConfig,
    pub misc: MiscConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            name: None,
            area: None,
        }
    }
}

/// What [`SatelliteConfig::validate`] resolves the CLI's options down to:
/// the operating mode plus the ready-to-use mic DSP config.
pub struct ValidatedConfig {
    pub config: SatelliteConfig,
    pub mode: SatelliteMode,
    pub mic_pipeline: MicPipelineConfig,
}

impl SatelliteConfig {
    /// Enforces §4.10's rules, deriving [`SatelliteMode`] deterministically
    /// from which endpoints are configured. A failure here is `ErrConfig`
    /// (exit code 2, §6).
    pub fn validate(self) -> Result<ValidatedConfig, SatelliteError> {
        if self.core.uri.is_empty() {
            return Err(SatelliteError::Config("uri is required".into()));
        }
        if crate::protocol::peer::Endpoint::parse_uri(&self.core.uri).is_err() {
            return Err(SatelliteError::Config(format!(
                "uri must be tcp:// or unix://, got {:?}",
                self.core.uri
            )));
        }

        check_exclusive("mic", self.mic.mic_uri.is_some(), self.mic.mic_command.is_some())?;
        check_exclusive("snd", self.snd.snd_uri.is_some(), self.snd.snd_command.is_some())?;
        check_exclusive("wake", self.wake.wake_uri.is_some(), self.wake.wake_command.is_some())?;

        let has_wake = self.wake.wake_uri.is_some() || self.wake.wake_command.is_some();
        let has_mic = self.mic.mic_uri.is_some() || self.mic.mic_command.is_some();

        if self.vad.vad && !has_mic {
            return Err(SatelliteError::Config(
                "vad requires mic-uri or mic-command to be configured".into(),
            ));
        }

        let mode = if has_wake {
            SatelliteMode::LocalWake
        } else if self.vad.vad {
            SatelliteMode::VadGated
        } else {
            SatelliteMode::Always
        };

        for (label, value) in [
            ("wake-refractory-seconds", self.wake.wake_refractory_seconds),
            ("vad-threshold", self.vad.vad_threshold as f64),
            ("vad-buffer-seconds", self.vad.vad_buffer_seconds as f64),
            ("vad-wake-word-timeout", self.vad.vad_wake_word_timeout),
            ("mic-volume-multiplier", self.mic.mic_volume_multiplier as f64),
            (
                "mic-seconds-to-mute-after-awake-wav",
                self.mic.mic_seconds_to_mute_after_awake_wav,
            ),
            (
                "timer-finished-wav-delay-s",
                self.sounds.timer_finished_wav_delay_s,
            ),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SatelliteError::Config(format!(
                    "{label} must be a finite, non-negative number, got {value}"
                )));
            }
        }
        if self.vad.vad_trigger_level == 0 {
            return Err(SatelliteError::Config(
                "vad-trigger-level must be >= 1".into(),
            ));
        }
        if let Some(level) = self.mic.mic_noise_suppression {
            if level > 4 {
                return Err(SatelliteError::Config(
                    "mic-noise-suppression must be in 0..=4".into(),
                ));
            }
        }
        if let Some(level) = self.mic.mic_auto_gain {
            if level > 31 {
                return Err(SatelliteError::Config(
                    "mic-auto-gain must be in 0..=31".into(),
                ));
            }
        }

        let mic_pipeline = MicPipelineConfig {
            channel_index: self.mic.mic_channel_index,
            volume_multiplier: self.mic.mic_volume_multiplier,
            auto_gain: self.mic.mic_auto_gain,
            noise_suppression: self.mic.mic_noise_suppression,
            vad_buffer_seconds: self.vad.vad_buffer_seconds,
            vad_threshold: self.vad.vad_threshold,
            vad_trigger_level: self.vad.vad_trigger_level,
        };

        Ok(ValidatedConfig {
            config: self,
            mode,
            mic_pipeline,
        })
    }
}

fn check_exclusive(label: &str, has_uri: bool, has_command: bool) -> Result<(), SatelliteError> {
    if has_uri && has_command {
        return Err(SatelliteError::Config(format!(
            "{label}-uri and {label}-command are mutually exclusive"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SatelliteConfig {
        SatelliteConfig {
            core: CoreConfig {
                uri: "tcp://0.0.0.0:10700".into(),
                name: None,
                area: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn missing_uri_is_config_error() {
        let mut c = base();
        c.core.uri.clear();
        assert!(matches!(c.validate(), Err(SatelliteError::Config(_))));
    }

    #[test]
    fn mode_defaults_to_always() {
        let v = base().validate().unwrap();
        assert_eq!(v.mode, SatelliteMode::Always);
    }

    #[test]
    fn wake_endpoint_selects_local_wake_mode() {
        let mut c = base();
        c.wake.wake_uri = Some("tcp://127.0.0.1:10400".into());
        let v = c.validate().unwrap();
        assert_eq!(v.mode, SatelliteMode::LocalWake);
    }

    #[test]
    fn vad_flag_without_mic_is_rejected() {
        let mut c = base();
        c.vad.vad = true;
        assert!(matches!(c.validate(), Err(SatelliteError::Config(_))));
    }

    #[test]
    fn mutually_exclusive_mic_endpoints_rejected() {
        let mut c = base();
        c.mic.mic_uri = Some("tcp://127.0.0.1:10300".into());
        c.mic.mic_command = Some(vec!["arecord".into()]);
        assert!(matches!(c.validate(), Err(SatelliteError::Config(_))));
    }

    #[test]
    fn negative_volume_multiplier_rejected() {
        let mut c = base();
        c.mic.mic_volume_multiplier = -1.0;
        assert!(matches!(c.validate(), Err(SatelliteError::Config(_))));
    }
}
