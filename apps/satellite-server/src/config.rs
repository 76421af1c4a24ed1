//! CLI argument surface (§6 EXTERNAL INTERFACES CLI table), translated into
//! [`satellite_core::config::SatelliteConfig`] for validation.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use satellite_core::config::{
    CoreConfig, DiscoveryConfig, EventsConfig, LogFormat, MicEndpointConfig, MiscConfig,
    SatelliteConfig, SndEndpointConfig, SoundsConfig, VadConfig, WakeEndpointConfig,
};

/// The satellite daemon: bridges mic/speaker/wake-word hardware to a remote
/// voice-assistant server over the Wyoming protocol.
#[derive(Parser, Debug)]
#[command(name = "satellite-server")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Bind address for the main server listener (tcp://host:port or unix://path).
    #[arg(long)]
    pub uri: String,

    /// Advertised satellite name; defaults to a host-derived identifier.
    #[arg(long)]
    pub name: Option<String>,

    /// Advertised area/room name.
    #[arg(long)]
    pub area: Option<String>,

    /// Remote mic peer URI (mutually exclusive with `mic-command`).
    #[arg(long)]
    pub mic_uri: Option<String>,

    /// Local mic capture subprocess argv (mutually exclusive with `mic-uri`).
    #[arg(long, num_args = 1..)]
    pub mic_command: Option<Vec<String>>,

    #[arg(long)]
    pub mic_command_rate: Option<u32>,
    #[arg(long)]
    pub mic_command_width: Option<u16>,
    #[arg(long)]
    pub mic_command_channels: Option<u16>,
    #[arg(long)]
    pub mic_command_samples_per_chunk: Option<u32>,

    /// Pre-DSP gain applied to every mic chunk.
    #[arg(long, default_value_t = 1.0)]
    pub mic_volume_multiplier: f32,

    /// Noise suppression level, 0..4.
    #[arg(long)]
    pub mic_noise_suppression: Option<u8>,

    /// Auto-gain level, 0..31.
    #[arg(long)]
    pub mic_auto_gain: Option<u8>,

    /// Channel index to select when downmixing a multi-channel mic source.
    #[arg(long)]
    pub mic_channel_index: Option<usize>,

    /// Seconds to keep the mic muted after a feedback WAV finishes playing.
    #[arg(long, default_value_t = 0.5)]
    pub mic_seconds_to_mute_after_awake_wav: f64,

    /// Disable the feedback-WAV mute gate entirely.
    #[arg(long)]
    pub mic_no_mute_during_awake_wav: bool,

    /// Remote snd peer URI (mutually exclusive with `snd-command`).
    #[arg(long)]
    pub snd_uri: Option<String>,

    /// Local snd playback subprocess argv (mutually exclusive with `snd-uri`).
    #[arg(long, num_args = 1..)]
    pub snd_command: Option<Vec<String>>,

    #[arg(long)]
    pub snd_command_rate: Option<u32>,
    #[arg(long)]
    pub snd_command_width: Option<u16>,
    #[arg(long)]
    pub snd_command_channels: Option<u16>,

    /// Post-mix gain applied before handing samples to the snd peer.
    #[arg(long, default_value_t = 1.0)]
    pub snd_volume_multiplier: f32,

    /// Remote wake-word peer URI (mutually exclusive with `wake-command`).
    #[arg(long)]
    pub wake_uri: Option<String>,

    /// Local wake-word detector subprocess argv (mutually exclusive with `wake-uri`).
    #[arg(long, num_args = 1..)]
    pub wake_command: Option<Vec<String>>,

    #[arg(long)]
    pub wake_command_rate: Option<u32>,
    #[arg(long)]
    pub wake_command_width: Option<u16>,
    #[arg(long)]
    pub wake_command_channels: Option<u16>,

    /// `name` or `name:pipeline`; repeatable to arm multiple wake models.
    #[arg(long = "wake-word-name")]
    pub wake_word_name: Vec<String>,

    /// Debounce window between accepted detections.
    #[arg(long, default_value_t = 5.0)]
    pub wake_refractory_seconds: f64,

    /// Enable VAD-gated mode (ignored if a wake endpoint is configured).
    #[arg(long)]
    pub vad: bool,

    #[arg(long, default_value_t = 0.5)]
    pub vad_threshold: f32,

    #[arg(long, default_value_t = 1)]
    pub vad_trigger_level: u32,

    #[arg(long, default_value_t = 2.0)]
    pub vad_buffer_seconds: f32,

    #[arg(long, default_value_t = 5.0)]
    pub vad_wake_word_timeout: f64,

    /// External event peer URI.
    #[arg(long)]
    pub event_uri: Option<String>,

    /// `kind=argv...` subprocess hook, repeatable. `kind` is a
    /// [`satellite_core::events::LifecycleEvent::hook_kind`] value (e.g.
    /// `transcript`, `timer-finished`).
    #[arg(long = "hook-command", value_parser = parse_hook)]
    pub hook_command: Vec<(String, Vec<String>)>,

    #[arg(long)]
    pub awake_wav: Option<PathBuf>,
    #[arg(long)]
    pub done_wav: Option<PathBuf>,
    #[arg(long)]
    pub timer_finished_wav: Option<PathBuf>,

    /// `<repeat> <delay_s>` — how many times to replay `timer-finished-wav`
    /// and the gap between repeats.
    #[arg(long, num_args = 2)]
    pub timer_finished_wav_repeat: Option<Vec<String>>,

    #[arg(long)]
    pub no_zeroconf: bool,
    #[arg(long)]
    pub zeroconf_name: Option<String>,
    #[arg(long)]
    pub zeroconf_host: Option<IpAddr>,

    #[arg(long)]
    pub debug: bool,
    #[arg(long)]
    pub debug_recording_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

fn parse_hook(raw: &str) -> Result<(String, Vec<String>), String> {
    let (kind, argv) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected `kind=command args...`, got {raw:?}"))?;
    let argv: Vec<String> = argv.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(format!("empty command for hook kind {kind:?}"));
    }
    Ok((kind.to_string(), argv))
}

impl Args {
    /// Assembles the typed, ungrouped CLI surface into [`SatelliteConfig`].
    /// Validation (mutual exclusivity, mode derivation, numeric ranges)
    /// happens later in [`SatelliteConfig::validate`].
    pub fn into_satellite_config(self) -> SatelliteConfig {
        let wake_word_name = parse_wake_word_names(&self.wake_word_name);

        let (timer_finished_wav_repeat, timer_finished_wav_delay_s) =
            match self.timer_finished_wav_repeat {
                Some(pair) if pair.len() == 2 => (
                    pair[0].parse().unwrap_or(0),
                    pair[1].parse().unwrap_or(0.0),
                ),
                _ => (0, 0.0),
            };

        SatelliteConfig {
            core: CoreConfig {
                uri: self.uri,
                name: self.name,
                area: self.area,
            },
            mic: MicEndpointConfig {
                mic_uri: self.mic_uri,
                mic_command: self.mic_command,
                mic_command_rate: self.mic_command_rate,
                mic_command_width: self.mic_command_width,
                mic_command_channels: self.mic_command_channels,
                mic_command_samples_per_chunk: self.mic_command_samples_per_chunk,
                mic_volume_multiplier: self.mic_volume_multiplier,
                mic_noise_suppression: self.mic_noise_suppression,
                mic_auto_gain: self.mic_auto_gain,
                mic_channel_index: self.mic_channel_index,
                mic_seconds_to_mute_after_awake_wav: self.mic_seconds_to_mute_after_awake_wav,
                mic_no_mute_during_awake_wav: self.mic_no_mute_during_awake_wav,
            },
            snd: SndEndpointConfig {
                snd_uri: self.snd_uri,
                snd_command: self.snd_command,
                snd_command_rate: self.snd_command_rate,
                snd_command_width: self.snd_command_width,
                snd_command_channels: self.snd_command_channels,
                snd_volume_multiplier: self.snd_volume_multiplier,
            },
            wake: WakeEndpointConfig {
                wake_uri: self.wake_uri,
                wake_command: self.wake_command,
                wake_command_rate: self.wake_command_rate,
                wake_command_width: self.wake_command_width,
                wake_command_channels: self.wake_command_channels,
                wake_word_name,
                wake_refractory_seconds: self.wake_refractory_seconds,
            },
            vad: VadConfig {
                vad: self.vad,
                vad_threshold: self.vad_threshold,
                vad_trigger_level: self.vad_trigger_level,
                vad_buffer_seconds: self.vad_buffer_seconds,
                vad_wake_word_timeout: self.vad_wake_word_timeout,
            },
            events: EventsConfig {
                event_uri: self.event_uri,
                hook_commands: self.hook_command.into_iter().collect::<HashMap<_, _>>(),
            },
            sounds: SoundsConfig {
                awake_wav: self.awake_wav,
                done_wav: self.done_wav,
                timer_finished_wav: self.timer_finished_wav,
                timer_finished_wav_repeat,
                timer_finished_wav_delay_s,
            },
            discovery: DiscoveryConfig {
                no_zeroconf: self.no_zeroconf,
                zeroconf_name: self.zeroconf_name,
                zeroconf_host: self.zeroconf_host,
            },
            misc: MiscConfig {
                debug: self.debug,
                debug_recording_dir: self.debug_recording_dir,
                log_format: match self.log_format {
                    LogFormatArg::Pretty => LogFormat::Pretty,
                    LogFormatArg::Json => LogFormat::Json,
                },
            },
        }
    }
}

fn parse_wake_word_names(raw: &[String]) -> Vec<(String, Option<String>)> {
    raw.iter()
        .map(|entry| match entry.split_once(':') {
            Some((name, pipeline)) => (name.to_string(), Some(pipeline.to_string())),
            None => (entry.clone(), None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_parser_splits_kind_and_argv() {
        let (kind, argv) = parse_hook("transcript=/bin/echo hello").unwrap();
        assert_eq!(kind, "transcript");
        assert_eq!(argv, vec!["/bin/echo", "hello"]);
    }

    #[test]
    fn hook_parser_rejects_missing_equals() {
        assert!(parse_hook("no-equals-sign").is_err());
    }

    #[test]
    fn wake_word_name_without_pipeline_has_none() {
        let parsed = parse_wake_word_names(&["ok_nabu".to_string()]);
        assert_eq!(parsed, vec![("ok_nabu".to_string(), None)]);
    }

    #[test]
    fn wake_word_name_with_pipeline_suffix_splits() {
        let parsed = parse_wake_word_names(&["ok_nabu:kitchen".to_string()]);
        assert_eq!(
            parsed,
            vec![("ok_nabu".to_string(), Some("kitchen".to_string()))]
        );
    }
}
