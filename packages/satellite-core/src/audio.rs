//! Audio chunk and format types shared by every pipeline (§3 DATA MODEL).

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::SatelliteError;
use crate::events::fanout::FeedbackSound;

/// Sample format negotiated with a peer via `describe`/`info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub rate: u32,
    pub width: u8,
    pub channels: u8,
}

impl AudioFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.width as usize * self.channels as usize
    }
}

/// One immutable chunk of audio, produced once and shared by reference
/// thereafter (the mic broadcaster clones the `Arc<AudioChunk>`, never the
/// sample bytes).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub format: AudioFormat,
    pub samples: Bytes,
    pub timestamp_ms: i64,
}

impl AudioChunk {
    pub fn new(format: AudioFormat, samples: Bytes, timestamp_ms: i64) -> Self {
        debug_assert_eq!(
            samples.len() % format.bytes_per_frame().max(1),
            0,
            "chunk length must be a whole number of frames"
        );
        Self {
            format,
            samples,
            timestamp_ms,
        }
    }

    /// Number of frames carried by this chunk.
    pub fn frame_count(&self) -> usize {
        let bpf = self.format.bytes_per_frame();
        if bpf == 0 {
            0
        } else {
            self.samples.len() / bpf
        }
    }

    /// A chunk of identical shape filled with silence, used by the mute
    /// gate (§4.3 step 5).
    pub fn silence_like(&self) -> AudioChunk {
        AudioChunk {
            format: self.format,
            samples: Bytes::from(vec![0u8; self.samples.len()]),
            timestamp_ms: self.timestamp_ms,
        }
    }

    pub fn shared(self) -> Arc<AudioChunk> {
        Arc::new(self)
    }
}

/// Decodes a feedback WAV file (`awake-wav`/`done-wav`/`timer-finished-wav`,
/// §6 Sounds group) into raw PCM samples plus the format the snd peer needs
/// to be told about. Only integer PCM is supported; anything else is a
/// config-time error since these files are operator-supplied assets, not
/// untrusted input.
pub fn decode_wav(bytes: &[u8]) -> Result<FeedbackSound, SatelliteError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| SatelliteError::Config(format!("invalid wav file: {e}")))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int {
        return Err(SatelliteError::Config(
            "feedback wav must be integer PCM".into(),
        ));
    }
    let width_bytes = (spec.bits_per_sample as usize).div_ceil(8);
    let mut samples = Vec::with_capacity(reader.len() as usize * width_bytes);
    match spec.bits_per_sample {
        16 => {
            for sample in reader.samples::<i16>() {
                let sample = sample.map_err(|e| SatelliteError::Config(format!("wav decode error: {e}")))?;
                samples.extend_from_slice(&sample.to_le_bytes());
            }
        }
        8 => {
            for sample in reader.samples::<i8>() {
                let sample = sample.map_err(|e| SatelliteError::Config(format!("wav decode error: {e}")))?;
                samples.push(sample as u8);
            }
        }
        other => {
            return Err(SatelliteError::Config(format!(
                "unsupported wav bit depth: {other}"
            )));
        }
    }

    Ok(FeedbackSound {
        samples: Bytes::from(samples),
        format: AudioFormat {
            rate: spec.sample_rate,
            width: width_bytes as u8,
            channels: spec.channels as u8,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> AudioFormat {
        AudioFormat {
            rate: 16000,
            width: 2,
            channels: 1,
        }
    }

    #[test]
    fn frame_count_divides_by_bytes_per_frame() {
        let chunk = AudioChunk::new(fmt(), Bytes::from(vec![0u8; 8]), 0);
        assert_eq!(chunk.frame_count(), 4);
    }

    #[test]
    fn silence_like_preserves_shape() {
        let chunk = AudioChunk::new(fmt(), Bytes::from(vec![1u8, 2, 3, 4]), 100);
        let silence = chunk.silence_like();
        assert_eq!(silence.samples.len(), chunk.samples.len());
        assert!(silence.samples.iter().all(|&b| b == 0));
        assert_eq!(silence.timestamp_ms, chunk.timestamp_ms);
    }
}
