//! Domain types shared across components (§3): the sealed per-participant
//! commit and the canonical provider output event.

use uuid::Uuid;

/// Negotiated audio format for a call, asserted once before any audio
/// flows (§3 Audio Metadata). The core never transcodes; it only derives
/// `frame_bytes` and duration-from-bytes against these values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub channels: u16,
    /// Bytes per PCM16 sample frame across all channels; always
    /// `channels * 2`. An implementation MUST reject any other sample
    /// width before this value is constructed.
    pub sample_width_bytes: u32,
}

impl AudioFormat {
    /// Derives the outbound frame size in bytes for a given frame duration,
    /// per §4.H's fallback: `sample_rate / 1000 * duration_ms * channels * 2`.
    #[must_use]
    pub fn frame_bytes(&self, frame_duration_ms: u32) -> usize {
        let samples_per_frame = (self.sample_rate_hz as u64 * frame_duration_ms as u64) / 1000;
        (samples_per_frame * self.channels as u64 * 2) as usize
    }

    /// Duration, in milliseconds, of `byte_len` bytes of PCM at this
    /// format, rounded to the nearest millisecond (§4.E).
    #[must_use]
    pub fn duration_ms(&self, byte_len: usize) -> u64 {
        let bytes_per_ms =
            (self.sample_rate_hz as f64 / 1000.0) * self.channels as f64 * 2.0;
        if bytes_per_ms <= 0.0 {
            return 0;
        }
        (byte_len as f64 / bytes_per_ms).round() as u64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate_hz: crate::protocol_constants::DEFAULT_SAMPLE_RATE_HZ,
            channels: crate::protocol_constants::DEFAULT_CHANNELS,
            sample_width_bytes: crate::protocol_constants::PCM_SAMPLE_WIDTH_BYTES,
        }
    }
}

/// A sealed, immutable per-participant PCM buffer (§3 Commit, §4.E).
#[derive(Debug, Clone)]
pub struct Commit {
    pub commit_id: Uuid,
    pub session_id: String,
    pub participant_id: String,
    pub created_at_ms: u64,
    pub pcm: Vec<u8>,
    pub rms: f64,
    pub is_silence: bool,
}

/// Reason a stream's audio terminated, carried on `audio.done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Completed,
    Canceled,
    Error,
}

impl DoneReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

/// Canonical tagged event the Provider Output Normalizer (§4.H) consumes
/// from the provider-inbound bus, and the shape providers are expected to
/// speak internally before gateway-specific re-chunking and sequencing.
#[derive(Debug, Clone)]
pub enum ProviderOutputEvent {
    AudioDelta {
        commit_id: Uuid,
        session_id: String,
        participant_id: String,
        provider: String,
        stream_id: String,
        response_id: Option<String>,
        item_id: Option<String>,
        pcm: Vec<u8>,
    },
    AudioDone {
        commit_id: Uuid,
        session_id: String,
        participant_id: String,
        stream_id: String,
        reason: DoneReason,
        error: Option<String>,
    },
    TranscriptDelta {
        session_id: String,
        participant_id: String,
        source_language: String,
        target_language: String,
        delta: String,
    },
    TranscriptDone {
        session_id: String,
        participant_id: String,
        source_language: String,
        target_language: String,
        text: String,
    },
    ControlStop {
        session_id: String,
        stream_id: String,
    },
    Error {
        session_id: String,
        participant_id: String,
        stream_id: String,
        message: String,
    },
}

impl ProviderOutputEvent {
    /// The stream key this event belongs to, used for per-stream sequence
    /// counters and re-chunking buffers (§4.H).
    #[must_use]
    pub fn stream_key(&self) -> Option<(&str, &str, &str)> {
        match self {
            Self::AudioDelta {
                session_id,
                participant_id,
                stream_id,
                ..
            }
            | Self::AudioDone {
                session_id,
                participant_id,
                stream_id,
                ..
            }
            | Self::Error {
                session_id,
                participant_id,
                stream_id,
                ..
            } => Some((session_id, participant_id, stream_id)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_derivation_matches_20ms_default() {
        let format = AudioFormat {
            sample_rate_hz: 16_000,
            channels: 1,
            sample_width_bytes: 2,
        };
        // 16000 Hz * 20ms / 1000 = 320 samples * 2 bytes = 640 bytes
        assert_eq!(format.frame_bytes(20), 640);
    }

    #[test]
    fn duration_ms_rounds_to_nearest() {
        let format = AudioFormat::default();
        // 16kHz mono 16-bit: 32 bytes/ms. 500 bytes -> 15.625ms -> rounds to 16.
        assert_eq!(format.duration_ms(500), 16);
    }
}
