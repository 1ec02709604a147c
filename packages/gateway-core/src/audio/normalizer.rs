//! Provider Output Normalizer (§4.H): re-chunks arbitrarily-sized provider
//! audio deltas into fixed-size outbound frames, tracks a monotonic
//! per-stream sequence (carried as the frame's wire `timestamp`), and
//! accumulates streaming transcript text.

use dashmap::DashMap;
use tracing::debug;

use crate::bus::EventBus;
use crate::model::{AudioFormat, DoneReason, ProviderOutputEvent};
use crate::protocol::{
    AudioDataMessage, AudioDoneMessage, ControlStopAudioMessage, TextDeltaMessage, TranscriptMessage, WireMessage,
};
use crate::protocol_constants::DEFAULT_FRAME_DURATION_MS;
use crate::utils::now_millis;

/// Stream key: `(session_id, participant_id, stream_id)`.
type StreamKey = (String, String, String);
/// Transcript buffer key: `(participant_id, source_language, target_language)`.
type TranscriptKey = (String, String, String);

struct StreamBuffer {
    pcm: Vec<u8>,
    seq: u64,
}

struct TranscriptBuffer {
    accumulated: String,
}

/// Consumes [`ProviderOutputEvent`]s from the provider-inbound bus and
/// publishes [`WireMessage`]s onto the outbound bus.
pub struct OutputNormalizer {
    format: AudioFormat,
    frame_duration_ms: u32,
    audio_buffers: DashMap<StreamKey, StreamBuffer>,
    transcript_buffers: DashMap<TranscriptKey, TranscriptBuffer>,
    outbound: EventBus<WireMessage>,
}

impl OutputNormalizer {
    /// `frame_duration_ms` is the negotiated outbound frame size (§6
    /// `frame_duration_ms`, range-checked by [`crate::config::GatewayConfig::validate`]);
    /// `0` falls back to [`DEFAULT_FRAME_DURATION_MS`].
    #[must_use]
    pub fn new(format: AudioFormat, outbound: EventBus<WireMessage>, frame_duration_ms: u32) -> Self {
        Self {
            format,
            frame_duration_ms: if frame_duration_ms == 0 {
                DEFAULT_FRAME_DURATION_MS
            } else {
                frame_duration_ms
            },
            audio_buffers: DashMap::new(),
            transcript_buffers: DashMap::new(),
            outbound,
        }
    }

    pub async fn handle(&self, event: ProviderOutputEvent) {
        match event {
            ProviderOutputEvent::AudioDelta {
                commit_id,
                session_id,
                participant_id,
                provider,
                stream_id,
                pcm,
                ..
            } => {
                let key = (session_id.clone(), participant_id.clone(), stream_id.clone());
                self.flush_frames(&key, pcm, false, &participant_id);
                let _ = (commit_id, provider);
            }
            ProviderOutputEvent::AudioDone {
                commit_id,
                session_id,
                participant_id,
                stream_id,
                reason,
                error,
            } => {
                let key = (session_id.clone(), participant_id.clone(), stream_id.clone());
                self.flush_frames(&key, Vec::new(), true, &participant_id);
                self.audio_buffers.remove(&key);
                self.outbound.publish(WireMessage::AudioDone(AudioDoneMessage::new(
                    session_id,
                    participant_id,
                    commit_id.to_string(),
                    stream_id,
                    "gateway",
                    reason.as_str(),
                    error,
                )));
            }
            ProviderOutputEvent::TranscriptDelta {
                participant_id,
                source_language,
                target_language,
                delta,
                ..
            } => {
                let key = (participant_id.clone(), source_language.clone(), target_language.clone());
                self.transcript_buffers
                    .entry(key)
                    .or_insert_with(|| TranscriptBuffer {
                        accumulated: String::new(),
                    })
                    .accumulated
                    .push_str(&delta);
                self.outbound.publish(WireMessage::TextDelta(TextDeltaMessage {
                    message_type: "translation.text_delta".to_string(),
                    participant_id,
                    source_language,
                    target_language,
                    delta,
                }));
            }
            ProviderOutputEvent::TranscriptDone {
                participant_id,
                source_language,
                target_language,
                text,
                ..
            } => {
                let key = (participant_id.clone(), source_language.clone(), target_language.clone());
                let final_text = if text.is_empty() {
                    self.transcript_buffers
                        .get(&key)
                        .map(|buf| buf.accumulated.clone())
                        .unwrap_or_default()
                } else {
                    text
                };
                self.transcript_buffers.remove(&key);
                self.outbound.publish(WireMessage::Transcript(TranscriptMessage {
                    message_type: "transcript".to_string(),
                    participant_id,
                    source_language,
                    target_language,
                    text: final_text,
                    timestamp_ms: now_millis() as i64,
                }));
            }
            ProviderOutputEvent::ControlStop { session_id, stream_id } => {
                self.audio_buffers
                    .retain(|key, _| !(key.0 == session_id && key.2 == stream_id));
                self.outbound.publish(WireMessage::ControlStopAudio(ControlStopAudioMessage {
                    message_type: "control.stop_audio".to_string(),
                    stream_id: Some(stream_id),
                }));
            }
            ProviderOutputEvent::Error {
                session_id,
                participant_id,
                stream_id,
                message,
            } => {
                let key = (session_id.clone(), participant_id.clone(), stream_id.clone());
                self.flush_frames(&key, Vec::new(), true, &participant_id);
                self.audio_buffers.remove(&key);
                self.outbound.publish(WireMessage::AudioDone(AudioDoneMessage::new(
                    session_id,
                    participant_id,
                    stream_id.clone(),
                    stream_id,
                    "unknown",
                    DoneReason::Error.as_str(),
                    Some(message),
                )));
            }
        }
    }

    fn flush_frames(&self, key: &StreamKey, incoming: Vec<u8>, drain: bool, participant_id: &str) {
        let frame_bytes = self.format.frame_bytes(self.frame_duration_ms).max(1);
        let mut entry = self
            .audio_buffers
            .entry(key.clone())
            .or_insert_with(|| StreamBuffer { pcm: Vec::new(), seq: 0 });
        entry.pcm.extend_from_slice(&incoming);

        while entry.pcm.len() >= frame_bytes || (drain && !entry.pcm.is_empty()) {
            let take = frame_bytes.min(entry.pcm.len());
            let frame: Vec<u8> = entry.pcm.drain(..take).collect();
            entry.seq += 1;
            let timestamp_ms = (entry.seq * self.frame_duration_ms as u64) as i64;
            debug!(
                session_id = %key.0,
                participant_id,
                stream_id = %key.2,
                seq = entry.seq,
                frame_bytes = frame.len(),
                "normalizer emitting outbound audio frame"
            );
            self.outbound.publish(WireMessage::AudioData(AudioDataMessage::new(
                Some(participant_id.to_string()),
                &frame,
                timestamp_ms,
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusHandler, HandlerConfig};
    use crate::queue::OverflowPolicy;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    struct CollectingHandler {
        seen: Arc<Mutex<Vec<WireMessage>>>,
    }

    #[async_trait]
    impl BusHandler<WireMessage> for CollectingHandler {
        async fn handle(&self, item: WireMessage) {
            self.seen.lock().unwrap().push(item);
        }
    }

    fn normalizer_with_collector() -> (OutputNormalizer, Arc<Mutex<Vec<WireMessage>>>) {
        let outbound: EventBus<WireMessage> = EventBus::new("outbound");
        let seen = Arc::new(Mutex::new(Vec::new()));
        outbound.register_handler(
            HandlerConfig {
                name: "collector".into(),
                queue_max: 64,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(CollectingHandler { seen: seen.clone() }),
        );
        let format = AudioFormat {
            sample_rate_hz: 16_000,
            channels: 1,
            sample_width_bytes: 2,
        };
        (OutputNormalizer::new(format, outbound, DEFAULT_FRAME_DURATION_MS), seen)
    }

    #[tokio::test]
    async fn rechunks_deltas_into_frame_sized_pieces() {
        let (normalizer, seen) = normalizer_with_collector();
        // 20ms @ 16kHz mono 16-bit = 640 bytes/frame.
        normalizer
            .handle(ProviderOutputEvent::AudioDelta {
                commit_id: Uuid::new_v4(),
                session_id: "s1".into(),
                participant_id: "p1".into(),
                provider: "mock".into(),
                stream_id: "stream-1".into(),
                response_id: None,
                item_id: None,
                pcm: vec![0u8; 1000],
            })
            .await;
        tokio::task::yield_now().await;

        let messages = seen.lock().unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WireMessage::AudioData(m) => assert_eq!(m.decode_pcm().unwrap().len(), 640),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn audio_done_flushes_residual_and_emits_done() {
        let (normalizer, seen) = normalizer_with_collector();
        normalizer
            .handle(ProviderOutputEvent::AudioDelta {
                commit_id: Uuid::new_v4(),
                session_id: "s1".into(),
                participant_id: "p1".into(),
                provider: "mock".into(),
                stream_id: "stream-1".into(),
                response_id: None,
                item_id: None,
                pcm: vec![0u8; 160],
            })
            .await;
        normalizer
            .handle(ProviderOutputEvent::AudioDone {
                commit_id: Uuid::new_v4(),
                session_id: "s1".into(),
                participant_id: "p1".into(),
                stream_id: "stream-1".into(),
                reason: DoneReason::Completed,
                error: None,
            })
            .await;

        let messages = seen.lock().unwrap();
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            WireMessage::AudioData(m) => assert_eq!(m.decode_pcm().unwrap().len(), 160),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(messages[1], WireMessage::AudioDone(_)));
    }

    #[tokio::test]
    async fn transcript_done_falls_back_to_accumulated_deltas() {
        let (normalizer, seen) = normalizer_with_collector();
        normalizer
            .handle(ProviderOutputEvent::TranscriptDelta {
                session_id: "s1".into(),
                participant_id: "p1".into(),
                source_language: "en".into(),
                target_language: "es".into(),
                delta: "hola".into(),
            })
            .await;
        normalizer
            .handle(ProviderOutputEvent::TranscriptDone {
                session_id: "s1".into(),
                participant_id: "p1".into(),
                source_language: "en".into(),
                target_language: "es".into(),
                text: String::new(),
            })
            .await;

        let messages = seen.lock().unwrap();
        match &messages[1] {
            WireMessage::Transcript(m) => assert_eq!(m.text, "hola"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn control_stop_clears_matching_buffer() {
        let (normalizer, _seen) = normalizer_with_collector();
        normalizer
            .handle(ProviderOutputEvent::AudioDelta {
                commit_id: Uuid::new_v4(),
                session_id: "s1".into(),
                participant_id: "p1".into(),
                provider: "mock".into(),
                stream_id: "stream-1".into(),
                response_id: None,
                item_id: None,
                pcm: vec![0u8; 10],
            })
            .await;
        assert!(normalizer
            .audio_buffers
            .contains_key(&("s1".to_string(), "p1".to_string(), "stream-1".to_string())));

        normalizer
            .handle(ProviderOutputEvent::ControlStop {
                session_id: "s1".into(),
                stream_id: "stream-1".into(),
            })
            .await;
        assert!(!normalizer
            .audio_buffers
            .contains_key(&("s1".to_string(), "p1".to_string(), "stream-1".to_string())));
    }
}
