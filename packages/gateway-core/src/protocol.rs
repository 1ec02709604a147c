//! Wire envelope encode/decode (§4.D).
//!
//! Two framing families coexist on the wire: `kind`-tagged audio/metadata
//! frames, and `type`-tagged control/transcript messages. Decoding is a
//! chain of single-purpose strategies, each asked `can_handle(value)`; the
//! first match decodes. The chain is ordered so audio-shaped messages are
//! tried before the generic control/transcript strategies, matching the
//! wire's own precedence (an `AudioData` frame happens to also satisfy a
//! loose "has a `type` field" check if misordered).

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol_constants::ABSOLUTE_TIMESTAMP_THRESHOLD_MS;

/// Negotiated per-call audio metadata (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadataBody {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    pub encoding: String,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame size in bytes, when the sender negotiates it explicitly.
    #[serde(default)]
    pub length: Option<u32>,
}

/// `{kind, audioMetadata:{...}}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMetadataMessage {
    pub kind: String,
    #[serde(rename = "audioMetadata")]
    pub audio_metadata: AudioMetadataBody,
}

/// Inner payload of an `AudioData` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDataBody {
    /// Base64-encoded PCM16 payload.
    pub data: String,
    #[serde(rename = "participantRawID", skip_serializing_if = "Option::is_none")]
    pub participant_raw_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub silent: bool,
    #[serde(rename = "playToParticipant", skip_serializing_if = "Option::is_none")]
    pub play_to_participant: Option<String>,
}

/// `{kind, audioData:{...}}` frame — the per-frame PCM carrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDataMessage {
    pub kind: String,
    #[serde(rename = "audioData")]
    pub audio_data: AudioDataBody,
}

impl AudioDataMessage {
    /// Builds a frame carrying raw PCM, base64-encoding it.
    #[must_use]
    pub fn new(participant_raw_id: Option<String>, pcm: &[u8], timestamp_ms: i64) -> Self {
        Self {
            kind: "AudioData".to_string(),
            audio_data: AudioDataBody {
                data: base64::engine::general_purpose::STANDARD.encode(pcm),
                participant_raw_id,
                timestamp: timestamp_ms,
                silent: false,
                play_to_participant: None,
            },
        }
    }

    /// Decodes the base64 PCM payload.
    pub fn decode_pcm(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.audio_data.data)
    }
}

/// `{type:"transcript", ...}` — a finalized transcript line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub participant_id: String,
    pub source_language: String,
    pub target_language: String,
    pub text: String,
    pub timestamp_ms: i64,
}

/// Incremental text, either `translation.text_delta` or
/// `control.test.response.text_delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDeltaMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub participant_id: String,
    pub source_language: String,
    pub target_language: String,
    pub delta: String,
}

/// `control.test.settings` — per-session configuration sent once to the
/// upstream before any audio flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlTestSettingsMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub settings: Value,
}

impl ControlTestSettingsMessage {
    #[must_use]
    pub fn new(provider: &str, outbound_gate_mode: &str) -> Self {
        Self {
            message_type: "control.test.settings".to_string(),
            settings: serde_json::json!({
                "provider": provider,
                "outbound_gate_mode": outbound_gate_mode,
            }),
        }
    }
}

/// `control.stop_audio` — clears a stream's buffered audio and sequence
/// counter, forwarded downstream as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlStopAudioMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

/// `audio.done` — terminates one provider response stream downstream,
/// published by the Provider Output Normalizer (§4.H) after its residual
/// buffer is flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDoneMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub session_id: String,
    pub participant_id: String,
    pub commit_id: String,
    pub stream_id: String,
    pub provider: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AudioDoneMessage {
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
        commit_id: impl Into<String>,
        stream_id: impl Into<String>,
        provider: impl Into<String>,
        reason: &str,
        error: Option<String>,
    ) -> Self {
        Self {
            message_type: "audio.done".to_string(),
            session_id: session_id.into(),
            participant_id: participant_id.into(),
            commit_id: commit_id.into(),
            stream_id: stream_id.into(),
            provider: provider.into(),
            reason: reason.to_string(),
            error,
        }
    }
}

/// `session.start` — the first message a downstream client MUST send,
/// carrying the call code and participant id the Session Router (§4.K)
/// needs to attach the connection to a [`crate::call::Call`]. `routing`
/// selects the pipeline topology (§4.I); absent or unrecognized defaults to
/// `shared`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStartMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub call_code: String,
    pub participant_id: String,
    #[serde(default)]
    pub routing: Option<String>,
}

/// `connection.established` — sent immediately after the downstream socket
/// is accepted, before the call/participant lookup completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablishedMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub session_id: String,
}

/// `connection.ready` — sent once the call's upstream handshake has
/// succeeded and audio may start flowing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReadyMessage {
    #[serde(rename = "type")]
    pub message_type: String,
}

/// `participant.joined` / `participant.left` — membership change broadcast
/// to every participant of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantChangedMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub participant_id: String,
    pub participants: Vec<String>,
}

/// `participant.list` — the current roster, sent once to a newly joined
/// participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantListMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub participants: Vec<String>,
}

/// `error` — a human-readable failure notice, sent before the socket closes
/// on a session-fatal error (§7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub message: String,
}

impl ErrorMessage {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message_type: "error".to_string(),
            message: message.into(),
        }
    }
}

/// A decoded wire message. `Unknown` preserves the raw JSON for protocol
/// violation logging without losing the frame's shape.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    AudioMetadata(AudioMetadataMessage),
    AudioData(AudioDataMessage),
    Transcript(TranscriptMessage),
    TextDelta(TextDeltaMessage),
    ControlTestSettings(ControlTestSettingsMessage),
    ControlStopAudio(ControlStopAudioMessage),
    AudioDone(AudioDoneMessage),
    SessionStart(SessionStartMessage),
    ConnectionEstablished(ConnectionEstablishedMessage),
    ConnectionReady(ConnectionReadyMessage),
    ParticipantChanged(ParticipantChangedMessage),
    ParticipantList(ParticipantListMessage),
    Error(ErrorMessage),
    Unknown(Value),
}

impl WireMessage {
    /// Serializes back to a JSON value for sending over the wire.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::AudioMetadata(m) => serde_json::to_value(m).expect("AudioMetadataMessage serializes"),
            Self::AudioData(m) => serde_json::to_value(m).expect("AudioDataMessage serializes"),
            Self::Transcript(m) => serde_json::to_value(m).expect("TranscriptMessage serializes"),
            Self::TextDelta(m) => serde_json::to_value(m).expect("TextDeltaMessage serializes"),
            Self::ControlTestSettings(m) => {
                serde_json::to_value(m).expect("ControlTestSettingsMessage serializes")
            }
            Self::ControlStopAudio(m) => {
                serde_json::to_value(m).expect("ControlStopAudioMessage serializes")
            }
            Self::AudioDone(m) => serde_json::to_value(m).expect("AudioDoneMessage serializes"),
            Self::SessionStart(m) => serde_json::to_value(m).expect("SessionStartMessage serializes"),
            Self::ConnectionEstablished(m) => {
                serde_json::to_value(m).expect("ConnectionEstablishedMessage serializes")
            }
            Self::ConnectionReady(m) => {
                serde_json::to_value(m).expect("ConnectionReadyMessage serializes")
            }
            Self::ParticipantChanged(m) => {
                serde_json::to_value(m).expect("ParticipantChangedMessage serializes")
            }
            Self::ParticipantList(m) => {
                serde_json::to_value(m).expect("ParticipantListMessage serializes")
            }
            Self::Error(m) => serde_json::to_value(m).expect("ErrorMessage serializes"),
            Self::Unknown(v) => v.clone(),
        }
    }

    /// Whether this message carries audio payload bytes, per the wire
    /// definition used by the outbound gate (§4.G): `kind` (or `type`) is
    /// `AudioData`/`audio.data`, or an `audioData`/`audio_data` object with
    /// a `data` field is present.
    #[must_use]
    pub fn is_audio_payload(&self) -> bool {
        matches!(self, Self::AudioData(_))
    }
}

type DecodeStrategy = fn(&Value) -> Option<WireMessage>;

fn decode_audio_data(value: &Value) -> Option<WireMessage> {
    let kind = value.get("kind")?.as_str()?;
    if kind != "AudioData" && kind != "audioData" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::AudioData)
}

fn decode_audio_metadata(value: &Value) -> Option<WireMessage> {
    let kind = value.get("kind")?.as_str()?;
    if kind != "AudioMetadata" && kind != "audioMetadata" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::AudioMetadata)
}

fn decode_transcript(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "transcript" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::Transcript)
}

fn decode_text_delta(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "translation.text_delta" && ty != "control.test.response.text_delta" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::TextDelta)
}

fn decode_control_test_settings(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "control.test.settings" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::ControlTestSettings)
}

fn decode_control_stop_audio(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "control.stop_audio" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::ControlStopAudio)
}

fn decode_audio_done(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "audio.done" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::AudioDone)
}

fn decode_session_start(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "session.start" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::SessionStart)
}

fn decode_connection_established(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "connection.established" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::ConnectionEstablished)
}

fn decode_connection_ready(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "connection.ready" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::ConnectionReady)
}

fn decode_participant_changed(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "participant.joined" && ty != "participant.left" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::ParticipantChanged)
}

fn decode_participant_list(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "participant.list" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::ParticipantList)
}

fn decode_error_message(value: &Value) -> Option<WireMessage> {
    let ty = value.get("type")?.as_str()?;
    if ty != "error" {
        return None;
    }
    serde_json::from_value(value.clone())
        .ok()
        .map(WireMessage::Error)
}

/// Ordered most-specific-first: audio frames are checked before the
/// generic `type`-tagged control/transcript strategies.
const DECODE_CHAIN: &[DecodeStrategy] = &[
    decode_audio_data,
    decode_audio_metadata,
    decode_control_stop_audio,
    decode_audio_done,
    decode_control_test_settings,
    decode_session_start,
    decode_connection_established,
    decode_connection_ready,
    decode_participant_changed,
    decode_participant_list,
    decode_error_message,
    decode_transcript,
    decode_text_delta,
];

/// Decodes one JSON text frame. Returns `WireMessage::Unknown` rather than
/// an error for anything no strategy recognizes — callers decide whether
/// that is a protocol violation worth logging.
#[must_use]
pub fn decode(raw: &str) -> Result<WireMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    for strategy in DECODE_CHAIN {
        if let Some(message) = strategy(&value) {
            return Ok(message);
        }
    }
    Ok(WireMessage::Unknown(value))
}

/// Encodes a message back to wire text.
#[must_use]
pub fn encode(message: &WireMessage) -> String {
    message.to_json().to_string()
}

/// Normalizes a provider timestamp to scenario-relative milliseconds
/// (§4.D). Values above [`ABSOLUTE_TIMESTAMP_THRESHOLD_MS`] are treated as
/// absolute epoch milliseconds and rebased against `session_start_ms`;
/// smaller values are assumed already relative and returned unchanged.
///
/// Known limitation (kept intentionally, see SPEC_FULL.md §9): a
/// legitimate relative timestamp above ~11 days would be misclassified as
/// absolute. No discriminator field exists on the wire to disambiguate.
#[must_use]
pub fn normalize_timestamp_ms(raw: i64, session_start_ms: i64) -> i64 {
    if raw > ABSOLUTE_TIMESTAMP_THRESHOLD_MS {
        raw - session_start_ms
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_audio_data_frame() {
        let msg = AudioDataMessage::new(Some("p1".into()), &[1, 2, 3], 42);
        let raw = encode(&WireMessage::AudioData(msg.clone()));
        let decoded = decode(&raw).unwrap();
        match decoded {
            WireMessage::AudioData(got) => {
                assert_eq!(got.decode_pcm().unwrap(), vec![1, 2, 3]);
                assert_eq!(got.audio_data.participant_raw_id.as_deref(), Some("p1"));
            }
            other => panic!("expected AudioData, got {other:?}"),
        }
    }

    #[test]
    fn decodes_audio_metadata_frame() {
        let raw = serde_json::json!({
            "kind": "AudioMetadata",
            "audioMetadata": {
                "subscriptionId": "sub-1",
                "encoding": "PCM16",
                "sampleRate": 16000,
                "channels": 1,
                "length": 640
            }
        })
        .to_string();
        let decoded = decode(&raw).unwrap();
        assert!(matches!(decoded, WireMessage::AudioMetadata(_)));
    }

    #[test]
    fn decodes_control_test_settings() {
        let msg = ControlTestSettingsMessage::new("mock", "play_through");
        let raw = encode(&WireMessage::ControlTestSettings(msg));
        let decoded = decode(&raw).unwrap();
        assert!(matches!(decoded, WireMessage::ControlTestSettings(_)));
    }

    #[test]
    fn unrecognized_message_becomes_unknown() {
        let raw = serde_json::json!({"kind": "something_else"}).to_string();
        let decoded = decode(&raw).unwrap();
        assert!(matches!(decoded, WireMessage::Unknown(_)));
    }

    #[test]
    fn round_trip_is_stable() {
        let msg = WireMessage::AudioData(AudioDataMessage::new(None, b"hello", 1));
        let encoded_once = encode(&msg);
        let decoded = decode(&encoded_once).unwrap();
        let encoded_twice = encode(&decoded);
        assert_eq!(decoded, msg);
        assert_eq!(
            serde_json::from_str::<Value>(&encoded_once).unwrap(),
            serde_json::from_str::<Value>(&encoded_twice).unwrap()
        );
    }

    #[test]
    fn audio_payload_detection_matches_gate_definition() {
        let audio = WireMessage::AudioData(AudioDataMessage::new(None, b"x", 0));
        let control = WireMessage::ControlStopAudio(ControlStopAudioMessage {
            message_type: "control.stop_audio".into(),
            stream_id: None,
        });
        assert!(audio.is_audio_payload());
        assert!(!control.is_audio_payload());
    }

    #[test]
    fn timestamp_normalization_rebases_absolute_values() {
        let session_start = 1_700_000_000_000;
        let absolute = session_start + 500;
        assert_eq!(normalize_timestamp_ms(absolute, session_start), 500);
        assert_eq!(normalize_timestamp_ms(120, session_start), 120);
    }

    #[test]
    fn decodes_session_start() {
        let msg = SessionStartMessage {
            message_type: "session.start".into(),
            call_code: "ABC123".into(),
            participant_id: "p1".into(),
            routing: Some("shared".into()),
        };
        let raw = encode(&WireMessage::SessionStart(msg.clone()));
        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded, WireMessage::SessionStart(msg));
    }

    #[test]
    fn session_start_routing_defaults_to_absent() {
        let raw = serde_json::json!({
            "type": "session.start",
            "call_code": "ABC123",
            "participant_id": "p1"
        })
        .to_string();
        let decoded = decode(&raw).unwrap();
        match decoded {
            WireMessage::SessionStart(got) => assert_eq!(got.routing, None),
            other => panic!("expected SessionStart, got {other:?}"),
        }
    }

    #[test]
    fn decodes_error_message() {
        let msg = ErrorMessage::new("unknown call code");
        let raw = encode(&WireMessage::Error(msg.clone()));
        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded, WireMessage::Error(msg));
    }

    #[test]
    fn decodes_participant_joined_and_left() {
        let joined = serde_json::json!({
            "type": "participant.joined",
            "participant_id": "p2",
            "participants": ["p1", "p2"]
        })
        .to_string();
        assert!(matches!(decode(&joined).unwrap(), WireMessage::ParticipantChanged(_)));

        let left = serde_json::json!({
            "type": "participant.left",
            "participant_id": "p2",
            "participants": ["p1"]
        })
        .to_string();
        assert!(matches!(decode(&left).unwrap(), WireMessage::ParticipantChanged(_)));
    }

    #[test]
    fn decodes_participant_list_and_connection_messages() {
        let list = serde_json::json!({
            "type": "participant.list",
            "participants": ["p1", "p2"]
        })
        .to_string();
        assert!(matches!(decode(&list).unwrap(), WireMessage::ParticipantList(_)));

        let established = serde_json::json!({
            "type": "connection.established",
            "session_id": "s1"
        })
        .to_string();
        assert!(matches!(decode(&established).unwrap(), WireMessage::ConnectionEstablished(_)));

        let ready = serde_json::json!({"type": "connection.ready"}).to_string();
        assert!(matches!(decode(&ready).unwrap(), WireMessage::ConnectionReady(_)));
    }
}
