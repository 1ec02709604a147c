//! Session Router (§4.K): accepts a downstream WebSocket connection,
//! resolves its first message to a call/participant, and then runs the
//! connection's read/write loop for the lifetime of the session. A single
//! task owns both socket halves for the life of the connection, selecting
//! between inbound frames and whatever the session has queued to send
//! outbound.
//!
//! This router also drives per-chunk voice activity detection (§4.F):
//! every inbound `AudioData` frame's RMS feeds the participant's
//! `InputVoiceState`, and a detected transition is wired both to that
//! participant's own [`OutboundAudioGate`] and to the call's
//! [`SessionPipeline`] barge-in control plane.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, trace, warn};
use uuid::Uuid;

use crate::audio::batcher::rms_pcm16;
use crate::audio::gate::{OutboundAudioGate, OutboundGateMode};
use crate::call::{Call, CallManager};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, RouterError};
use crate::pipeline::{RoutingStrategy, SessionPipeline};
use crate::protocol::{self, ConnectionEstablishedMessage, ConnectionReadyMessage, ErrorMessage, WireMessage};
use crate::protocol_constants::SILENCE_RMS_THRESHOLD;
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Accepts and routes one downstream connection for its entire lifetime.
pub struct SessionRouter;

impl SessionRouter {
    /// Entry point for an accepted WebSocket upgrade. Every failure path on
    /// the first message sends a wire `error` notice and closes with the
    /// code the failure specifies (§6) rather than just dropping the
    /// socket, so a well-behaved client can tell a rejected join from a
    /// network error.
    pub async fn handle_socket(socket: WebSocket, call_manager: Arc<CallManager>, config: Arc<GatewayConfig>) {
        let session_id = Uuid::new_v4().to_string();
        let (mut sender, mut receiver) = socket.split();

        let established = WireMessage::ConnectionEstablished(ConnectionEstablishedMessage {
            message_type: "connection.established".to_string(),
            session_id: session_id.clone(),
        });
        if sender.send(text(&established)).await.is_err() {
            return;
        }

        let first = match receiver.next().await {
            Some(Ok(Message::Text(raw))) => raw,
            _ => return close_with(&mut sender, RouterError::MissingCallCode).await,
        };

        let start = match protocol::decode(&first) {
            Ok(WireMessage::SessionStart(m)) => m,
            _ => return close_with(&mut sender, RouterError::MissingCallCode).await,
        };

        if start.call_code.trim().is_empty() {
            return close_with(&mut sender, RouterError::MissingCallCode).await;
        }
        if start.participant_id.trim().is_empty() {
            return close_with(&mut sender, RouterError::MissingParticipantId).await;
        }

        let Some(call) = call_manager.get_call(&start.call_code) else {
            return close_with(&mut sender, RouterError::UnknownCall(start.call_code.clone())).await;
        };

        let routing = RoutingStrategy::from_value(start.routing.as_deref());
        let gate_mode = OutboundGateMode::from_value(Some(&call.barge_in_mode));
        let (gate_tx, gate_rx) = mpsc::unbounded_channel();
        let gate = OutboundAudioGate::new(session_id.clone(), gate_mode, gate_tx);

        let pipeline = match call_manager
            .add_participant(&call, &start.participant_id, routing, &config, gate)
            .await
        {
            Ok(pipeline) => pipeline,
            Err(err) => return close_with(&mut sender, RouterError::Gateway(err)).await,
        };

        let ready = WireMessage::ConnectionReady(ConnectionReadyMessage {
            message_type: "connection.ready".to_string(),
        });
        if sender.send(text(&ready)).await.is_err() {
            call_manager.remove_participant(&call, &start.participant_id).await;
            return;
        }

        info!(call_code = %call.code, participant_id = %start.participant_id, session_id, "participant connected");

        Self::run_connection_loop(&mut sender, &mut receiver, gate_rx, &call, &pipeline, &start.participant_id, &config).await;

        call_manager.remove_participant(&call, &start.participant_id).await;
        info!(call_code = %call.code, participant_id = %start.participant_id, session_id, "participant disconnected");
    }

    /// Drives one session's socket: selects between frames arriving from
    /// the downstream client and frames the session's outbound gate has
    /// queued for it, until either side closes or an invariant breach forces
    /// the session down.
    async fn run_connection_loop(
        sender: &mut futures::stream::SplitSink<WebSocket, Message>,
        receiver: &mut futures::stream::SplitStream<WebSocket>,
        mut gate_rx: mpsc::UnboundedReceiver<WireMessage>,
        call: &Arc<Call>,
        pipeline: &Arc<SessionPipeline>,
        participant_id: &str,
        config: &GatewayConfig,
    ) {
        loop {
            tokio::select! {
                outbound = gate_rx.recv() => {
                    match outbound {
                        Some(message) => {
                            if sender.send(text(&message)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(raw))) => {
                            match Self::handle_inbound_frame(&raw, call, pipeline, participant_id, config) {
                                Ok(()) => {}
                                Err(err) => {
                                    warn!(call_code = %call.code, participant_id, error = %err, "closing session on invariant breach");
                                    close_with(sender, RouterError::Gateway(err)).await;
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
        }
    }

    /// Decodes one inbound text frame and dispatches it. `AudioData` also
    /// drives voice-activity detection (§4.F); `AudioMetadata` is validated
    /// against the sample-width invariant before anything downstream relies
    /// on it.
    fn handle_inbound_frame(
        raw: &str,
        call: &Arc<Call>,
        pipeline: &Arc<SessionPipeline>,
        participant_id: &str,
        config: &GatewayConfig,
    ) -> Result<(), GatewayError> {
        let message = match protocol::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(call_code = %call.code, participant_id, error = %err, "dropping undecodable inbound frame");
                return Ok(());
            }
        };
        trace!(call_code = %call.code, participant_id, frame = raw, "inbound wire frame");

        match &message {
            WireMessage::AudioData(_) if !Self::metadata_seen(call, participant_id) => {
                return Err(GatewayError::InvariantBreach(
                    "AudioData received before AudioMetadata".to_string(),
                ));
            }
            WireMessage::AudioData(m) => {
                if let Ok(pcm) = m.decode_pcm() {
                    Self::update_voice_state(call, pipeline, participant_id, &pcm, config);
                }
            }
            WireMessage::AudioMetadata(m) if m.audio_metadata.encoding != "PCM16" => {
                return Err(GatewayError::InvariantBreach(format!(
                    "unsupported encoding: {}",
                    m.audio_metadata.encoding
                )));
            }
            WireMessage::AudioMetadata(_) => {
                if let Some(entry) = call.participants.get(participant_id) {
                    entry.value().metadata_seen.store(true, std::sync::atomic::Ordering::Release);
                }
            }
            WireMessage::Unknown(value) => {
                warn!(call_code = %call.code, participant_id, frame = %value, "ignoring unrecognized inbound frame");
                return Ok(());
            }
            _ => {}
        }

        pipeline.ingress.publish(message);
        Ok(())
    }

    /// Whether `participant_id` has sent a valid `AudioMetadata` frame yet.
    /// A participant not found in the roster (already removed) is treated
    /// as having none, so a race with disconnect fails closed.
    fn metadata_seen(call: &Arc<Call>, participant_id: &str) -> bool {
        call.participants
            .get(participant_id)
            .is_some_and(|entry| entry.value().metadata_seen.load(std::sync::atomic::Ordering::Acquire))
    }

    /// Computes RMS for one inbound chunk and feeds it to the sender's
    /// voice state. A detected transition flushes/cancels via the gate and
    /// pipeline, matching the barge-in semantics of §4.I.
    fn update_voice_state(
        call: &Arc<Call>,
        pipeline: &Arc<SessionPipeline>,
        participant_id: &str,
        pcm: &[u8],
        config: &GatewayConfig,
    ) {
        let Some(entry) = call.participants.get(participant_id) else {
            return;
        };
        let handle = entry.value().clone();
        drop(entry);
        let rms = rms_pcm16(pcm);
        let now = crate::utils::now_millis();

        let transition = {
            let mut voice_state = handle.voice_state.lock();
            if rms >= SILENCE_RMS_THRESHOLD {
                voice_state.on_voice_detected(now, config.voice_hysteresis_ms).then_some(true)
            } else {
                voice_state.on_silence_detected(now, config.voice_silence_threshold_ms).then_some(false)
            }
        };

        let Some(is_speaking) = transition else {
            return;
        };

        let pipeline = pipeline.clone();
        let participant_id = participant_id.to_string();
        let _handle = TokioSpawner::current().spawn(async move {
            if let Err(err) = handle.gate.lock().await.on_input_state_changed(is_speaking) {
                warn!(participant_id, error = %err, "failed to update outbound gate on voice state transition");
            }
            pipeline.on_speaker_transitioned(&participant_id, is_speaking);
        });
    }
}

/// Shared state for the crate's two owned HTTP surfaces (§6): the `/ws`
/// upgrade route and `/healthz`. Cheap to clone — both fields are already
/// `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub call_manager: Arc<CallManager>,
    pub config: Arc<GatewayConfig>,
}

/// `GET /ws` upgrade handler: hands the upgraded socket to the router.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| SessionRouter::handle_socket(socket, state.call_manager, state.config))
}

/// `GET /healthz`: reports process liveness and the number of active calls.
/// Always 200; this is a liveness probe, not a readiness check over
/// individual provider connections.
async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_calls": state.call_manager.list_recent_calls().iter().filter(|c| c.is_active).count(),
    }))
}

/// Builds the crate's owned HTTP surface: the `/ws` upgrade route and
/// `/healthz`, with request tracing and permissive CORS so a
/// browser-hosted downstream client can connect from any origin.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn text(message: &WireMessage) -> Message {
    let encoded = protocol::encode(message);
    trace!(frame = %encoded, "outbound wire frame");
    Message::Text(encoded.into())
}

async fn close_with(sender: &mut futures::stream::SplitSink<WebSocket, Message>, err: RouterError) {
    let code = err.close_code();
    let notice = WireMessage::Error(ErrorMessage::new(err.to_string()));
    let _ = sender.send(text(&notice)).await;
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: err.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::gate::{OutboundAudioGate, OutboundGateMode as GateMode};
    use crate::protocol::{AudioDataMessage, AudioMetadataBody, AudioMetadataMessage};
    use tokio::sync::mpsc;

    #[test]
    fn gate_mode_falls_back_to_barge_in_mode_string() {
        assert_eq!(OutboundGateMode::from_value(Some("pause_and_drop")), OutboundGateMode::PauseAndDrop);
        assert_eq!(OutboundGateMode::from_value(Some("bogus")), OutboundGateMode::PlayThrough);
    }

    async fn joined_call(config: &GatewayConfig) -> (Arc<Call>, Arc<SessionPipeline>) {
        let manager = CallManager::new();
        let code = manager.create_call("test", "mock", "play_through");
        let call = manager.get_call(&code).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let gate = OutboundAudioGate::new("sess-1".to_string(), GateMode::PlayThrough, tx);
        let pipeline = manager
            .add_participant(&call, "p1", RoutingStrategy::Shared, config, gate)
            .await
            .unwrap();
        (call, pipeline)
    }

    #[tokio::test]
    async fn audio_data_before_metadata_is_an_invariant_breach() {
        let config = GatewayConfig::default();
        let (call, pipeline) = joined_call(&config).await;

        let frame = protocol::encode(&WireMessage::AudioData(AudioDataMessage::new(
            Some("p1".to_string()),
            &vec![0u8; 640],
            0,
        )));

        let err = SessionRouter::handle_inbound_frame(&frame, &call, &pipeline, "p1", &config).unwrap_err();
        assert!(matches!(err, GatewayError::InvariantBreach(_)));
    }

    #[tokio::test]
    async fn audio_data_after_metadata_is_accepted() {
        let config = GatewayConfig::default();
        let (call, pipeline) = joined_call(&config).await;

        let metadata = protocol::encode(&WireMessage::AudioMetadata(AudioMetadataMessage {
            kind: "AudioMetadata".to_string(),
            audio_metadata: AudioMetadataBody {
                subscription_id: "1".to_string(),
                encoding: "PCM16".to_string(),
                sample_rate: 16_000,
                channels: 1,
                length: None,
            },
        }));
        SessionRouter::handle_inbound_frame(&metadata, &call, &pipeline, "p1", &config).unwrap();

        let frame = protocol::encode(&WireMessage::AudioData(AudioDataMessage::new(
            Some("p1".to_string()),
            &vec![0u8; 640],
            0,
        )));
        SessionRouter::handle_inbound_frame(&frame, &call, &pipeline, "p1", &config).unwrap();
    }
}
