//! Upstream Connection (§4.C): one logical WebSocket connection to a
//! translation provider. Connecting is timeout-bounded, and once open the
//! connection splits into a dedicated egress task and an ingress decode
//! loop running independently.
//!
//! Reconnection policy (exponential backoff between a configured min/max
//! delay) is driven by the Session Pipeline, not by this component —
//! `connect` makes exactly one attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{self, WireMessage};

/// Connection parameters and reconnection policy for one upstream
/// provider endpoint.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub max_inbound_frame_bytes: usize,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Bearer token sent as `Authorization: Bearer <token>` on the upgrade
    /// request, when the configured provider requires one. No
    /// vendor-specific signing scheme is supported.
    pub bearer_token: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            max_inbound_frame_bytes: crate::protocol_constants::MAX_UPSTREAM_FRAME_BYTES,
            reconnect_min_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            bearer_token: None,
        }
    }
}

/// Whether a message is one of the kinds this crate forwards to the
/// provider: `AudioMetadata`, `AudioData`, or any `control.*`-typed
/// message. Anything else is logged and dropped rather than forwarded
/// blindly.
fn outbound_allowed(message: &WireMessage) -> bool {
    match message {
        WireMessage::AudioMetadata(_) | WireMessage::AudioData(_) => true,
        WireMessage::ControlTestSettings(_) | WireMessage::ControlStopAudio(_) => true,
        WireMessage::Unknown(value) => value
            .get("type")
            .and_then(|v| v.as_str())
            .is_some_and(|ty| ty.starts_with("control.")),
        WireMessage::Transcript(_) | WireMessage::TextDelta(_) | WireMessage::AudioDone(_) => false,
        WireMessage::SessionStart(_)
        | WireMessage::ConnectionEstablished(_)
        | WireMessage::ConnectionReady(_)
        | WireMessage::ParticipantChanged(_)
        | WireMessage::ParticipantList(_)
        | WireMessage::Error(_) => false,
    }
}

/// Whether a message received from the provider is one of the kinds this
/// crate accepts: `AudioData`, `AudioMetadata`, or a control response.
/// Anything unrecognized (`Unknown`) is logged and dropped.
fn inbound_allowed(message: &WireMessage) -> bool {
    !matches!(message, WireMessage::Unknown(_))
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One logical connection to a translation provider.
pub struct UpstreamConnection {
    outbound_tx: mpsc::UnboundedSender<WireMessage>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<WireMessage>>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
    egress_task: JoinHandle<()>,
    ingress_task: JoinHandle<()>,
}

impl UpstreamConnection {
    /// Makes a single connection attempt. The caller (Session Pipeline)
    /// retries with its own backoff schedule on failure.
    pub async fn connect(config: UpstreamConfig) -> GatewayResult<Self> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = config
            .url
            .clone()
            .into_client_request()
            .map_err(|err| GatewayError::UpstreamConnect(err.to_string()))?;
        if let Some(token) = &config.bearer_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| GatewayError::UpstreamConnect("invalid bearer token".to_string()))?;
            request
                .headers_mut()
                .insert(tokio_tungstenite::tungstenite::http::header::AUTHORIZATION, value);
        }

        let (ws_stream, _response) = timeout(
            Duration::from_millis(config.connect_timeout_ms),
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| GatewayError::UpstreamConnect(format!("connect timed out: {}", config.url)))?
        .map_err(|err| GatewayError::UpstreamConnect(err.to_string()))?;

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let ready = Arc::new(AtomicBool::new(true));
        let ready_notify = Arc::new(Notify::new());
        ready_notify.notify_waiters();

        let egress_task = tokio::spawn(Self::run_egress(write, outbound_rx));
        let ingress_task = tokio::spawn(Self::run_ingress(read, inbound_tx, config.max_inbound_frame_bytes));

        Ok(Self {
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            ready,
            ready_notify,
            egress_task,
            ingress_task,
        })
    }

    async fn run_egress(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut outbound_rx: mpsc::UnboundedReceiver<WireMessage>,
    ) {
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            crate::protocol_constants::UPSTREAM_HEARTBEAT_INTERVAL_SECS,
        ));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    if !outbound_allowed(&message) {
                        warn!(message = ?message, "dropping disallowed outbound message to upstream");
                        continue;
                    }
                    let text = protocol::encode(&message);
                    if let Err(err) = write.send(Message::Text(text.into())).await {
                        warn!(error = %err, "upstream egress send failed");
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = write.send(Message::Ping(Vec::new().into())).await {
                        warn!(error = %err, "upstream keep-alive ping failed");
                        break;
                    }
                }
            }
        }
        let _ = write.close().await;
    }

    async fn run_ingress(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound_tx: mpsc::UnboundedSender<WireMessage>,
        max_frame_bytes: usize,
    ) {
        while let Some(frame) = read.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "upstream ingress read failed");
                    break;
                }
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => break,
            };
            if text.len() > max_frame_bytes {
                warn!(frame_bytes = text.len(), limit = max_frame_bytes, "oversized upstream frame dropped");
                continue;
            }
            let decoded = match protocol::decode(&text) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "failed to decode upstream frame");
                    continue;
                }
            };
            if !inbound_allowed(&decoded) {
                debug!(message = ?decoded, "dropping unrecognized upstream frame");
                continue;
            }
            if inbound_tx.send(decoded).is_err() {
                break;
            }
        }
    }

    /// Enqueues a message for the egress task. Returns an error if the
    /// connection's egress side has already terminated.
    pub fn send(&self, message: WireMessage) -> GatewayResult<()> {
        self.outbound_tx
            .send(message)
            .map_err(|_| GatewayError::UpstreamMidStream("egress channel closed".to_string()))
    }

    /// Awaits the next inbound message, or `None` once the provider
    /// connection has closed.
    pub async fn recv(&self) -> Option<WireMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Resolves once the connection has completed its handshake. Since
    /// `connect` only returns after the handshake succeeds, this resolves
    /// immediately in practice; kept as a single await point so callers
    /// don't have to change if a future handshake step (e.g. an upstream
    /// `session.created` ack) makes readiness asynchronous.
    pub async fn wait_ready(&self) {
        if self.ready.load(Ordering::Acquire) {
            return;
        }
        self.ready_notify.notified().await;
    }

    /// Cancels the egress and ingress tasks, tearing down the connection.
    pub fn close(&self) {
        self.egress_task.abort();
        self.ingress_task.abort();
    }
}

impl Drop for UpstreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AudioDataMessage, ControlStopAudioMessage, TranscriptMessage};

    #[test]
    fn audio_and_metadata_are_outbound_allowed() {
        assert!(outbound_allowed(&WireMessage::AudioData(AudioDataMessage::new(None, b"x", 0))));
    }

    #[test]
    fn control_dot_prefixed_unknown_is_outbound_allowed() {
        let msg = WireMessage::Unknown(serde_json::json!({"type": "control.cancel"}));
        assert!(outbound_allowed(&msg));
    }

    #[test]
    fn transcript_is_not_forwarded_upstream() {
        let msg = WireMessage::Transcript(TranscriptMessage {
            message_type: "transcript".into(),
            participant_id: "p1".into(),
            source_language: "en".into(),
            target_language: "es".into(),
            text: "hi".into(),
            timestamp_ms: 0,
        });
        assert!(!outbound_allowed(&msg));
    }

    #[test]
    fn unrecognized_unknown_is_not_outbound_allowed() {
        let msg = WireMessage::Unknown(serde_json::json!({"foo": "bar"}));
        assert!(!outbound_allowed(&msg));
    }

    #[test]
    fn known_kinds_are_inbound_allowed() {
        let msg = WireMessage::ControlStopAudio(ControlStopAudioMessage {
            message_type: "control.stop_audio".into(),
            stream_id: None,
        });
        assert!(inbound_allowed(&msg));
    }

    #[test]
    fn unknown_is_not_inbound_allowed() {
        let msg = WireMessage::Unknown(serde_json::json!({"foo": "bar"}));
        assert!(!inbound_allowed(&msg));
    }
}
