//! Generic WebSocket passthrough provider adapter (§14): one persistent
//! upstream WebSocket, an egress side registered as a [`BusHandler`] on
//! the provider-outbound commit bus, and an ingress loop translating
//! upstream frames into [`ProviderOutputEvent`]s. Carries no
//! vendor-specific request shape or headers beyond a bearer token — any
//! provider speaking the wire shapes of §4.D/§6 can sit behind it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{BusHandler, EventBus, HandlerConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::model::{Commit, DoneReason, ProviderOutputEvent};
use crate::protocol::{AudioDataMessage, WireMessage};
use crate::provider::adapter::ProviderAdapter;
use crate::queue::OverflowPolicy;
use crate::upstream::{UpstreamConfig, UpstreamConnection};

const EGRESS_HANDLER_NAME: &str = "generic_ws_egress";

/// Translates a decoded upstream [`WireMessage`] into the canonical
/// [`ProviderOutputEvent`] shape the Provider Output Normalizer consumes.
/// Messages the upstream sends that carry no session/participant/stream
/// correlation (e.g. a bare `system_info_response`) are logged and
/// dropped, since the normalizer has nothing to key a buffer on.
fn to_provider_event(message: WireMessage, session_id: &str, participant_id: &str) -> Option<ProviderOutputEvent> {
    match message {
        WireMessage::AudioData(m) => {
            let pcm = m.decode_pcm().ok()?;
            let stream_id = m
                .audio_data
                .participant_raw_id
                .clone()
                .unwrap_or_else(|| participant_id.to_string());
            Some(ProviderOutputEvent::AudioDelta {
                commit_id: Uuid::new_v4(),
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
                provider: "generic_ws".to_string(),
                stream_id,
                response_id: None,
                item_id: None,
                pcm,
            })
        }
        WireMessage::Transcript(m) => Some(ProviderOutputEvent::TranscriptDone {
            session_id: session_id.to_string(),
            participant_id: m.participant_id,
            source_language: m.source_language,
            target_language: m.target_language,
            text: m.text,
        }),
        WireMessage::TextDelta(m) => Some(ProviderOutputEvent::TranscriptDelta {
            session_id: session_id.to_string(),
            participant_id: m.participant_id,
            source_language: m.source_language,
            target_language: m.target_language,
            delta: m.delta,
        }),
        WireMessage::ControlStopAudio(m) => Some(ProviderOutputEvent::ControlStop {
            session_id: session_id.to_string(),
            stream_id: m.stream_id.unwrap_or_default(),
        }),
        WireMessage::AudioDone(m) => Some(ProviderOutputEvent::AudioDone {
            commit_id: Uuid::new_v4(),
            session_id: m.session_id,
            participant_id: m.participant_id,
            stream_id: m.stream_id,
            reason: DoneReason::Completed,
            error: m.error,
        }),
        _ => None,
    }
}

/// One persistent upstream connection shared by every commit routed
/// through this adapter. Construction does not connect; `start` does.
///
/// Cloning shares the connection handle and task slots, mirroring
/// [`crate::provider::mock::MockAdapter`]'s clone-to-register-as-handler
/// pattern.
#[derive(Clone)]
pub struct GenericWsAdapter {
    session_id: String,
    participant_id: String,
    upstream_config: UpstreamConfig,
    provider_outbound: EventBus<Commit>,
    provider_inbound: EventBus<ProviderOutputEvent>,
    connection: Arc<AsyncMutex<Option<Arc<UpstreamConnection>>>>,
    ingress_task: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
}

impl GenericWsAdapter {
    #[must_use]
    pub fn new(
        session_id: String,
        participant_id: String,
        upstream_config: UpstreamConfig,
        provider_outbound: EventBus<Commit>,
        provider_inbound: EventBus<ProviderOutputEvent>,
    ) -> Self {
        Self {
            session_id,
            participant_id,
            upstream_config,
            provider_outbound,
            provider_inbound,
            connection: Arc::new(AsyncMutex::new(None)),
            ingress_task: Arc::new(AsyncMutex::new(None)),
        }
    }
}

#[async_trait]
impl BusHandler<Commit> for GenericWsAdapter {
    async fn handle(&self, commit: Commit) {
        let connection = self.connection.lock().await.clone();
        let Some(connection) = connection else {
            warn!(commit_id = %commit.commit_id, "dropping commit, upstream not connected");
            return;
        };
        let message = WireMessage::AudioData(AudioDataMessage::new(
            Some(commit.participant_id.clone()),
            &commit.pcm,
            commit.created_at_ms as i64,
        ));
        if let Err(err) = connection.send(message) {
            warn!(commit_id = %commit.commit_id, error = %err, "failed to forward commit upstream");
        }
    }
}

#[async_trait]
impl ProviderAdapter for GenericWsAdapter {
    async fn start(&self) -> GatewayResult<()> {
        let connection = Arc::new(UpstreamConnection::connect(self.upstream_config.clone()).await?);
        connection.wait_ready().await;
        *self.connection.lock().await = Some(connection.clone());

        self.provider_outbound.register_handler(
            HandlerConfig {
                name: EGRESS_HANDLER_NAME.to_string(),
                queue_max: 1000,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(self.clone()),
        );

        let session_id = self.session_id.clone();
        let participant_id = self.participant_id.clone();
        let provider_inbound = self.provider_inbound.clone();
        let connection_for_health = self.connection.clone();
        let ingress_task = tokio::spawn(async move {
            while let Some(message) = connection.recv().await {
                if let Some(event) = to_provider_event(message, &session_id, &participant_id) {
                    provider_inbound.publish(event);
                }
            }
            // The upstream closed the socket (or it died) without us calling
            // `close()` ourselves: clear the held connection so `health()`
            // reflects reality, and surface the drop as a terminal event so
            // the downstream session sees `audio.done{reason=error}` instead
            // of silently stalling mid-stream.
            if connection_for_health.lock().await.take().is_some() {
                warn!(session_id = %session_id, "upstream connection dropped mid-stream");
                provider_inbound.publish(ProviderOutputEvent::Error {
                    session_id: session_id.clone(),
                    participant_id: participant_id.clone(),
                    stream_id: participant_id,
                    message: "upstream connection dropped".to_string(),
                });
            }
        });
        *self.ingress_task.lock().await = Some(ingress_task);

        info!(session_id = %self.session_id, url = %self.upstream_config.url, "generic_ws adapter started");
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        self.provider_outbound.pause(EGRESS_HANDLER_NAME);
        if let Some(task) = self.ingress_task.lock().await.take() {
            task.abort();
        }
        if let Some(connection) = self.connection.lock().await.take() {
            connection.close();
        }
        Ok(())
    }

    async fn health(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    async fn cancel(&self, response_id: Option<&str>) -> GatewayResult<()> {
        let connection = self.connection.lock().await.clone();
        let Some(connection) = connection else {
            return Ok(());
        };
        let payload = serde_json::json!({
            "type": "control.cancel",
            "response_id": response_id,
        });
        connection
            .send(WireMessage::Unknown(payload))
            .map_err(|err| GatewayError::UpstreamMidStream(err.to_string()))
    }

    async fn send_handshake(&self, settings: WireMessage, metadata: WireMessage) -> GatewayResult<()> {
        let connection = self.connection.lock().await.clone();
        let Some(connection) = connection else {
            return Err(GatewayError::UpstreamConnect("adapter not started".to_string()));
        };
        connection.send(settings)?;
        connection.send(metadata)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_data_maps_to_audio_delta_event() {
        let msg = WireMessage::AudioData(AudioDataMessage::new(None, b"hi", 0));
        let event = to_provider_event(msg, "s1", "p1").unwrap();
        assert!(matches!(event, ProviderOutputEvent::AudioDelta { .. }));
    }

    #[test]
    fn system_info_response_has_no_mapping() {
        let msg = WireMessage::Unknown(serde_json::json!({"type": "system_info_response"}));
        assert!(to_provider_event(msg, "s1", "p1").is_none());
    }

    #[tokio::test]
    async fn health_is_false_before_start() {
        let adapter = GenericWsAdapter::new(
            "s1".into(),
            "p1".into(),
            UpstreamConfig::default(),
            EventBus::new("provider_outbound"),
            EventBus::new("provider_inbound"),
        );
        assert!(!adapter.health().await);
    }
}
