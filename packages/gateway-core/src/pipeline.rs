//! Session Pipeline (§4.I): for one call (or one participant, in
//! `per_participant` mode), owns the four event buses that carry a
//! connection's traffic end to end — `ingress`, `provider_outbound`,
//! `provider_inbound`, `outbound` — plus the commit batcher, provider
//! adapter, and output normalizer wired across them, and the barge-in
//! control plane: a small piece of in-process bookkeeping that watches
//! for a participant starting to speak while translated audio is still
//! playing out.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::audio::{BatcherConfig, CommitBatcher, OutputNormalizer};
use crate::bus::{BusHandler, EventBus, HandlerConfig};
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::model::{AudioFormat, Commit, ProviderOutputEvent};
use crate::protocol::{AudioDataMessage, AudioMetadataBody, AudioMetadataMessage, ControlTestSettingsMessage, WireMessage};
use crate::protocol_constants::PCM_SAMPLE_WIDTH_BYTES;
use crate::provider::{AdapterFactory, ProviderAdapter};
use crate::queue::OverflowPolicy;
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Pipeline topology a call selects from its first participant's
/// `session.start` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// One pipeline, one upstream provider connection, serves every
    /// participant of the call. The default.
    Shared,
    /// Each participant gets its own pipeline and upstream connection,
    /// instantiated the first time that participant sends audio.
    PerParticipant,
}

impl RoutingStrategy {
    /// Parses a `session.start` `routing` field, defaulting to
    /// [`Self::Shared`] for anything absent or unrecognized.
    #[must_use]
    pub fn from_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("per_participant") => Self::PerParticipant,
            _ => Self::Shared,
        }
    }
}

/// Tracks whether translated audio is currently playing out, and what it
/// would take to interrupt it. Pure in-process bookkeeping; not a
/// separately addressable component.
struct BargeInState {
    playback_active: bool,
    current_response_id: Option<String>,
    last_barge_in_ms: Option<u64>,
}

impl Default for BargeInState {
    fn default() -> Self {
        Self {
            playback_active: false,
            current_response_id: None,
            last_barge_in_ms: None,
        }
    }
}

struct NormalizerHandler {
    normalizer: Arc<OutputNormalizer>,
}

#[async_trait]
impl BusHandler<ProviderOutputEvent> for NormalizerHandler {
    async fn handle(&self, event: ProviderOutputEvent) {
        self.normalizer.handle(event).await;
    }
}

struct BargeInTracker {
    state: Arc<Mutex<BargeInState>>,
}

#[async_trait]
impl BusHandler<ProviderOutputEvent> for BargeInTracker {
    async fn handle(&self, event: ProviderOutputEvent) {
        let mut state = self.state.lock();
        match event {
            ProviderOutputEvent::AudioDelta { response_id, .. } => {
                state.playback_active = true;
                if response_id.is_some() {
                    state.current_response_id = response_id;
                }
            }
            ProviderOutputEvent::AudioDone { .. } | ProviderOutputEvent::Error { .. } => {
                state.playback_active = false;
                state.current_response_id = None;
            }
            _ => {}
        }
    }
}

struct IngressDispatcher {
    call_code: String,
    batcher: CommitBatcher,
}

#[async_trait]
impl BusHandler<WireMessage> for IngressDispatcher {
    async fn handle(&self, message: WireMessage) {
        match message {
            WireMessage::AudioData(m) => {
                let Some(participant_id) = m.audio_data.participant_raw_id.clone() else {
                    warn!(call_code = %self.call_code, "dropping inbound audio with no participant id");
                    return;
                };
                match m.decode_pcm() {
                    Ok(pcm) => self.batcher.on_chunk(&self.call_code, &participant_id, &pcm),
                    Err(err) => warn!(call_code = %self.call_code, participant_id, error = %err, "failed to decode inbound audio payload"),
                }
            }
            WireMessage::AudioMetadata(m) => {
                debug!(call_code = %self.call_code, subscription_id = %m.audio_metadata.subscription_id, "ignoring renegotiated audio metadata");
            }
            other => {
                debug!(call_code = %self.call_code, message = ?other, "ignoring non-audio ingress message");
            }
        }
    }
}

const INGRESS_HANDLER_NAME: &str = "batcher";
const NORMALIZER_HANDLER_NAME: &str = "normalizer";
const BARGE_IN_TRACKER_HANDLER_NAME: &str = "barge_in_tracker";

/// Owns one end-to-end audio/translation/transcript path (§4.I).
pub struct SessionPipeline {
    call_code: String,
    participant_label: String,
    pub ingress: EventBus<WireMessage>,
    pub provider_outbound: EventBus<Commit>,
    pub provider_inbound: EventBus<ProviderOutputEvent>,
    pub outbound: EventBus<WireMessage>,
    batcher: CommitBatcher,
    adapter: Arc<dyn ProviderAdapter>,
    barge_in: Arc<Mutex<BargeInState>>,
    barge_in_cooldown_ms: u64,
    tail_silence_ms: u64,
    format: AudioFormat,
    spawner: Arc<dyn TaskSpawner>,
}

impl SessionPipeline {
    /// Builds and starts a pipeline: connects the configured provider,
    /// performs its one-time handshake, and wires the batcher, adapter,
    /// and normalizer across the four buses. `outbound_router` is the
    /// call-level broadcast handler (§4.J); registering it here, rather
    /// than leaving it to the caller, keeps "a pipeline's outbound bus
    /// always has exactly one subscriber" an invariant of this
    /// constructor rather than a convention callers must remember.
    pub async fn start(
        call_code: String,
        participant_label: String,
        subscription_id: String,
        config: &GatewayConfig,
        outbound_router: Arc<dyn BusHandler<WireMessage>>,
    ) -> GatewayResult<Self> {
        let format = AudioFormat {
            sample_rate_hz: config.default_sample_rate_hz,
            channels: config.default_channels,
            sample_width_bytes: PCM_SAMPLE_WIDTH_BYTES,
        };

        let ingress: EventBus<WireMessage> = EventBus::new("ingress");
        let provider_outbound: EventBus<Commit> = EventBus::new("provider_outbound");
        let provider_inbound: EventBus<ProviderOutputEvent> = EventBus::new("provider_inbound");
        let outbound: EventBus<WireMessage> = EventBus::new("outbound");

        let batcher = CommitBatcher::new(
            BatcherConfig {
                max_batch_bytes: config.max_batch_bytes,
                max_batch_ms: config.max_batch_ms,
                idle_timeout_ms: config.idle_timeout_ms,
            },
            format,
            provider_outbound.clone(),
        );

        let adapter = AdapterFactory::create(
            &call_code,
            &participant_label,
            config,
            provider_outbound.clone(),
            provider_inbound.clone(),
        )?;
        adapter.start().await?;

        let settings = WireMessage::ControlTestSettings(ControlTestSettingsMessage::new(
            &config.provider,
            gate_mode_wire_value(config.outbound_gate_mode),
        ));
        let metadata = WireMessage::AudioMetadata(AudioMetadataMessage {
            kind: "AudioMetadata".to_string(),
            audio_metadata: AudioMetadataBody {
                subscription_id,
                encoding: "PCM16".to_string(),
                sample_rate: format.sample_rate_hz,
                channels: format.channels,
                length: None,
            },
        });
        adapter.send_handshake(settings, metadata).await?;

        let normalizer = Arc::new(OutputNormalizer::new(
            format,
            outbound.clone(),
            config.frame_duration_ms as u32,
        ));
        provider_inbound.register_handler(
            HandlerConfig {
                name: NORMALIZER_HANDLER_NAME.to_string(),
                queue_max: config.egress_queue_max,
                overflow_policy: config.overflow_policy,
                concurrency: 1,
            },
            Arc::new(NormalizerHandler { normalizer }),
        );

        let barge_in = Arc::new(Mutex::new(BargeInState::default()));
        provider_inbound.register_handler(
            HandlerConfig {
                name: BARGE_IN_TRACKER_HANDLER_NAME.to_string(),
                queue_max: config.egress_queue_max,
                overflow_policy: config.overflow_policy,
                concurrency: 1,
            },
            Arc::new(BargeInTracker { state: barge_in.clone() }),
        );

        ingress.register_handler(
            HandlerConfig {
                name: INGRESS_HANDLER_NAME.to_string(),
                queue_max: config.ingress_queue_max,
                overflow_policy: config.overflow_policy,
                concurrency: 1,
            },
            Arc::new(IngressDispatcher {
                call_code: call_code.clone(),
                batcher: batcher.clone(),
            }),
        );

        outbound.register_handler(crate::call::CallManager::broadcast_handler_config(config), outbound_router);

        Ok(Self {
            call_code,
            participant_label,
            ingress,
            provider_outbound,
            provider_inbound,
            outbound,
            batcher,
            adapter,
            barge_in,
            barge_in_cooldown_ms: config.barge_in_cooldown_ms,
            tail_silence_ms: config.tail_silence_ms,
            format,
            spawner: Arc::new(TokioSpawner::current()),
        })
    }

    /// Called when a participant's input voice state flips to `Speaking`.
    /// If translated audio is currently playing out and the cooldown
    /// window has elapsed, interrupts it: sends `control.cancel` upstream,
    /// clears the normalizer's buffered frames for this call, and
    /// discards the interrupting participant's own not-yet-sealed commit
    /// buffer so their barge-in speech starts a clean new commit.
    pub fn on_speaker_transitioned(&self, participant_id: &str, is_speaking: bool) {
        if !is_speaking {
            return;
        }

        let response_id = {
            let mut state = self.barge_in.lock();
            if !state.playback_active {
                return;
            }
            let now = crate::utils::now_millis();
            if let Some(last) = state.last_barge_in_ms {
                if now.saturating_sub(last) < self.barge_in_cooldown_ms {
                    return;
                }
            }
            state.last_barge_in_ms = Some(now);
            state.playback_active = false;
            state.current_response_id.take()
        };

        let adapter = self.adapter.clone();
        let batcher = self.batcher.clone();
        let call_code = self.call_code.clone();
        let participant_id = participant_id.to_string();
        let _handle = self.spawner.spawn(async move {
            if let Err(err) = adapter.cancel(response_id.as_deref()).await {
                warn!(call_code = %call_code, participant_id, error = %err, "failed to cancel upstream response on barge-in");
            }
            batcher.flush(Some(&participant_id));
        });
    }

    /// Liveness check delegated to the underlying provider adapter.
    pub async fn health(&self) -> bool {
        self.adapter.health().await
    }

    /// Tears the pipeline down: stops the batcher's idle timers, shuts
    /// every owned bus (aborting their worker tasks without draining),
    /// and closes the provider adapter. Order matters: the buses stop
    /// accepting new work before the adapter that feeds them is closed,
    /// so a closing adapter never publishes into a bus with no workers
    /// left to log the resulting overflow.
    pub async fn shutdown(&self) {
        self.batcher.shutdown();
        self.ingress.shutdown();
        self.provider_outbound.shutdown();
        self.provider_inbound.shutdown();
        self.publish_tail_silence().await;
        self.outbound.shutdown();
        if let Err(err) = self.adapter.close().await {
            warn!(call_code = %self.call_code, participant_label = %self.participant_label, error = %err, "error closing provider adapter during pipeline shutdown");
        }
    }

    /// Streams `tail_silence_ms` of silent PCM out before the outbound bus
    /// stops accepting work, and holds shutdown open for that long so a
    /// downstream client's playback doesn't cut off mid-word and any
    /// in-flight translation has a chance to arrive before teardown. No-op
    /// if `tail_silence_ms` is `0`.
    async fn publish_tail_silence(&self) {
        if self.tail_silence_ms == 0 {
            return;
        }
        let silence_bytes = self.format.frame_bytes(self.tail_silence_ms as u32);
        if silence_bytes > 0 {
            let silence = vec![0u8; silence_bytes];
            self.outbound.publish(WireMessage::AudioData(AudioDataMessage::new(None, &silence, 0)));
        }
        tokio::time::sleep(std::time::Duration::from_millis(self.tail_silence_ms)).await;
    }
}

fn gate_mode_wire_value(mode: crate::config::GateModeConfig) -> &'static str {
    use crate::config::GateModeConfig;
    match mode {
        GateModeConfig::PlayThrough => "play_through",
        GateModeConfig::PauseAndBuffer => "pause_and_buffer",
        GateModeConfig::PauseAndDrop => "pause_and_drop",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CollectingOutboundHandler {
        seen: Arc<StdMutex<Vec<WireMessage>>>,
    }

    #[async_trait]
    impl BusHandler<WireMessage> for CollectingOutboundHandler {
        async fn handle(&self, item: WireMessage) {
            self.seen.lock().unwrap().push(item);
        }
    }

    #[tokio::test]
    async fn starts_with_mock_provider_and_reports_healthy() {
        let config = GatewayConfig::default();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler: Arc<dyn BusHandler<WireMessage>> = Arc::new(CollectingOutboundHandler { seen });
        let pipeline = SessionPipeline::start(
            "CALL01".to_string(),
            "*shared*".to_string(),
            "1".to_string(),
            &config,
            handler,
        )
        .await
        .unwrap();
        assert!(pipeline.health().await);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn ingress_audio_flows_through_to_outbound() {
        let mut config = GatewayConfig::default();
        config.mock_provider_delay_ms = 2;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler: Arc<dyn BusHandler<WireMessage>> = Arc::new(CollectingOutboundHandler { seen: seen.clone() });
        let pipeline = SessionPipeline::start(
            "CALL01".to_string(),
            "*shared*".to_string(),
            "1".to_string(),
            &config,
            handler,
        )
        .await
        .unwrap();

        let audio = WireMessage::AudioData(crate::protocol::AudioDataMessage::new(
            Some("p1".to_string()),
            &vec![0u8; 4000],
            0,
        ));
        pipeline.ingress.publish(audio);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!seen.lock().unwrap().is_empty());
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_pads_outbound_with_tail_silence() {
        let mut config = GatewayConfig::default();
        config.tail_silence_ms = 40;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler: Arc<dyn BusHandler<WireMessage>> = Arc::new(CollectingOutboundHandler { seen: seen.clone() });
        let pipeline = SessionPipeline::start(
            "CALL01".to_string(),
            "*shared*".to_string(),
            "1".to_string(),
            &config,
            handler,
        )
        .await
        .unwrap();

        pipeline.shutdown().await;
        tokio::task::yield_now().await;

        let messages = seen.lock().unwrap();
        let expected_bytes = pipeline.format.frame_bytes(40);
        match messages.last() {
            Some(WireMessage::AudioData(m)) => assert_eq!(m.decode_pcm().unwrap().len(), expected_bytes),
            other => panic!("expected trailing silence frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_skips_padding_when_tail_silence_disabled() {
        let mut config = GatewayConfig::default();
        config.tail_silence_ms = 0;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let handler: Arc<dyn BusHandler<WireMessage>> = Arc::new(CollectingOutboundHandler { seen: seen.clone() });
        let pipeline = SessionPipeline::start(
            "CALL01".to_string(),
            "*shared*".to_string(),
            "1".to_string(),
            &config,
            handler,
        )
        .await
        .unwrap();

        pipeline.shutdown().await;
        tokio::task::yield_now().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn routing_strategy_defaults_to_shared() {
        assert_eq!(RoutingStrategy::from_value(None), RoutingStrategy::Shared);
        assert_eq!(RoutingStrategy::from_value(Some("bogus")), RoutingStrategy::Shared);
        assert_eq!(RoutingStrategy::from_value(Some("per_participant")), RoutingStrategy::PerParticipant);
    }
}
