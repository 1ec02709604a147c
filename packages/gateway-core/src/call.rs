//! Call Manager (§4.J): allocates call codes, tracks participants per call,
//! and fans out every pipeline's outbound traffic to the right sockets.
//! A `DashMap` keyed by call code, rather than a single
//! `Mutex<HashMap<_>>`, since lookups and per-call participant mutation are
//! independent across calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::audio::gate::OutboundAudioGate;
use crate::audio::voice_state::InputVoiceState;
use crate::bus::{BusHandler, HandlerConfig};
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::pipeline::{RoutingStrategy, SessionPipeline};
use crate::protocol::{ParticipantChangedMessage, ParticipantListMessage, WireMessage};
use crate::protocol_constants::{CALL_CODE_ALPHABET, CALL_CODE_LENGTH, MAX_RECENT_CALLS};

/// One connected participant's send-side handle: the channel a router's
/// send task reads from to forward frames to the actual downstream socket,
/// wrapped in the outbound gate and voice state that govern what reaches
/// it.
pub struct ParticipantHandle {
    pub gate: AsyncMutex<OutboundAudioGate>,
    pub voice_state: Mutex<InputVoiceState>,
    /// Whether this participant has sent a valid `AudioMetadata` frame yet.
    /// `AudioData` arriving before this is set is an invariant breach (§7).
    pub metadata_seen: std::sync::atomic::AtomicBool,
}

/// Registry entry for one call code (§3 Call).
pub struct Call {
    pub code: String,
    pub service_url: String,
    pub provider: String,
    pub barge_in_mode: String,
    pub created_at_ms: u64,
    pub participants: DashMap<String, Arc<ParticipantHandle>>,
    subscription_counter: AtomicU64,
    routing: Mutex<Option<RoutingStrategy>>,
    shared_pipeline: AsyncMutex<Option<Arc<SessionPipeline>>>,
    per_participant_pipelines: DashMap<String, Arc<SessionPipeline>>,
    upstream_init_lock: AsyncMutex<()>,
}

impl Call {
    fn new(code: String, service_url: String, provider: String, barge_in_mode: String, created_at_ms: u64) -> Self {
        Self {
            code,
            service_url,
            provider,
            barge_in_mode,
            created_at_ms,
            participants: DashMap::new(),
            subscription_counter: AtomicU64::new(0),
            routing: Mutex::new(None),
            shared_pipeline: AsyncMutex::new(None),
            per_participant_pipelines: DashMap::new(),
            upstream_init_lock: AsyncMutex::new(()),
        }
    }

    /// Next monotonic subscription identifier for this call's upstream
    /// negotiation, carried on `AudioMetadata`.
    pub fn next_subscription_id(&self) -> u64 {
        self.subscription_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of currently connected participants.
    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.participant_count() > 0
    }

    /// Chooses the routing strategy from the first participant to set one;
    /// later joiners' preference is accepted only if none has been chosen
    /// yet. A call's routing strategy does not change after the first
    /// participant joins, since switching topology mid-call would require
    /// tearing down and re-creating any already-running pipeline.
    fn routing_strategy(&self, requested: RoutingStrategy) -> RoutingStrategy {
        let mut routing = self.routing.lock();
        *routing.get_or_insert(requested)
    }

    /// Returns the call's shared pipeline, creating it on first use.
    /// Double-checked under `upstream_init_lock` so concurrent joiners
    /// never race to connect two upstreams for the same call.
    pub async fn shared_pipeline(
        &self,
        config: &GatewayConfig,
        outbound_router: Arc<dyn BusHandler<WireMessage>>,
    ) -> GatewayResult<Arc<SessionPipeline>> {
        if let Some(pipeline) = self.shared_pipeline.lock().await.as_ref() {
            return Ok(pipeline.clone());
        }
        let _guard = self.upstream_init_lock.lock().await;
        if let Some(pipeline) = self.shared_pipeline.lock().await.as_ref() {
            return Ok(pipeline.clone());
        }
        let subscription_id = self.next_subscription_id().to_string();
        let pipeline = Arc::new(
            SessionPipeline::start(self.code.clone(), "*shared*".to_string(), subscription_id, config, outbound_router)
                .await?,
        );
        *self.shared_pipeline.lock().await = Some(pipeline.clone());
        Ok(pipeline)
    }

    /// Returns `participant_id`'s own pipeline in `per_participant` mode,
    /// creating it on demand the first time that participant sends audio.
    pub async fn participant_pipeline(
        &self,
        participant_id: &str,
        config: &GatewayConfig,
        outbound_router: Arc<dyn BusHandler<WireMessage>>,
    ) -> GatewayResult<Arc<SessionPipeline>> {
        if let Some(pipeline) = self.per_participant_pipelines.get(participant_id) {
            return Ok(pipeline.clone());
        }
        let _guard = self.upstream_init_lock.lock().await;
        if let Some(pipeline) = self.per_participant_pipelines.get(participant_id) {
            return Ok(pipeline.clone());
        }
        let subscription_id = self.next_subscription_id().to_string();
        let pipeline = Arc::new(
            SessionPipeline::start(
                self.code.clone(),
                participant_id.to_string(),
                subscription_id,
                config,
                outbound_router,
            )
            .await?,
        );
        self.per_participant_pipelines.insert(participant_id.to_string(), pipeline.clone());
        Ok(pipeline)
    }

    async fn shutdown_pipelines(&self) {
        if let Some(pipeline) = self.shared_pipeline.lock().await.take() {
            pipeline.shutdown().await;
        }
        for entry in self.per_participant_pipelines.iter() {
            entry.value().shutdown().await;
        }
        self.per_participant_pipelines.clear();
    }
}

/// Diagnostic snapshot of one call for the "recent calls" view (§6 HTTP
/// boundary `listRecentCalls`).
#[derive(Debug, Clone)]
pub struct RecentCallSummary {
    pub call_code: String,
    pub service: String,
    pub provider: String,
    pub barge_in_mode: String,
    pub created_at_ms: u64,
    pub participant_count: usize,
    pub is_active: bool,
}

/// Fans out one pipeline's outbound traffic to every participant of a call,
/// excluding the originating speaker from audio frames (§3 invariant: no
/// self-echo) and tolerating a dead participant socket by dropping it from
/// the call's participant set.
pub struct CallBroadcastHandler {
    call: Arc<Call>,
}

impl CallBroadcastHandler {
    #[must_use]
    pub fn new(call: Arc<Call>) -> Self {
        Self { call }
    }

    /// The participant id a message is attributed to, when the wire shape
    /// carries one — used only to exclude the speaker from hearing their
    /// own audio echoed back.
    fn origin_participant_id(message: &WireMessage) -> Option<&str> {
        match message {
            WireMessage::AudioData(m) => m.audio_data.participant_raw_id.as_deref(),
            _ => None,
        }
    }
}

#[async_trait]
impl BusHandler<WireMessage> for CallBroadcastHandler {
    async fn handle(&self, message: WireMessage) {
        let exclude = if message.is_audio_payload() {
            Self::origin_participant_id(&message)
        } else {
            None
        };

        let mut dead = Vec::new();
        for entry in self.call.participants.iter() {
            let participant_id = entry.key();
            if Some(participant_id.as_str()) == exclude {
                continue;
            }
            let handle = entry.value();
            let is_speaking = handle.voice_state.lock().is_speaking();
            let mut gate = handle.gate.lock().await;
            if gate.handle(message.clone(), is_speaking).is_err() {
                dead.push(participant_id.clone());
            }
        }

        for participant_id in dead {
            warn!(call_code = %self.call.code, participant_id, "dropping unreachable participant after broadcast failure");
            self.call.participants.remove(&participant_id);
        }
    }
}

fn generate_call_code() -> String {
    let mut rng = thread_rng();
    (0..CALL_CODE_LENGTH)
        .map(|_| *CALL_CODE_ALPHABET.choose(&mut rng).expect("alphabet is non-empty") as char)
        .collect()
}

/// Thread-safe call registry keyed by call code (§4.J).
pub struct CallManager {
    calls: DashMap<String, Arc<Call>>,
    recent: Mutex<VecDeque<String>>,
}

impl Default for CallManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CallManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            recent: Mutex::new(VecDeque::with_capacity(MAX_RECENT_CALLS)),
        }
    }

    /// `createCall` (§6 HTTP boundary). Allocates a fresh, collision-free
    /// call code and registers the call.
    pub fn create_call(&self, service_url: impl Into<String>, provider: impl Into<String>, barge_in_mode: impl Into<String>) -> String {
        let service_url = service_url.into();
        let provider = provider.into();
        let barge_in_mode = barge_in_mode.into();

        let code = loop {
            let candidate = generate_call_code();
            if !self.calls.contains_key(&candidate) {
                break candidate;
            }
        };

        let call = Arc::new(Call::new(
            code.clone(),
            service_url,
            provider,
            barge_in_mode,
            crate::utils::now_millis(),
        ));
        self.calls.insert(code.clone(), call);

        let mut recent = self.recent.lock();
        recent.push_front(code.clone());
        recent.truncate(MAX_RECENT_CALLS);

        info!(call_code = %code, "call created");
        code
    }

    /// `getCall` (§6 HTTP boundary).
    #[must_use]
    pub fn get_call(&self, code: &str) -> Option<Arc<Call>> {
        self.calls.get(code).map(|entry| entry.value().clone())
    }

    /// `listRecentCalls` (§6 HTTP boundary).
    #[must_use]
    pub fn list_recent_calls(&self) -> Vec<RecentCallSummary> {
        self.recent
            .lock()
            .iter()
            .filter_map(|code| self.get_call(code))
            .map(|call| RecentCallSummary {
                call_code: call.code.clone(),
                service: call.service_url.clone(),
                provider: call.provider.clone(),
                barge_in_mode: call.barge_in_mode.clone(),
                created_at_ms: call.created_at_ms,
                participant_count: call.participant_count(),
                is_active: call.is_active(),
            })
            .collect()
    }

    /// Adds `participant_id` to `call`, lazily creating its pipeline(s) and
    /// negotiating the upstream on first join, then broadcasts the current
    /// roster to the newcomer and a `participant.joined` event to everyone.
    pub async fn add_participant(
        &self,
        call: &Arc<Call>,
        participant_id: &str,
        routing: RoutingStrategy,
        config: &GatewayConfig,
        gate: OutboundAudioGate,
    ) -> GatewayResult<Arc<SessionPipeline>> {
        let routing = call.routing_strategy(routing);
        let broadcaster: Arc<dyn BusHandler<WireMessage>> = Arc::new(CallBroadcastHandler::new(call.clone()));

        let pipeline = match routing {
            RoutingStrategy::Shared => call.shared_pipeline(config, broadcaster).await?,
            RoutingStrategy::PerParticipant => {
                call.participant_pipeline(participant_id, config, broadcaster).await?
            }
        };

        let handle = Arc::new(ParticipantHandle {
            gate: AsyncMutex::new(gate),
            voice_state: Mutex::new(InputVoiceState::new()),
            metadata_seen: std::sync::atomic::AtomicBool::new(false),
        });
        call.participants.insert(participant_id.to_string(), handle);

        let participants: Vec<String> = call.participants.iter().map(|e| e.key().clone()).collect();
        pipeline
            .outbound
            .publish(WireMessage::ParticipantList(ParticipantListMessage {
                message_type: "participant.list".to_string(),
                participants: participants.clone(),
            }));
        pipeline
            .outbound
            .publish(WireMessage::ParticipantChanged(ParticipantChangedMessage {
                message_type: "participant.joined".to_string(),
                participant_id: participant_id.to_string(),
                participants,
            }));

        Ok(pipeline)
    }

    /// Removes `participant_id` from `call`, broadcasts `participant.left`
    /// if anyone remains, and tears the call's pipeline(s) down once the
    /// last participant leaves.
    pub async fn remove_participant(&self, call: &Arc<Call>, participant_id: &str) {
        call.participants.remove(participant_id);

        if call.participants.is_empty() {
            call.shutdown_pipelines().await;
            return;
        }

        if let Some(pipeline) = call.shared_pipeline.lock().await.as_ref() {
            let participants: Vec<String> = call.participants.iter().map(|e| e.key().clone()).collect();
            pipeline
                .outbound
                .publish(WireMessage::ParticipantChanged(ParticipantChangedMessage {
                    message_type: "participant.left".to_string(),
                    participant_id: participant_id.to_string(),
                    participants,
                }));
        }
    }

    /// Sweeps calls idle beyond `ttl_minutes` with no connected
    /// participants (the Call Reaper, §2.1 O).
    pub async fn reap_idle_calls(&self, ttl_minutes: u64) {
        let cutoff = crate::utils::now_millis().saturating_sub(ttl_minutes * 60_000);
        let mut expired = Vec::new();
        for entry in self.calls.iter() {
            let call = entry.value();
            if call.participants.is_empty() && call.created_at_ms < cutoff {
                expired.push(entry.key().clone());
            }
        }
        for code in expired {
            if let Some((_, call)) = self.calls.remove(&code) {
                call.shutdown_pipelines().await;
                info!(call_code = %code, "reaped idle call");
            }
        }
    }

    /// Queue handler config shared by every call-level bus registration,
    /// exposed so the router can register the broadcast handler with the
    /// configured backpressure policy rather than a hardcoded one.
    #[must_use]
    pub fn broadcast_handler_config(config: &GatewayConfig) -> HandlerConfig {
        HandlerConfig {
            name: "call_broadcast".to_string(),
            queue_max: config.egress_queue_max,
            overflow_policy: config.overflow_policy,
            concurrency: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_call_returns_unique_codes() {
        let manager = CallManager::new();
        let mut codes = std::collections::HashSet::new();
        for _ in 0..1000 {
            let code = manager.create_call("wss://svc", "mock", "pause_and_buffer");
            assert_eq!(code.len(), CALL_CODE_LENGTH);
            assert!(code.chars().all(|c| CALL_CODE_ALPHABET.contains(&(c as u8))));
            assert!(codes.insert(code));
        }
    }

    #[test]
    fn get_call_round_trips() {
        let manager = CallManager::new();
        let code = manager.create_call("wss://svc", "mock", "play_through");
        assert!(manager.get_call(&code).is_some());
        assert!(manager.get_call("NOPE01").is_none());
    }

    #[test]
    fn recent_calls_caps_at_max_and_orders_newest_first() {
        let manager = CallManager::new();
        let mut last = String::new();
        for _ in 0..(MAX_RECENT_CALLS + 5) {
            last = manager.create_call("wss://svc", "mock", "play_through");
        }
        let recent = manager.list_recent_calls();
        assert_eq!(recent.len(), MAX_RECENT_CALLS);
        assert_eq!(recent[0].call_code, last);
    }
}
