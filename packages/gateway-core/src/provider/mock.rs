//! Synthetic provider adapter (§14): echoes committed audio back as
//! translated audio and emits placeholder transcript text, after a
//! configurable simulated processing delay split across a partial and a
//! final half.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::{BusHandler, EventBus, HandlerConfig};
use crate::error::GatewayResult;
use crate::model::{Commit, DoneReason, ProviderOutputEvent};
use crate::provider::adapter::ProviderAdapter;
use crate::queue::OverflowPolicy;

const EGRESS_HANDLER_NAME: &str = "mock_egress";

/// Translation adapter that performs no network I/O: useful for local
/// development and for exercising the rest of the pipeline in tests.
#[derive(Clone)]
pub struct MockAdapter {
    provider_outbound: EventBus<Commit>,
    provider_inbound: EventBus<ProviderOutputEvent>,
    delay_ms: u64,
    closed: Arc<AtomicBool>,
}

impl MockAdapter {
    #[must_use]
    pub fn new(provider_outbound: EventBus<Commit>, provider_inbound: EventBus<ProviderOutputEvent>, delay_ms: u64) -> Self {
        Self {
            provider_outbound,
            provider_inbound,
            delay_ms,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BusHandler<Commit> for MockAdapter {
    async fn handle(&self, commit: Commit) {
        let stream_id = commit.commit_id.to_string();
        let half = Duration::from_millis(self.delay_ms / 2);

        tokio::time::sleep(half).await;
        self.provider_inbound.publish(ProviderOutputEvent::TranscriptDelta {
            session_id: commit.session_id.clone(),
            participant_id: commit.participant_id.clone(),
            source_language: "auto".to_string(),
            target_language: "auto".to_string(),
            delta: format!("[mock partial] processing commit {}...", &stream_id[..8.min(stream_id.len())]),
        });
        self.provider_inbound.publish(ProviderOutputEvent::AudioDelta {
            commit_id: commit.commit_id,
            session_id: commit.session_id.clone(),
            participant_id: commit.participant_id.clone(),
            provider: "mock".to_string(),
            stream_id: stream_id.clone(),
            response_id: None,
            item_id: None,
            pcm: commit.pcm.clone(),
        });

        tokio::time::sleep(half).await;
        self.provider_inbound.publish(ProviderOutputEvent::TranscriptDone {
            session_id: commit.session_id.clone(),
            participant_id: commit.participant_id.clone(),
            source_language: "auto".to_string(),
            target_language: "auto".to_string(),
            text: format!("[mock final] translated audio for commit {}", &stream_id[..8.min(stream_id.len())]),
        });
        self.provider_inbound.publish(ProviderOutputEvent::AudioDone {
            commit_id: commit.commit_id,
            session_id: commit.session_id,
            participant_id: commit.participant_id,
            stream_id,
            reason: DoneReason::Completed,
            error: None,
        });
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn start(&self) -> GatewayResult<()> {
        self.provider_outbound.register_handler(
            HandlerConfig {
                name: EGRESS_HANDLER_NAME.to_string(),
                queue_max: 1000,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(self.clone()),
        );
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        self.closed.store(true, Ordering::Release);
        self.provider_outbound.pause(EGRESS_HANDLER_NAME);
        Ok(())
    }

    async fn health(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusHandler as _;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    struct CollectingHandler {
        seen: Arc<StdMutex<Vec<ProviderOutputEvent>>>,
    }

    #[async_trait]
    impl BusHandler<ProviderOutputEvent> for CollectingHandler {
        async fn handle(&self, item: ProviderOutputEvent) {
            self.seen.lock().unwrap().push(item);
        }
    }

    #[tokio::test]
    async fn emits_transcript_and_audio_then_done() {
        let provider_outbound: EventBus<Commit> = EventBus::new("provider_outbound");
        let provider_inbound: EventBus<ProviderOutputEvent> = EventBus::new("provider_inbound");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        provider_inbound.register_handler(
            HandlerConfig {
                name: "collector".into(),
                queue_max: 32,
                overflow_policy: OverflowPolicy::DropOldest,
                concurrency: 1,
            },
            Arc::new(CollectingHandler { seen: seen.clone() }),
        );

        let adapter = MockAdapter::new(provider_outbound, provider_inbound, 2);
        let commit = Commit {
            commit_id: Uuid::new_v4(),
            session_id: "s1".into(),
            participant_id: "p1".into(),
            created_at_ms: 0,
            pcm: vec![1, 2, 3, 4],
            rms: 100.0,
            is_silence: false,
        };
        adapter.handle(commit).await;

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ProviderOutputEvent::TranscriptDelta { .. }));
        assert!(matches!(events[1], ProviderOutputEvent::AudioDelta { .. }));
        assert!(matches!(events[2], ProviderOutputEvent::TranscriptDone { .. }));
        assert!(matches!(events[3], ProviderOutputEvent::AudioDone { .. }));
    }

    #[tokio::test]
    async fn health_reflects_close() {
        let adapter = MockAdapter::new(EventBus::new("a"), EventBus::new("b"), 1);
        assert!(adapter.health().await);
        adapter.close().await.unwrap();
        assert!(!adapter.health().await);
    }
}
