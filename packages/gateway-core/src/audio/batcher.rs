//! Per-participant audio commit batcher (§4.E): a commit seals on byte
//! count, duration, or idle timeout, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::model::{AudioFormat, Commit};
use crate::protocol_constants::SILENCE_RMS_THRESHOLD;
use crate::runtime::{TaskSpawner, TokioSpawner};

/// Thresholds governing when a commit is sealed.
#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub max_batch_bytes: usize,
    pub max_batch_ms: u64,
    pub idle_timeout_ms: u64,
}

struct ParticipantBuffer {
    session_id: String,
    pcm: Vec<u8>,
    idle_timer: Option<JoinHandle<()>>,
}

impl ParticipantBuffer {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            pcm: Vec::new(),
            idle_timer: None,
        }
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(handle) = self.idle_timer.take() {
            handle.abort();
        }
    }
}

/// Computes RMS energy over a little-endian PCM16 buffer, across however
/// many interleaved channels. Returns `0.0` for an empty or odd-length
/// buffer (a malformed sample pair is simply not counted).
#[must_use]
pub fn rms_pcm16(pcm: &[u8]) -> f64 {
    let sample_count = pcm.len() / 2;
    if sample_count == 0 {
        return 0.0;
    }
    let mut sum_sq: f64 = 0.0;
    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        sum_sq += sample * sample;
    }
    (sum_sq / sample_count as f64).sqrt()
}

/// Buffers per-participant PCM and publishes sealed [`Commit`]s onto the
/// provider-outbound bus.
///
/// Cloning shares the same participant-buffer map and downstream bus, so a
/// clone can be handed to a spawned idle-timer task.
#[derive(Clone)]
pub struct CommitBatcher {
    config: BatcherConfig,
    format: AudioFormat,
    buffers: Arc<DashMap<String, ParticipantBuffer>>,
    provider_outbound: EventBus<Commit>,
    spawner: Arc<dyn TaskSpawner>,
}

impl CommitBatcher {
    /// # Panics
    /// Panics if called outside of a Tokio runtime context (the idle timer
    /// is spawned through a [`TokioSpawner`] captured at construction).
    #[must_use]
    pub fn new(config: BatcherConfig, format: AudioFormat, provider_outbound: EventBus<Commit>) -> Self {
        Self {
            config,
            format,
            buffers: Arc::new(DashMap::new()),
            provider_outbound,
            spawner: Arc::new(TokioSpawner::current()),
        }
    }

    /// Appends one arriving audio chunk, updates the idle timer, and seals
    /// a commit immediately if a threshold is already met.
    pub fn on_chunk(&self, session_id: &str, participant_id: &str, pcm: &[u8]) {
        let should_seal = {
            let mut entry = self
                .buffers
                .entry(participant_id.to_string())
                .or_insert_with(|| ParticipantBuffer::new(session_id.to_string()));
            entry.cancel_idle_timer();
            entry.pcm.extend_from_slice(pcm);

            let accumulated_bytes = entry.pcm.len();
            let accumulated_ms = self.format.duration_ms(accumulated_bytes);
            accumulated_bytes >= self.config.max_batch_bytes
                || accumulated_ms >= self.config.max_batch_ms
        };

        if should_seal {
            self.seal(participant_id);
        } else {
            self.arm_idle_timer(participant_id);
        }
    }

    fn arm_idle_timer(&self, participant_id: &str) {
        let this = self.clone();
        let participant_id = participant_id.to_string();
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let handle = self.spawner.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            this.seal(&participant_id);
        });
        if let Some(mut entry) = self.buffers.get_mut(participant_id.as_str()) {
            entry.idle_timer = Some(handle);
        }
    }

    /// Seals and publishes a commit for `participant_id`, if any bytes are
    /// buffered. No-op if the buffer is already empty (e.g. the idle timer
    /// fired after a threshold-triggered seal already drained it).
    fn seal(&self, participant_id: &str) {
        let Some((session_id, pcm)) = self.buffers.get_mut(participant_id).and_then(|mut entry| {
            entry.cancel_idle_timer();
            if entry.pcm.is_empty() {
                None
            } else {
                Some((entry.session_id.clone(), std::mem::take(&mut entry.pcm)))
            }
        }) else {
            return;
        };

        let rms = rms_pcm16(&pcm);
        let commit = Commit {
            commit_id: Uuid::new_v4(),
            session_id,
            participant_id: participant_id.to_string(),
            created_at_ms: crate::utils::now_millis(),
            is_silence: rms < SILENCE_RMS_THRESHOLD,
            pcm,
            rms,
        };
        debug!(participant_id, commit_id = %commit.commit_id, is_silence = commit.is_silence, "commit sealed");
        self.provider_outbound.publish(commit);
    }

    /// External hook: discards buffered audio and cancels the idle timer
    /// for `participant_id` (or every participant, if `None`) without
    /// publishing a commit. Used by the barge-in control plane.
    pub fn flush(&self, participant_id: Option<&str>) {
        match participant_id {
            Some(pid) => {
                if let Some(mut entry) = self.buffers.get_mut(pid) {
                    entry.cancel_idle_timer();
                    entry.pcm.clear();
                }
            }
            None => {
                for mut entry in self.buffers.iter_mut() {
                    entry.cancel_idle_timer();
                    entry.pcm.clear();
                }
            }
        }
    }

    /// Cancels every idle timer. Called on session/pipeline shutdown.
    pub fn shutdown(&self) {
        for mut entry in self.buffers.iter_mut() {
            entry.cancel_idle_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HandlerConfig;
    use crate::queue::OverflowPolicy;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct CollectingHandler {
        seen: Arc<StdMutex<Vec<Commit>>>,
    }

    #[async_trait]
    impl crate::bus::BusHandler<Commit> for CollectingHandler {
        async fn handle(&self, item: Commit) {
            self.seen.lock().unwrap().push(item);
        }
    }

    fn batcher_with_collector(config: BatcherConfig) -> (CommitBatcher, Arc<StdMutex<Vec<Commit>>>) {
        let bus: EventBus<Commit> = EventBus::new("provider_outbound");
        let seen = Arc::new(StdMutex::new(Vec::new()));
        bus.register_handler(
            HandlerConfig {
                name: "collector".into(),
                queue_max: 32,
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
        (CommitBatcher::new(config, format, bus), seen)
    }

    #[test]
    fn rms_of_silence_is_zero() {
        let pcm = vec![0u8; 640];
        assert_eq!(rms_pcm16(&pcm), 0.0);
    }

    #[test]
    fn rms_of_loud_signal_exceeds_threshold() {
        let mut pcm = Vec::new();
        for _ in 0..160 {
            pcm.extend_from_slice(&10_000i16.to_le_bytes());
        }
        assert!(rms_pcm16(&pcm) > SILENCE_RMS_THRESHOLD);
    }

    // S1: Commit-by-bytes.
    #[tokio::test(start_paused = true)]
    async fn s1_commit_by_bytes() {
        let (batcher, seen) = batcher_with_collector(BatcherConfig {
            max_batch_bytes: 3200,
            max_batch_ms: 10_000,
            idle_timeout_ms: 10_000,
        });

        let chunk = vec![0u8; 1000];
        for _ in 0..4 {
            batcher.on_chunk("sess-1", "p1", &chunk);
        }
        tokio::task::yield_now().await;
        {
            let commits = seen.lock().unwrap();
            assert_eq!(commits.len(), 1);
            assert_eq!(commits[0].pcm.len(), 3200);
        }

        tokio::time::advance(Duration::from_millis(10_000)).await;
        tokio::task::yield_now().await;
        let commits = seen.lock().unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[1].pcm.len(), 800);
    }

    // S2: Commit-by-idle.
    #[tokio::test(start_paused = true)]
    async fn s2_commit_by_idle() {
        let (batcher, seen) = batcher_with_collector(BatcherConfig {
            max_batch_bytes: 1_000_000,
            max_batch_ms: 1_000_000,
            idle_timeout_ms: 100,
        });

        batcher.on_chunk("sess-1", "p1", &vec![0u8; 500]);
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        let commits = seen.lock().unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].pcm.len(), 500);
    }

    #[tokio::test]
    async fn flush_discards_without_publishing() {
        let (batcher, seen) = batcher_with_collector(BatcherConfig {
            max_batch_bytes: 1_000_000,
            max_batch_ms: 1_000_000,
            idle_timeout_ms: 1_000_000,
        });
        batcher.on_chunk("sess-1", "p1", &vec![1u8; 100]);
        batcher.flush(Some("p1"));
        tokio::task::yield_now().await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
