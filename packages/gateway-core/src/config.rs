//! Runtime configuration surface (§6, §12).
//!
//! `GatewayConfig` is a plain, serde-friendly value type: every field has a
//! sensible default and the whole struct round-trips through YAML. Layering
//! defaults with a config file, environment variables, and CLI overrides is
//! the binary crate's job (`GatewayConfig` itself never touches the
//! filesystem or environment); this module only owns the shape and the
//! validation rules.

use serde::{Deserialize, Serialize};

use crate::protocol_constants::{
    DEFAULT_CHANNELS, DEFAULT_FRAME_DURATION_MS, DEFAULT_SAMPLE_RATE_HZ,
};
use crate::queue::OverflowPolicy;

/// Which outbound-gate mode a call uses while the provider is speaking
/// (§4.G). Mirrors [`crate::audio::OutboundGateMode`] but as a
/// config-file-friendly string enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateModeConfig {
    PlayThrough,
    PauseAndBuffer,
    PauseAndDrop,
}

impl Default for GateModeConfig {
    fn default() -> Self {
        Self::PauseAndBuffer
    }
}

/// Full runtime configuration (§6 Configuration table plus the provider
/// endpoint/frame parameters the table references but does not enumerate
/// row-by-row).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bound on ingress-bus handler queues.
    pub ingress_queue_max: usize,
    /// Bound on outbound-bus handler queues.
    pub egress_queue_max: usize,
    /// Overflow policy applied to every bus handler queue.
    pub overflow_policy: OverflowPolicy,

    /// Commit threshold: duration, in milliseconds.
    pub max_batch_ms: u64,
    /// Commit threshold: size, in bytes.
    pub max_batch_bytes: usize,
    /// Commit threshold: idle timer, in milliseconds.
    pub idle_timeout_ms: u64,

    /// Upstream connect deadline, in seconds.
    pub connect_timeout_secs: u64,
    /// Idle-call reaping window, in minutes.
    pub call_ttl_minutes: u64,
    /// Call reaper tick interval, in seconds.
    pub cleanup_interval_seconds: u64,
    /// Post-stream silence padding applied at shutdown, in milliseconds.
    pub tail_silence_ms: u64,

    /// Outbound gate behavior while the provider is speaking.
    pub outbound_gate_mode: GateModeConfig,

    /// Identifier routed to the adapter factory (`mock` or `generic_ws`).
    pub provider: String,
    /// WebSocket endpoint the `generic_ws` adapter connects to. Ignored by
    /// `mock`.
    pub provider_url: String,
    /// Bearer token sent on the `generic_ws` adapter's connect request, if
    /// any. No vendor-specific request signing is supported.
    pub provider_bearer_token: Option<String>,
    /// Synthetic processing delay used by the `mock` adapter, in
    /// milliseconds.
    pub mock_provider_delay_ms: u64,

    /// Negotiated sample rate, in Hz, used when a call never sends an
    /// `AudioMetadata` frame.
    pub default_sample_rate_hz: u32,
    /// Negotiated channel count used when a call never sends an
    /// `AudioMetadata` frame.
    pub default_channels: u16,
    /// Outbound frame duration target used by the Provider Output
    /// Normalizer, in milliseconds.
    pub frame_duration_ms: u64,

    /// Barge-in debounce window: once a barge-in fires, further candidates
    /// are suppressed until this many milliseconds have elapsed.
    pub barge_in_cooldown_ms: u64,

    /// Voice-activity hysteresis window: sustained signal above the
    /// silence threshold for this long is required before a participant's
    /// input state flips to speaking.
    pub voice_hysteresis_ms: u64,
    /// Voice-activity hysteresis window: sustained silence for this long is
    /// required before a participant's input state flips back.
    pub voice_silence_threshold_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ingress_queue_max: 256,
            egress_queue_max: 256,
            overflow_policy: OverflowPolicy::DropOldest,

            max_batch_ms: 2_000,
            max_batch_bytes: 64 * 1024,
            idle_timeout_ms: 500,

            connect_timeout_secs: 10,
            call_ttl_minutes: 30,
            cleanup_interval_seconds: 60,
            tail_silence_ms: 300,

            outbound_gate_mode: GateModeConfig::default(),

            provider: "mock".to_string(),
            provider_url: String::new(),
            provider_bearer_token: None,
            mock_provider_delay_ms: 300,

            default_sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            default_channels: DEFAULT_CHANNELS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS as u64,

            barge_in_cooldown_ms: 250,

            voice_hysteresis_ms: 120,
            voice_silence_threshold_ms: 400,
        }
    }
}

impl GatewayConfig {
    /// Validates cross-field and range invariants that `serde` alone cannot
    /// express. Called once after layering is complete, before any
    /// component is constructed from the config.
    pub fn validate(&self) -> Result<(), String> {
        if self.ingress_queue_max == 0 {
            return Err("ingress_queue_max must be >= 1".to_string());
        }
        if self.egress_queue_max == 0 {
            return Err("egress_queue_max must be >= 1".to_string());
        }
        if self.max_batch_bytes == 0 {
            return Err("max_batch_bytes must be >= 1".to_string());
        }
        if self.max_batch_ms == 0 {
            return Err("max_batch_ms must be >= 1".to_string());
        }
        if self.connect_timeout_secs == 0 {
            return Err("connect_timeout_secs must be >= 1".to_string());
        }
        if self.call_ttl_minutes == 0 {
            return Err("call_ttl_minutes must be >= 1".to_string());
        }
        if self.cleanup_interval_seconds == 0 {
            return Err("cleanup_interval_seconds must be >= 1".to_string());
        }
        if self.default_channels == 0 {
            return Err("default_channels must be >= 1".to_string());
        }
        if self.default_sample_rate_hz == 0 {
            return Err("default_sample_rate_hz must be >= 1".to_string());
        }
        if self.frame_duration_ms == 0 {
            return Err("frame_duration_ms must be >= 1".to_string());
        }
        if self.provider.trim().is_empty() {
            return Err("provider must not be empty".to_string());
        }
        if self.provider == "generic_ws" && self.provider_url.trim().is_empty() {
            return Err("provider_url is required when provider = \"generic_ws\"".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_queue_bound_is_rejected() {
        let mut config = GatewayConfig::default();
        config.ingress_queue_max = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn generic_ws_without_url_is_rejected() {
        let mut config = GatewayConfig::default();
        config.provider = "generic_ws".to_string();
        assert!(config.validate().is_err());
        config.provider_url = "wss://example.invalid/translate".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = GatewayConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: GatewayConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.provider, config.provider);
        assert_eq!(back.max_batch_bytes, config.max_batch_bytes);
    }
}
