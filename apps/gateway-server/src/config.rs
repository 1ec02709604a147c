//! Configuration layering for the standalone gateway server binary (§12).
//!
//! `gateway_core::GatewayConfig` only owns the shape and validation rules;
//! loading it from a YAML file and applying environment overrides is this
//! binary's job. CLI overrides are layered on top, last, by `main.rs`.

use std::path::Path;

use anyhow::{Context, Result};
use gateway_core::GatewayConfig;

/// Loads a [`GatewayConfig`] from an optional YAML file, then applies
/// `GATEWAY_`-prefixed environment variable overrides. Defaults are used
/// for any field neither the file nor the environment sets.
pub fn load_yaml(path: Option<&Path>) -> Result<GatewayConfig> {
    let mut config = if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        GatewayConfig::default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Applies `GATEWAY_*` environment variable overrides on top of whatever
/// the YAML file (or defaults) produced. Malformed values are ignored
/// rather than rejected outright — a bad override falls back to the
/// existing value instead of aborting startup.
fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(val) = std::env::var("GATEWAY_PROVIDER") {
        config.provider = val;
    }
    if let Ok(val) = std::env::var("GATEWAY_PROVIDER_URL") {
        config.provider_url = val;
    }
    if let Ok(val) = std::env::var("GATEWAY_PROVIDER_BEARER_TOKEN") {
        config.provider_bearer_token = Some(val);
    }
    if let Ok(val) = std::env::var("GATEWAY_INGRESS_QUEUE_MAX") {
        if let Ok(parsed) = val.parse() {
            config.ingress_queue_max = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_EGRESS_QUEUE_MAX") {
        if let Ok(parsed) = val.parse() {
            config.egress_queue_max = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_MAX_BATCH_MS") {
        if let Ok(parsed) = val.parse() {
            config.max_batch_ms = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_MAX_BATCH_BYTES") {
        if let Ok(parsed) = val.parse() {
            config.max_batch_bytes = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_IDLE_TIMEOUT_MS") {
        if let Ok(parsed) = val.parse() {
            config.idle_timeout_ms = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_CONNECT_TIMEOUT_SECS") {
        if let Ok(parsed) = val.parse() {
            config.connect_timeout_secs = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_CALL_TTL_MINUTES") {
        if let Ok(parsed) = val.parse() {
            config.call_ttl_minutes = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_CLEANUP_INTERVAL_SECONDS") {
        if let Ok(parsed) = val.parse() {
            config.cleanup_interval_seconds = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_BARGE_IN_COOLDOWN_MS") {
        if let Ok(parsed) = val.parse() {
            config.barge_in_cooldown_ms = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_VOICE_HYSTERESIS_MS") {
        if let Ok(parsed) = val.parse() {
            config.voice_hysteresis_ms = parsed;
        }
    }
    if let Ok(val) = std::env::var("GATEWAY_VOICE_SILENCE_THRESHOLD_MS") {
        if let Ok(parsed) = val.parse() {
            config.voice_silence_threshold_ms = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_defaults_when_no_file_given() {
        let config = load_yaml(None).unwrap();
        assert_eq!(config.provider, "mock");
    }

    #[test]
    fn loads_and_parses_a_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider: generic_ws\nprovider_url: wss://example.invalid/translate").unwrap();
        let config = load_yaml(Some(file.path())).unwrap();
        assert_eq!(config.provider, "generic_ws");
        assert_eq!(config.provider_url, "wss://example.invalid/translate");
    }

    #[test]
    fn missing_file_surfaces_a_context_error() {
        let result = load_yaml(Some(Path::new("/nonexistent/gateway.yaml")));
        assert!(result.is_err());
    }
}
