//! Provider adapter factory (§14): resolves the configured `provider`
//! identifier to a concrete adapter. An unrecognized identifier is caught
//! at config-validation time wherever possible; this factory still
//! returns a structured error rather than panicking.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::model::{Commit, ProviderOutputEvent};
use crate::provider::adapter::ProviderAdapter;
use crate::provider::generic_ws::GenericWsAdapter;
use crate::provider::mock::MockAdapter;
use crate::upstream::UpstreamConfig;

/// Resolves a session's configured provider to a concrete adapter.
pub struct AdapterFactory;

impl AdapterFactory {
    /// Builds the adapter named by `config.provider` for one session.
    /// `session_id`/`participant_id` seed the adapter's correlation fields
    /// when the provider needs them (`generic_ws`); `mock` ignores them.
    pub fn create(
        session_id: &str,
        participant_id: &str,
        config: &GatewayConfig,
        provider_outbound: EventBus<Commit>,
        provider_inbound: EventBus<ProviderOutputEvent>,
    ) -> Result<Arc<dyn ProviderAdapter>, GatewayError> {
        match config.provider.to_lowercase().as_str() {
            "mock" => Ok(Arc::new(MockAdapter::new(
                provider_outbound,
                provider_inbound,
                config.mock_provider_delay_ms,
            ))),
            "generic_ws" => {
                if config.provider_url.trim().is_empty() {
                    return Err(GatewayError::Configuration(
                        "provider_url is required when provider = \"generic_ws\"".to_string(),
                    ));
                }
                let upstream_config = UpstreamConfig {
                    url: config.provider_url.clone(),
                    connect_timeout_ms: config.connect_timeout_secs * 1_000,
                    bearer_token: config.provider_bearer_token.clone(),
                    ..UpstreamConfig::default()
                };
                Ok(Arc::new(GenericWsAdapter::new(
                    session_id.to_string(),
                    participant_id.to_string(),
                    upstream_config,
                    provider_outbound,
                    provider_inbound,
                )))
            }
            other => Err(GatewayError::UnknownProvider(other.to_string())),
        }
    }
}
