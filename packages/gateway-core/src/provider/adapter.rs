//! Provider adapter abstraction (§14): the common interface every
//! translation provider backend implements.

use async_trait::async_trait;

use crate::error::GatewayResult;
use crate::protocol::WireMessage;

/// A running connection to a translation provider for one session.
/// Implementors register themselves as a [`crate::bus::BusHandler`] for
/// `Commit`s on construction or in `start`; `close` tears that down.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Starts the adapter: connects (if applicable) and begins consuming
    /// commits.
    async fn start(&self) -> GatewayResult<()>;

    /// Stops the adapter and releases any owned connection.
    async fn close(&self) -> GatewayResult<()>;

    /// Lightweight liveness check surfaced by the session's health
    /// reporting.
    async fn health(&self) -> bool;

    /// Requests that the provider abandon an in-flight response, e.g. on a
    /// barge-in. `response_id` is the provider-assigned id last seen on a
    /// `ProviderOutputEvent` for the stream being interrupted, when known.
    /// The default implementation is a no-op: providers that cannot cancel
    /// a response mid-flight (the mock adapter, and providers offering no
    /// such control message) simply let it finish.
    async fn cancel(&self, response_id: Option<&str>) -> GatewayResult<()> {
        let _ = response_id;
        Ok(())
    }

    /// Sends the one-time upstream handshake (negotiated settings, then
    /// audio metadata) a call performs before any audio flows. The default
    /// is a no-op, since a provider with no network connection (the mock
    /// adapter) has nothing to hand the settings to.
    async fn send_handshake(&self, settings: WireMessage, metadata: WireMessage) -> GatewayResult<()> {
        let _ = (settings, metadata);
        Ok(())
    }
}
