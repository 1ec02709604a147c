//! Centralized error types for the translation gateway core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to the WebSocket close codes the downstream wire protocol
//!   uses, rather than HTTP status codes
//! - Implements `IntoResponse` for the thin HTTP surfaces this crate does own
//!   (`/healthz`)

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for structured logs and wire
    /// `error` events.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the gateway core library.
///
/// One variant per row of the error taxonomy: protocol violations and
/// decode failures are recoverable (logged, frame dropped); upstream and
/// invariant failures are session-fatal and carry a WebSocket close code.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum GatewayError {
    /// Inbound message had an unrecognized `kind`/`type`. Logged and dropped;
    /// the session continues.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Malformed base64 payload or invalid JSON. Logged at warning; the
    /// offending frame is dropped.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// Upstream connect attempt timed out or was refused.
    #[error("upstream connect failed: {0}")]
    UpstreamConnect(String),

    /// Upstream socket closed or errored mid-stream.
    #[error("upstream failed mid-stream: {0}")]
    UpstreamMidStream(String),

    /// A bounded handler queue rejected an item under its overflow policy.
    #[error("queue overflow: handler={handler} policy={policy} depth={depth}")]
    QueueOverflow {
        /// Name of the event-bus handler whose queue overflowed.
        handler: String,
        /// Configured overflow policy in effect.
        policy: String,
        /// Queue depth observed at the time of overflow.
        depth: usize,
    },

    /// A send to a participant's downstream socket failed. The participant
    /// is removed from the call; other participants are unaffected.
    #[error("participant send failed: {0}")]
    ParticipantSend(String),

    /// A protocol invariant was violated (e.g. sample width != 2 bytes,
    /// `AudioData` received before `AudioMetadata`). Fatal to the session.
    #[error("invariant breach: {0}")]
    InvariantBreach(String),

    /// Unknown provider identifier at adapter-factory resolution time.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl ErrorCode for GatewayError {
    fn code(&self) -> &'static str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::DecodeFailure(_) => "decode_failure",
            Self::UpstreamConnect(_) => "upstream_connect_failed",
            Self::UpstreamMidStream(_) => "upstream_mid_stream_failed",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::ParticipantSend(_) => "participant_send_failed",
            Self::InvariantBreach(_) => "invariant_breach",
            Self::UnknownProvider(_) => "unknown_provider",
            Self::Configuration(_) => "configuration_error",
        }
    }
}

impl GatewayError {
    /// Whether this error is fatal to the owning session and should close
    /// the downstream socket with [`GatewayError::close_code`].
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::UpstreamConnect(_) | Self::InvariantBreach(_)
        )
    }

    /// Maps the error to the WebSocket close code the downstream wire
    /// protocol specifies for it, if any.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::UpstreamConnect(_) | Self::UpstreamMidStream(_) | Self::InvariantBreach(_) => {
                Some(1011)
            }
            _ => None,
        }
    }
}

/// Errors raised while accepting and routing a downstream connection, kept
/// distinct from [`GatewayError`] because they occur before a session
/// exists to own them.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The first message carried no call code.
    #[error("missing call code")]
    MissingCallCode,

    /// The first message carried no participant id.
    #[error("missing participant id")]
    MissingParticipantId,

    /// The call code did not match any known call.
    #[error("unknown call: {0}")]
    UnknownCall(String),

    /// Any other session-fatal error surfaced while bringing up the
    /// session (upstream connect failure, invariant breach).
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl RouterError {
    /// Close code used by the server for each rejection path (§6).
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            Self::MissingCallCode => 4400,
            Self::MissingParticipantId => 4401,
            Self::UnknownCall(_) => 4404,
            Self::Gateway(err) => err.close_code().unwrap_or(1011),
        }
    }
}

/// Convenient Result alias for gateway core operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// JSON response body for the `/healthz` HTTP surface's error path.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_connect_closes_1011() {
        let err = GatewayError::UpstreamConnect("timeout".into());
        assert_eq!(err.code(), "upstream_connect_failed");
        assert_eq!(err.close_code(), Some(1011));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn protocol_violation_is_not_fatal() {
        let err = GatewayError::ProtocolViolation("unknown kind".into());
        assert_eq!(err.close_code(), None);
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn router_error_close_codes_match_wire_contract() {
        assert_eq!(RouterError::MissingCallCode.close_code(), 4400);
        assert_eq!(RouterError::MissingParticipantId.close_code(), 4401);
        assert_eq!(RouterError::UnknownCall("ABC123".into()).close_code(), 4404);
        let wrapped = RouterError::Gateway(GatewayError::InvariantBreach("bad".into()));
        assert_eq!(wrapped.close_code(), 1011);
    }
}
