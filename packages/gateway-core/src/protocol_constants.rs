//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the wire protocol or by downstream/upstream
//! clients already deployed against it; changing them would break
//! compatibility rather than just behavior.

// ─────────────────────────────────────────────────────────────────────────────
// Audio Format
// ─────────────────────────────────────────────────────────────────────────────

/// Negotiated sample width, in bytes. The only value accepted; an
/// `AudioMetadata` negotiating anything else is an invariant breach.
pub const PCM_SAMPLE_WIDTH_BYTES: u32 = 2;

/// Default sample rate (Hz) assumed when session metadata is silent on it.
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 16_000;

/// Default channel count assumed when session metadata is silent on it.
pub const DEFAULT_CHANNELS: u16 = 1;

/// Default outbound frame duration (ms) used to derive `frame_bytes` when
/// neither the negotiated metadata nor the session overrides it.
pub const DEFAULT_FRAME_DURATION_MS: u32 = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Silence Detection
// ─────────────────────────────────────────────────────────────────────────────

/// RMS energy threshold below which a sealed commit is marked `is_silence`.
pub const SILENCE_RMS_THRESHOLD: f64 = 50.0;

// ─────────────────────────────────────────────────────────────────────────────
// Call Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Alphabet call codes are drawn from: uppercase ASCII letters and digits.
pub const CALL_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length, in characters, of a generated call code.
pub const CALL_CODE_LENGTH: usize = 6;

/// Size of the in-memory ring of most-recently-created calls kept for the
/// diagnostic "recent calls" view.
pub const MAX_RECENT_CALLS: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Timing
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between upstream keep-alive pings on long-lived connections.
pub const UPSTREAM_HEARTBEAT_INTERVAL_SECS: u64 = 20;

/// Default outbound audio gate buffer cap (bytes) for `pause_and_buffer` mode.
pub const DEFAULT_GATE_BUFFER_LIMIT_BYTES: usize = 5 * 1024 * 1024;

/// Ceiling on a single inbound upstream frame, generous enough for long
/// synthesized audio segments.
pub const MAX_UPSTREAM_FRAME_BYTES: usize = 32 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Close Codes (§6)
// ─────────────────────────────────────────────────────────────────────────────

/// Downstream close code: first message carried no call code.
pub const CLOSE_MISSING_CALL_CODE: u16 = 4400;
/// Downstream close code: first message carried no participant id.
pub const CLOSE_MISSING_PARTICIPANT_ID: u16 = 4401;
/// Downstream close code: call code did not match a known call.
pub const CLOSE_UNKNOWN_CALL: u16 = 4404;
/// Downstream close code: upstream failure, used for any session-fatal error.
pub const CLOSE_UPSTREAM_FAILURE: u16 = 1011;

/// Timestamp normalization threshold (§4.D): a provider timestamp larger
/// than this is treated as an absolute epoch value and rebased to
/// scenario-relative milliseconds.
pub const ABSOLUTE_TIMESTAMP_THRESHOLD_MS: i64 = 1_000_000_000;
