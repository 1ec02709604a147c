//! Outbound audio choke point, governed by the caller's input-speech state
//! (§4.G).
//!
//! Non-audio messages always pass straight through. Audio messages are
//! gated according to [`OutboundGateMode`] and whether the local
//! participant is currently speaking — the gate itself holds no opinion
//! on speech detection and is told on every call via `is_speaking`.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::info;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::WireMessage;
use crate::protocol_constants::DEFAULT_GATE_BUFFER_LIMIT_BYTES;

/// How the gate behaves while the local participant is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundGateMode {
    /// No gating; audio is sent as it arrives.
    PlayThrough,
    /// Audio arriving while speaking is buffered and flushed once silence
    /// is detected.
    PauseAndBuffer,
    /// Audio arriving while speaking is dropped outright.
    PauseAndDrop,
}

impl OutboundGateMode {
    /// Parses a wire/config string, case- and whitespace-insensitively,
    /// defaulting to [`Self::PlayThrough`] for anything unrecognized —
    /// an unset or malformed gate mode must not silently drop audio.
    #[must_use]
    pub fn from_value(value: Option<&str>) -> Self {
        match value.map(str::trim).map(str::to_lowercase).as_deref() {
            Some("pause_and_buffer") => Self::PauseAndBuffer,
            Some("pause_and_drop") => Self::PauseAndDrop,
            _ => Self::PlayThrough,
        }
    }
}

/// Buffers or drops outbound audio while the local participant speaks,
/// per `gate_mode`, and forwards everything else immediately.
pub struct OutboundAudioGate {
    session_id: String,
    mode: OutboundGateMode,
    buffer_limit_bytes: usize,
    buffer: VecDeque<WireMessage>,
    buffer_bytes: usize,
    sink: mpsc::UnboundedSender<WireMessage>,
}

impl OutboundAudioGate {
    #[must_use]
    pub fn new(session_id: String, mode: OutboundGateMode, sink: mpsc::UnboundedSender<WireMessage>) -> Self {
        Self {
            session_id,
            mode,
            buffer_limit_bytes: DEFAULT_GATE_BUFFER_LIMIT_BYTES,
            buffer: VecDeque::new(),
            buffer_bytes: 0,
            sink,
        }
    }

    #[must_use]
    pub fn with_buffer_limit_bytes(mut self, limit: usize) -> Self {
        self.buffer_limit_bytes = limit;
        self
    }

    /// Routes one outbound message through the gate.
    pub fn handle(&mut self, message: WireMessage, is_speaking: bool) -> GatewayResult<()> {
        if !message.is_audio_payload() || self.mode == OutboundGateMode::PlayThrough {
            return self.send(message);
        }

        if is_speaking {
            if self.mode == OutboundGateMode::PauseAndDrop {
                info!(session_id = %self.session_id, "outbound gate dropping audio while speaking");
                return Ok(());
            }
            self.buffer_payload(message);
            return Ok(());
        }

        self.flush_buffer()?;
        self.send(message)
    }

    /// Called whenever the caller's speaking state changes. Flushes any
    /// buffered audio the moment silence begins, for `PauseAndBuffer`.
    pub fn on_input_state_changed(&mut self, is_speaking: bool) -> GatewayResult<()> {
        if !is_speaking && self.mode == OutboundGateMode::PauseAndBuffer {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn buffer_payload(&mut self, message: WireMessage) {
        self.buffer_bytes += Self::payload_size(&message);
        self.buffer.push_back(message);
        if self.buffer_bytes > self.buffer_limit_bytes {
            if let Some(dropped) = self.buffer.pop_front() {
                self.buffer_bytes -= Self::payload_size(&dropped);
                info!(
                    session_id = %self.session_id,
                    buffer_bytes = self.buffer_bytes,
                    limit = self.buffer_limit_bytes,
                    "outbound gate buffer overflow, dropping oldest frame"
                );
            }
        }
    }

    fn flush_buffer(&mut self) -> GatewayResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        info!(session_id = %self.session_id, buffered_frames = self.buffer.len(), "outbound gate flush");
        while let Some(message) = self.buffer.pop_front() {
            self.send(message)?;
        }
        self.buffer_bytes = 0;
        Ok(())
    }

    fn send(&self, message: WireMessage) -> GatewayResult<()> {
        self.sink
            .send(message)
            .map_err(|err| GatewayError::ParticipantSend(err.to_string()))
    }

    fn payload_size(message: &WireMessage) -> usize {
        match message {
            WireMessage::AudioData(m) => m.audio_data.data.len(),
            _ => 0,
        }
    }
}
