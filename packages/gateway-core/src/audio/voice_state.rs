//! Per-participant silence/speaking state machine driven by RMS energy
//! (§4.F).

/// Two-state machine: `Silence` and `Speaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStatus {
    Silence,
    Speaking,
}

/// Tracks whether inbound audio recently contains speech.
#[derive(Debug, Clone)]
pub struct InputVoiceState {
    status: InputStatus,
    voice_detected_from_ms: Option<u64>,
    voice_detected_last_ms: u64,
}

impl Default for InputVoiceState {
    fn default() -> Self {
        Self {
            status: InputStatus::Silence,
            voice_detected_from_ms: None,
            voice_detected_last_ms: 0,
        }
    }
}

impl InputVoiceState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(&self) -> InputStatus {
        self.status
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.status == InputStatus::Speaking
    }

    /// Registers voice activity at `now_ms`. While silent, voice must be
    /// continuously present for at least `hysteresis_ms` before the state
    /// transitions to `Speaking` — this suppresses single-frame spikes.
    /// Returns whether a transition occurred.
    pub fn on_voice_detected(&mut self, now_ms: u64, hysteresis_ms: u64) -> bool {
        if self.status == InputStatus::Silence {
            if self.voice_detected_from_ms.is_none() {
                self.voice_detected_from_ms = Some(now_ms);
            }
            let elapsed = now_ms.saturating_sub(self.voice_detected_from_ms.unwrap());
            if elapsed < hysteresis_ms {
                return false;
            }
            self.status = InputStatus::Speaking;
            self.voice_detected_last_ms = now_ms;
            return true;
        }

        self.voice_detected_last_ms = now_ms;
        false
    }

    /// Registers the absence of voice at `now_ms`. Transitions
    /// `Speaking -> Silence` once no voice has been seen for more than
    /// `silence_threshold_ms`. Returns whether a transition occurred.
    pub fn on_silence_detected(&mut self, now_ms: u64, silence_threshold_ms: u64) -> bool {
        if self.status == InputStatus::Speaking && self.voice_detected_last_ms != 0 {
            if now_ms.saturating_sub(self.voice_detected_last_ms) > silence_threshold_ms {
                self.status = InputStatus::Silence;
                self.voice_detected_from_ms = None;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_hysteresis_transitions_immediately() {
        let mut state = InputVoiceState::new();
        assert!(state.on_voice_detected(100, 0));
        assert!(state.is_speaking());
    }

    #[test]
    fn hysteresis_suppresses_single_frame_spike() {
        let mut state = InputVoiceState::new();
        assert!(!state.on_voice_detected(100, 50));
        assert!(!state.is_speaking());
        // Same segment, not yet past hysteresis.
        assert!(!state.on_voice_detected(120, 50));
        assert!(!state.is_speaking());
        // Past hysteresis from first detection at 100ms.
        assert!(state.on_voice_detected(160, 50));
        assert!(state.is_speaking());
    }

    #[test]
    fn silence_after_threshold_transitions_back() {
        let mut state = InputVoiceState::new();
        state.on_voice_detected(0, 0);
        assert!(state.is_speaking());
        assert!(!state.on_silence_detected(50, 100));
        assert!(state.is_speaking());
        assert!(state.on_silence_detected(200, 100));
        assert!(!state.is_speaking());
    }

    #[test]
    fn new_segment_resets_from_timestamp_after_silence() {
        let mut state = InputVoiceState::new();
        state.on_voice_detected(0, 0);
        state.on_silence_detected(200, 100);
        assert!(!state.is_speaking());
        // New segment starts fresh; hysteresis measured from this detection.
        assert!(!state.on_voice_detected(300, 50));
        assert!(state.on_voice_detected(360, 50));
    }
}
