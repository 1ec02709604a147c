//! Audio-path components: commit batching (§4.E), voice activity state
//! (§4.F), the outbound gate (§4.G), and provider output normalization
//! (§4.H).

pub mod batcher;
pub mod gate;
pub mod normalizer;
pub mod voice_state;

pub use batcher::{BatcherConfig, CommitBatcher};
pub use gate::{OutboundAudioGate, OutboundGateMode};
pub use normalizer::OutputNormalizer;
pub use voice_state::{InputStatus, InputVoiceState};
