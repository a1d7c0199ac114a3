//! Audio pipeline for live voice sessions: PCM framing and decoding,
//! gapless playback scheduling, level analysis, and audio backends.

pub mod analyser;
pub mod clock;
pub mod context;
pub mod decoder;
#[cfg(feature = "cpal")]
pub mod device;
pub mod file;
pub mod framer;
pub mod scheduler;
pub mod timeline;

pub use analyser::{Analyser, normalized_level};
pub use context::{AudioBackend, CaptureDevice, PlaybackContext};
pub use decoder::{AudioBuffer, decode_audio};
pub use framer::{Frame, encode_block};
pub use scheduler::PlaybackScheduler;
