//! Live conversation engine.
//!
//! Connects a persona to a hosted live model: the remote channel, transcript
//! accumulation, the volume monitor, and the [`SessionManager`] that ties them
//! to the audio pipeline.

pub mod channel;
pub mod gemini;
pub mod manager;
pub mod monitor;
pub mod transcript;

pub use channel::{
    ChannelEvent, ConnectRequest, LiveConnection, LiveConnector, LiveEvent, LiveSender, Outbound,
    ResponseModality,
};
pub use gemini::GeminiLiveConnector;
pub use manager::{SESSION_ERROR_MESSAGE, SessionManager, SessionSettings, SessionState, SessionView};
pub use transcript::TranscriptAccumulator;
