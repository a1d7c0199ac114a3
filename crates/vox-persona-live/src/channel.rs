//! Remote live channel abstraction.
//!
//! A [`LiveConnector`] opens one bidirectional streaming connection per
//! session. Outbound traffic goes through the cloneable [`LiveSender`];
//! inbound traffic arrives on an mpsc receiver as [`ChannelEvent`]s, in the
//! order the remote side produced them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use vox_persona_core::error::{Result, VoxError};
use vox_persona_core::types::Voice;
use vox_persona_media::Frame;

/// Which modality the model answers in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    #[default]
    Audio,
    Text,
}

/// Everything needed to open a session on the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub model: String,
    pub voice: Voice,
    pub system_instruction: String,
    pub response_modality: ResponseModality,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// One decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Base64 PCM16 audio from the model.
    Audio { data: String, mime_type: String },
    /// The user barged in; pending model audio should be discarded.
    Interrupted,
    InputTranscript(String),
    OutputTranscript(String),
    TurnComplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The remote side accepted the session setup.
    Open,
    Message(LiveEvent),
    Error(String),
    /// Closed by the remote side (or after our own close).
    Closed,
}

/// Messages queued for the transport writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Audio(Frame),
    Text(String),
    Close,
}

/// Cloneable handle for outbound traffic.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl LiveSender {
    /// Create a sender and the receiving end a transport writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn send_audio(&self, frame: Frame) -> Result<()> {
        self.send(Outbound::Audio(frame))
    }

    /// Send a complete user text turn.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(Outbound::Text(text.into()))
    }

    /// Close the connection. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Outbound::Close);
        debug!("Live channel close requested");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn send(&self, message: Outbound) -> Result<()> {
        if self.is_closed() {
            return Err(VoxError::ChannelRuntime("channel is closed".into()));
        }
        self.tx
            .send(message)
            .map_err(|_| VoxError::ChannelRuntime("channel writer has exited".into()))
    }
}

/// An open connection: the outbound handle plus the inbound event stream.
#[derive(Debug)]
pub struct LiveConnection {
    pub sender: LiveSender,
    pub events: mpsc::Receiver<ChannelEvent>,
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Open a connection. Fails with [`VoxError::ChannelOpen`].
    async fn connect(&self, request: ConnectRequest) -> Result<LiveConnection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            data: "AAA=".into(),
            mime_type: "audio/pcm;rate=16000".into(),
        }
    }

    #[test]
    fn test_sender_queues_in_order() {
        let (sender, mut rx) = LiveSender::channel();
        sender.send_audio(frame()).unwrap();
        sender.send_text("hello").unwrap();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Audio(frame()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("hello".into()));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_sends() {
        let (sender, mut rx) = LiveSender::channel();
        let other = sender.clone();
        sender.close();
        other.close();

        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        assert!(rx.try_recv().is_err());
        assert!(other.is_closed());
        assert!(matches!(
            other.send_text("late"),
            Err(VoxError::ChannelRuntime(_))
        ));
    }

    #[test]
    fn test_dropped_writer_reports_closed() {
        let (sender, rx) = LiveSender::channel();
        drop(rx);
        assert!(sender.is_closed());
        assert!(sender.send_audio(frame()).is_err());
    }

    #[test]
    fn test_response_modality_wire_name() {
        assert_eq!(
            serde_json::to_string(&ResponseModality::Audio).unwrap(),
            r#""AUDIO""#
        );
    }
}
