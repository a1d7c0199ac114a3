//! Buffers partial transcription fragments until the turn completes.

use chrono::{DateTime, Utc};

use vox_persona_core::types::{ChatMessage, Role};

#[derive(Debug, Default, Clone)]
pub struct TranscriptAccumulator {
    input: String,
    output: String,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_input(&mut self, fragment: &str) {
        self.input.push_str(fragment);
    }

    pub fn append_output(&mut self, fragment: &str) {
        self.output.push_str(fragment);
    }

    /// What the user has said so far this turn.
    pub fn live_input(&self) -> &str {
        &self.input
    }

    /// What the agent has said so far this turn.
    pub fn live_output(&self) -> &str {
        &self.output
    }

    /// Close the turn: user message first, then agent message, skipping
    /// empty buffers. Both buffers are cleared.
    pub fn commit(&mut self, now: DateTime<Utc>) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        let input = std::mem::take(&mut self.input);
        let output = std::mem::take(&mut self.output);
        if !input.is_empty() {
            messages.push(ChatMessage::new(Role::User, input, now));
        }
        if !output.is_empty() {
            messages.push(ChatMessage::new(Role::Agent, output, now));
        }
        messages
    }

    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}
