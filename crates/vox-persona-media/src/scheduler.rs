//! Gapless sequential playback with barge-in support.

use std::sync::Arc;

use tracing::debug;

use vox_persona_core::error::Result;

use crate::context::PlaybackContext;
use crate::decoder::AudioBuffer;
use crate::timeline::SourceId;

/// Queues decoded buffers back-to-back on a playback context.
///
/// The cursor only moves forward, except on [`PlaybackScheduler::interrupt`],
/// which discards everything scheduled and resets it to zero.
pub struct PlaybackScheduler {
    context: Arc<dyn PlaybackContext>,
    cursor: f64,
    active: Vec<SourceId>,
}

impl PlaybackScheduler {
    pub fn new(context: Arc<dyn PlaybackContext>) -> Self {
        Self {
            context,
            cursor: 0.0,
            active: Vec::new(),
        }
    }

    /// Schedule `buffer` right after everything already queued, or now if the
    /// queue has drained. Returns the start time in seconds.
    pub fn enqueue(&mut self, buffer: &AudioBuffer) -> Result<f64> {
        self.prune();
        let start = self.cursor.max(self.context.current_time());
        let id = self.context.start(buffer, start)?;
        self.cursor = start + buffer.duration();
        self.active.push(id);
        debug!(start, cursor = self.cursor, active = self.active.len(), "Buffer enqueued");
        Ok(start)
    }

    /// Stop every scheduled buffer and reset the cursor.
    pub fn interrupt(&mut self) {
        let count = self.active.len();
        for id in self.active.drain(..) {
            if let Err(e) = self.context.stop(id) {
                debug!(?id, error = %e, "Source already finished");
            }
        }
        self.cursor = 0.0;
        debug!(stopped = count, "Playback interrupted");
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Buffers still scheduled or playing.
    pub fn active_count(&mut self) -> usize {
        self.prune();
        self.active.len()
    }

    fn prune(&mut self) {
        let context = &self.context;
        self.active.retain(|id| !context.is_finished(*id));
    }
}
