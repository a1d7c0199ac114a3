//! Volume monitor: samples both signal paths on a fixed cadence and publishes
//! a combined level for the indicator.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use vox_persona_media::analyser::{Analyser, normalized_level};
use vox_persona_media::PlaybackContext;

pub struct VolumeMonitor {
    cancel: CancellationToken,
    ticks: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl VolumeMonitor {
    /// Start sampling every `interval`.
    ///
    /// `publish` receives each level and returns `false` once the session it
    /// belongs to is gone, which ends the task.
    pub fn spawn<F>(
        interval: Duration,
        input: Arc<Analyser>,
        output: Arc<dyn PlaybackContext>,
        ceiling: f32,
        publish: F,
    ) -> Self
    where
        F: Fn(f32) -> bool + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let token = cancel.clone();
        let counter = Arc::clone(&ticks);

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        let level = normalized_level(
                            input.average_energy(),
                            output.output_energy(),
                            ceiling,
                        );
                        if token.is_cancelled() || !publish(level) {
                            break;
                        }
                        counter.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
            debug!("Volume monitor exited");
        });

        Self {
            cancel,
            ticks,
            handle,
        }
    }

    /// Number of levels published so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
