//! Playback clocks, measured in sample frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of the playback-domain time.
pub trait Clock: Send + Sync {
    /// Frames elapsed since the context was opened.
    fn now_frames(&self) -> u64;
}

/// A frame counter advanced explicitly, either by tests or by an audio output callback.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    frames: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn set(&self, frames: u64) {
        self.frames.store(frames, Ordering::Release);
    }

    /// Advance by a duration in seconds at `sample_rate`.
    pub fn advance_secs(&self, secs: f64, sample_rate: u32) {
        self.advance((secs * f64::from(sample_rate)).round() as u64);
    }
}

impl Clock for ManualClock {
    fn now_frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }
}

/// Real elapsed time since creation.
#[derive(Debug, Clone)]
pub struct WallClock {
    origin: Instant,
    sample_rate: u32,
}

impl WallClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            origin: Instant::now(),
            sample_rate,
        }
    }
}

impl Clock for WallClock {
    fn now_frames(&self) -> u64 {
        (self.origin.elapsed().as_secs_f64() * f64::from(self.sample_rate)) as u64
    }
}
