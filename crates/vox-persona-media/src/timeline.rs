//! Scheduled playback sources mixed on a shared frame axis.

use std::sync::Arc;

/// Handle of one scheduled source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

#[derive(Debug)]
struct Source {
    id: SourceId,
    start: u64,
    samples: Arc<[f32]>,
    stop: Option<u64>,
}

impl Source {
    /// First frame after the last audible frame.
    fn end(&self) -> u64 {
        let natural = self.start + self.samples.len() as u64;
        match self.stop {
            Some(stop) => natural.min(stop.max(self.start)),
            None => natural,
        }
    }

    fn finished_at(&self, now: u64) -> bool {
        self.end() <= now || self.stop.is_some_and(|stop| stop <= now)
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    next_id: u64,
    sources: Vec<Source>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule mono `samples` to begin at `start` (frames).
    pub fn insert(&mut self, samples: Arc<[f32]>, start: u64) -> SourceId {
        self.next_id += 1;
        let id = SourceId(self.next_id);
        self.sources.push(Source {
            id,
            start,
            samples,
            stop: None,
        });
        id
    }

    /// Silence a source from frame `at` on.
    ///
    /// Returns `false` when the source is unknown or has already finished by `at`.
    pub fn stop(&mut self, id: SourceId, at: u64) -> bool {
        match self.sources.iter_mut().find(|s| s.id == id) {
            Some(source) if !source.finished_at(at) => {
                source.stop = Some(at);
                true
            }
            _ => false,
        }
    }

    pub fn is_finished(&self, id: SourceId, now: u64) -> bool {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .is_none_or(|s| s.finished_at(now))
    }

    /// Last frame any source will sound at.
    pub fn end_frame(&self) -> u64 {
        self.sources.iter().map(Source::end).max().unwrap_or(0)
    }

    /// Mix every source overlapping `[from, from + out.len())` into `out`.
    pub fn render(&self, from: u64, out: &mut [f32]) {
        out.fill(0.0);
        let to = from + out.len() as u64;
        for source in &self.sources {
            let begin = source.start.max(from);
            let end = source.end().min(to);
            for frame in begin..end {
                out[(frame - from) as usize] += source.samples[(frame - source.start) as usize];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    /// Drop sources that finished before `frame`.
    pub fn prune(&mut self, frame: u64) {
        self.sources.retain(|s| s.end() > frame);
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
