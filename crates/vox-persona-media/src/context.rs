//! Capture devices, playback contexts, and the backends that open them.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vox_persona_core::error::{Result, VoxError};

use crate::analyser::{self, FFT_SIZE};
use crate::clock::Clock;
use crate::decoder::AudioBuffer;
use crate::timeline::{SourceId, Timeline};

/// A capture device pushing fixed-size blocks of normalized samples.
pub trait CaptureDevice: Send {
    fn sample_rate(&self) -> u32;

    /// Begin delivering blocks to `sink` until [`CaptureDevice::stop`].
    fn start(&mut self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<()>;

    /// Stop delivering blocks and release the device. Idempotent.
    fn stop(&mut self);
}

/// The playback domain: a clock plus scheduled sources.
pub trait PlaybackContext: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current playback clock in seconds.
    fn current_time(&self) -> f64;

    /// Schedule `buffer` to begin at `at` seconds on the playback clock.
    fn start(&self, buffer: &AudioBuffer, at: f64) -> Result<SourceId>;

    /// Stop a source. Fails with [`VoxError::Playback`] if it already finished.
    fn stop(&self, id: SourceId) -> Result<()>;

    fn is_finished(&self, id: SourceId) -> bool;

    /// Average spectrum energy of the most recently rendered output.
    fn output_energy(&self) -> f32;

    /// Release the context. Idempotent.
    fn close(&self);
}

/// Opens both audio domains for a session.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, sample_rate: u32, block_size: usize) -> Result<Box<dyn CaptureDevice>>;

    fn open_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackContext>>;
}

/// Splits an arbitrary sample stream into fixed-size blocks.
#[derive(Debug)]
pub struct BlockAccumulator {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAccumulator {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Append samples, returning every block completed by them.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut blocks = Vec::new();
        for &s in samples {
            self.pending.push(s);
            if self.pending.len() == self.block_size {
                blocks.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.block_size),
                ));
            }
        }
        blocks
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Rendered output is appended to the recording in chunks of this many frames.
const RECORD_CHUNK: usize = 4096;

type WavFileWriter = hound::WavWriter<BufWriter<File>>;

/// Incremental WAV writer for everything a [`TimelinePlayback`] played.
struct Recorder {
    path: PathBuf,
    writer: WavFileWriter,
    written: u64,
}

fn recording_error(e: hound::Error) -> VoxError {
    VoxError::Playback(format!("recording: {e}"))
}

impl Recorder {
    fn create(path: PathBuf, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec).map_err(recording_error)?;
        Ok(Self {
            path,
            writer,
            written: 0,
        })
    }

    /// Render and write frames up to `upto`. Frames already written are final.
    fn append(&mut self, timeline: &Timeline, upto: u64) -> Result<()> {
        let mut chunk = [0.0f32; RECORD_CHUNK];
        while self.written < upto {
            let len = (upto - self.written).min(RECORD_CHUNK as u64) as usize;
            timeline.render(self.written, &mut chunk[..len]);
            for &sample in &chunk[..len] {
                self.writer
                    .write_sample(crate::framer::float_to_pcm16(sample))
                    .map_err(recording_error)?;
            }
            self.written += len as u64;
        }
        Ok(())
    }

    fn finish(mut self, timeline: &Timeline, upto: u64) -> Result<()> {
        self.append(timeline, upto)?;
        self.writer.finalize().map_err(recording_error)?;
        info!(path = %self.path.display(), frames = self.written, "Playback recording written");
        Ok(())
    }
}

/// A playback context rendering a [`Timeline`] against a [`Clock`].
///
/// Sources that finished more than one analysis window ago are dropped from
/// the timeline whenever a source is started or the output is analysed. With
/// a recording attached, audio is written to the WAV file before it is
/// dropped, so closing only writes the remaining tail.
pub struct TimelinePlayback {
    sample_rate: u32,
    clock: Arc<dyn Clock>,
    timeline: Arc<Mutex<Timeline>>,
    recorder: Mutex<Option<Recorder>>,
    closed: AtomicBool,
}

impl TimelinePlayback {
    pub fn new(sample_rate: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            sample_rate,
            clock,
            timeline: Arc::new(Mutex::new(Timeline::new())),
            recorder: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Record rendered output to a WAV file at `path`, created immediately.
    pub fn with_recording(self, path: PathBuf) -> Result<Self> {
        let recorder = Recorder::create(path, self.sample_rate)?;
        Ok(Self {
            recorder: Mutex::new(Some(recorder)),
            ..self
        })
    }

    /// Shared timeline, for output callbacks that pull rendered audio.
    pub fn timeline(&self) -> Arc<Mutex<Timeline>> {
        Arc::clone(&self.timeline)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frames written to the recording so far.
    pub fn recorded_frames(&self) -> u64 {
        self.recorder
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.written))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Timeline>> {
        self.timeline
            .lock()
            .map_err(|_| VoxError::Playback("timeline lock poisoned".into()))
    }

    /// Flush the recording up to `frame`, then drop sources that ended by it.
    fn settle(&self, timeline: &mut Timeline, frame: u64) {
        if let Ok(mut recorder) = self.recorder.lock() {
            if let Some(rec) = recorder.as_mut() {
                if let Err(e) = rec.append(timeline, frame) {
                    warn!(error = %e, "Recording stopped");
                    *recorder = None;
                }
            }
        }
        timeline.prune(frame);
    }

    /// Oldest frame the output analysis can still read.
    fn settled_frame(&self) -> u64 {
        self.clock.now_frames().saturating_sub(FFT_SIZE as u64)
    }
}

impl PlaybackContext for TimelinePlayback {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.clock.now_frames() as f64 / f64::from(self.sample_rate)
    }

    /// A start time already in the past begins at once.
    fn start(&self, buffer: &AudioBuffer, at: f64) -> Result<SourceId> {
        if self.is_closed() {
            return Err(VoxError::Playback("context is closed".into()));
        }
        if buffer.sample_rate != self.sample_rate {
            return Err(VoxError::Playback(format!(
                "buffer rate {} does not match context rate {}",
                buffer.sample_rate, self.sample_rate
            )));
        }
        let now = self.clock.now_frames();
        let start = ((at.max(0.0) * f64::from(self.sample_rate)).round() as u64).max(now);
        let mut timeline = self.lock()?;
        self.settle(&mut timeline, self.settled_frame());
        let id = timeline.insert(buffer.mono(), start);
        debug!(?id, start, frames = buffer.frames(), retained = timeline.len(), "Source scheduled");
        Ok(id)
    }

    fn stop(&self, id: SourceId) -> Result<()> {
        let now = self.clock.now_frames();
        if self.lock()?.stop(id, now) {
            Ok(())
        } else {
            Err(VoxError::Playback(format!("source {} is not playing", id.0)))
        }
    }

    fn is_finished(&self, id: SourceId) -> bool {
        let now = self.clock.now_frames();
        self.lock().map(|t| t.is_finished(id, now)).unwrap_or(true)
    }

    fn output_energy(&self) -> f32 {
        let now = self.clock.now_frames();
        let from = now.saturating_sub(FFT_SIZE as u64);
        let mut window = vec![0.0f32; (now - from) as usize];
        match self.lock() {
            Ok(mut timeline) => {
                timeline.render(from, &mut window);
                self.settle(&mut timeline, from);
            }
            Err(_) => return 0.0,
        }
        analyser::average_energy(&window)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(mut timeline) = self.timeline.lock() else {
            return;
        };
        let recorder = self.recorder.lock().ok().and_then(|mut r| r.take());
        if let Some(recorder) = recorder {
            let end = timeline.end_frame().min(self.clock.now_frames());
            if let Err(e) = recorder.finish(&timeline, end) {
                warn!(error = %e, "Failed to write playback recording");
            }
        }
        timeline.clear();
        debug!("Playback context closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn context() -> (TimelinePlayback, ManualClock) {
        let clock = ManualClock::new();
        (TimelinePlayback::new(24_000, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_block_accumulator() {
        let mut acc = BlockAccumulator::new(4);
        assert!(acc.push(&[0.1, 0.2, 0.3]).is_empty());
        let blocks = acc.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(blocks, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        acc.clear();
        assert_eq!(acc.push(&[1.0, 1.0, 1.0, 1.0]).len(), 1);
    }

    #[test]
    fn test_start_and_finish_follow_clock() {
        let (ctx, clock) = context();
        let buffer = AudioBuffer::from_mono(vec![0.5; 2400], 24_000);
        let id = ctx.start(&buffer, 0.05).unwrap();
        assert!(!ctx.is_finished(id));
        clock.advance_secs(0.1, 24_000);
        assert!(!ctx.is_finished(id));
        clock.advance_secs(0.05, 24_000);
        assert!(ctx.is_finished(id));
        assert!(matches!(ctx.stop(id), Err(VoxError::Playback(_))));
    }

    #[test]
    fn test_rate_mismatch_rejected() {
        let (ctx, _clock) = context();
        let buffer = AudioBuffer::from_mono(vec![0.0; 10], 16_000);
        assert!(ctx.start(&buffer, 0.0).is_err());
    }

    #[test]
    fn test_output_energy_tracks_rendered_audio() {
        let (ctx, clock) = context();
        assert_eq!(ctx.output_energy(), 0.0);

        let tone: Vec<f32> = (0..4800).map(|i| 0.6 * (i as f32 * 0.2).sin()).collect();
        ctx.start(&AudioBuffer::from_mono(tone, 24_000), 0.0).unwrap();
        clock.advance(1000);
        assert!(ctx.output_energy() > 0.0);

        clock.advance(10_000);
        assert_eq!(ctx.output_energy(), 0.0);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_new_sources() {
        let (ctx, _clock) = context();
        ctx.close();
        ctx.close();
        let buffer = AudioBuffer::from_mono(vec![0.0; 10], 24_000);
        assert!(ctx.start(&buffer, 0.0).is_err());
    }

    #[test]
    fn test_recording_written_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let clock = ManualClock::new();
        let ctx = TimelinePlayback::new(24_000, Arc::new(clock.clone()))
            .with_recording(path.clone())
            .unwrap();

        ctx.start(&AudioBuffer::from_mono(vec![0.5; 480], 24_000), 0.0)
            .unwrap();
        clock.advance(1000);
        ctx.close();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.len(), 480);
    }

    #[test]
    fn test_finished_sources_are_dropped() {
        let (ctx, clock) = context();
        let timeline = ctx.timeline();
        for _ in 0..2_000 {
            let at = ctx.current_time();
            ctx.start(&AudioBuffer::from_mono(vec![0.1; 2400], 24_000), at)
                .unwrap();
            clock.advance(4800);
            assert!(timeline.lock().unwrap().len() <= 2);
        }
        assert_eq!(ctx.output_energy(), 0.0);
        assert!(timeline.lock().unwrap().is_empty());
    }

    #[test]
    fn test_past_start_begins_now() {
        let (ctx, clock) = context();
        clock.advance(1000);
        let id = ctx
            .start(&AudioBuffer::from_mono(vec![0.5; 100], 24_000), 0.0)
            .unwrap();
        clock.advance(99);
        assert!(!ctx.is_finished(id));
        clock.advance(1);
        assert!(ctx.is_finished(id));
    }

    #[test]
    fn test_recording_is_written_as_sources_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let clock = ManualClock::new();
        let ctx = TimelinePlayback::new(24_000, Arc::new(clock.clone()))
            .with_recording(path.clone())
            .unwrap();
        let timeline = ctx.timeline();

        ctx.start(&AudioBuffer::from_mono(vec![0.5; 480], 24_000), 0.0)
            .unwrap();
        clock.advance(1000);
        ctx.output_energy();
        assert!(timeline.lock().unwrap().is_empty());
        assert_eq!(ctx.recorded_frames(), 1000 - FFT_SIZE as u64);

        let at = ctx.current_time();
        ctx.start(&AudioBuffer::from_mono(vec![0.5; 480], 24_000), at)
            .unwrap();
        clock.advance(2000);
        ctx.close();

        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 1480);
        assert!(samples[..480].iter().all(|&s| s == 16384));
        assert!(samples[480..1000].iter().all(|&s| s == 0));
        assert!(samples[1000..].iter().all(|&s| s == 16384));
    }
}
