//! File-backed audio: WAV input as the microphone, WAV recording as the speaker.
//!
//! Used for headless sessions and for machines without an audio device.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use vox_persona_core::error::{Result, VoxError};

use crate::clock::WallClock;
use crate::context::{AudioBackend, BlockAccumulator, CaptureDevice, PlaybackContext, TimelinePlayback};

/// Audio backend reading capture from a WAV file and recording playback to one.
#[derive(Debug, Clone, Default)]
pub struct FileBackend {
    input: Option<PathBuf>,
    record: Option<PathBuf>,
}

impl FileBackend {
    /// `input`: WAV file streamed as the microphone (silence when `None`).
    /// `record`: where to write everything played back (nothing when `None`).
    pub fn new(input: Option<PathBuf>, record: Option<PathBuf>) -> Self {
        Self { input, record }
    }
}

impl AudioBackend for FileBackend {
    fn open_capture(&self, sample_rate: u32, block_size: usize) -> Result<Box<dyn CaptureDevice>> {
        let capture = match &self.input {
            Some(path) => WavCapture::open(path, sample_rate, block_size)?,
            None => WavCapture::silent(sample_rate, block_size),
        };
        Ok(Box::new(capture))
    }

    fn open_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackContext>> {
        let mut playback = TimelinePlayback::new(sample_rate, Arc::new(WallClock::new(sample_rate)));
        if let Some(path) = &self.record {
            playback = playback.with_recording(path.clone()).map_err(|e| {
                VoxError::Device(format!("cannot record to {}: {e}", path.display()))
            })?;
        }
        Ok(Arc::new(playback))
    }
}

/// Streams a WAV file in real time, one block per block duration, then silence.
pub struct WavCapture {
    sample_rate: u32,
    block_size: usize,
    samples: Arc<[f32]>,
    cancel: Option<CancellationToken>,
}

impl WavCapture {
    /// Load `path`, which must be sampled at `sample_rate`. Multi-channel input is
    /// downmixed to mono.
    pub fn open(path: &Path, sample_rate: u32, block_size: usize) -> Result<Self> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| VoxError::Device(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.sample_rate != sample_rate {
            return Err(VoxError::Device(format!(
                "{} is sampled at {} Hz, capture requires {sample_rate} Hz",
                path.display(),
                spec.sample_rate
            )));
        }

        let interleaved = read_samples(reader)?;
        let channels = usize::from(spec.channels.max(1));
        let samples: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        info!(
            path = %path.display(),
            frames = samples.len(),
            channels,
            "Capture input loaded"
        );
        Ok(Self::from_samples(samples, sample_rate, block_size))
    }

    /// A capture device producing only silence.
    pub fn silent(sample_rate: u32, block_size: usize) -> Self {
        Self::from_samples(Vec::new(), sample_rate, block_size)
    }

    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size: block_size.max(1),
            samples: samples.into(),
            cancel: None,
        }
    }

    fn block_period(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / f64::from(self.sample_rate.max(1)))
    }
}

fn read_samples<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    let map_err = |e: hound::Error| VoxError::Device(format!("WAV read: {e}"));
    match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(map_err),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_err)
        }
    }
}

impl CaptureDevice for WavCapture {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start(&mut self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<()> {
        if self.cancel.is_some() {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| VoxError::Device(format!("capture needs a tokio runtime: {e}")))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let samples = Arc::clone(&self.samples);
        let block_size = self.block_size;
        let period = self.block_period();

        handle.spawn(async move {
            let mut blocks = BlockAccumulator::new(block_size);
            let mut queued = blocks.push(&samples);
            let mut tail = samples.len() % block_size;
            if tail > 0 {
                tail = block_size - tail;
                queued.extend(blocks.push(&vec![0.0; tail]));
            }
            let mut queued = queued.into_iter();

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let block = queued.next().unwrap_or_else(|| vec![0.0; block_size]);
                        if sink.send(block).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("WAV capture task exited");
        });

        self.cancel = Some(cancel);
        debug!(block_size = self.block_size, "WAV capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
            debug!("WAV capture stopped");
        }
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, rate: u32, channels: u16, frames: &[i16]) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in frames {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_rejects_wrong_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        write_wav(&path, 44_100, 1, &[0; 100]);
        let err = WavCapture::open(&path, 16_000, 256).err().unwrap();
        assert!(matches!(err, VoxError::Device(_)));
    }

    #[test]
    fn test_missing_file_is_device_error() {
        let err = WavCapture::open(Path::new("/nonexistent/in.wav"), 16_000, 256)
            .err()
            .unwrap();
        assert!(matches!(err, VoxError::Device(_)));
    }

    #[test]
    fn test_stereo_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 16_000, 2, &[16384, 0, -16384, -16384]);
        let capture = WavCapture::open(&path, 16_000, 4).unwrap();
        assert_eq!(&capture.samples[..], &[0.25, -0.5]);
    }

    #[tokio::test]
    async fn test_streams_blocks_then_silence() {
        let mut capture = WavCapture::from_samples(vec![0.5; 6], 16_000, 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        capture.start(tx).unwrap();

        assert_eq!(rx.recv().await.unwrap(), vec![0.5; 4]);
        assert_eq!(rx.recv().await.unwrap(), vec![0.5, 0.5, 0.0, 0.0]);
        assert_eq!(rx.recv().await.unwrap(), vec![0.0; 4]);

        capture.stop();
        capture.stop();
        // Drain whatever was in flight; the channel closes once the task exits.
        while rx.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_backend_playback_records() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("out.wav");
        let backend = FileBackend::new(None, Some(record.clone()));

        let playback = backend.open_playback(24_000).unwrap();
        assert_eq!(playback.sample_rate(), 24_000);
        playback.close();
        assert!(record.exists());

        let mut capture = backend.open_capture(16_000, 1024).unwrap();
        assert_eq!(capture.sample_rate(), 16_000);
        capture.stop();
    }

    #[test]
    fn test_unwritable_recording_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(None, Some(dir.path().join("missing/out.wav")));
        assert!(matches!(
            backend.open_playback(24_000),
            Err(VoxError::Device(_))
        ));
    }
}
