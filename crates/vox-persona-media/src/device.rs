//! Hardware audio via cpal.
//!
//! `cpal::Stream` is not `Send`, so each stream lives on a dedicated thread
//! that owns it until told to stop.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig, SupportedStreamConfigRange};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use vox_persona_core::error::{Result, VoxError};

use crate::clock::ManualClock;
use crate::context::{AudioBackend, BlockAccumulator, CaptureDevice, PlaybackContext, TimelinePlayback};
use crate::decoder::AudioBuffer;
use crate::timeline::{SourceId, Timeline};

/// Default input and output devices of the default host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for CpalBackend {
    fn open_capture(&self, sample_rate: u32, block_size: usize) -> Result<Box<dyn CaptureDevice>> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoxError::Device("no input device available".into()))?;
        let ranges = device
            .supported_input_configs()
            .map_err(|e| VoxError::Device(e.to_string()))?;
        let config = pick_config(ranges, sample_rate)
            .ok_or_else(|| VoxError::Device(format!("input device does not support {sample_rate} Hz")))?;

        debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "Audio capture opened"
        );
        Ok(Box::new(CpalCapture {
            config,
            block_size,
            worker: None,
        }))
    }

    fn open_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackContext>> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| VoxError::Device("no output device available".into()))?;
        let ranges = device
            .supported_output_configs()
            .map_err(|e| VoxError::Device(e.to_string()))?;
        let config = pick_config(ranges, sample_rate)
            .ok_or_else(|| VoxError::Device(format!("output device does not support {sample_rate} Hz")))?;

        debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "Audio playback opened"
        );
        Ok(Arc::new(CpalPlayback::spawn(config, sample_rate)?))
    }
}

/// Prefer a mono configuration at `sample_rate`, otherwise any channel count.
fn pick_config(
    ranges: impl Iterator<Item = SupportedStreamConfigRange>,
    sample_rate: u32,
) -> Option<StreamConfig> {
    let rate = SampleRate(sample_rate);
    let mut candidates: Vec<_> = ranges
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .collect();
    candidates.sort_by_key(|c| c.channels());
    candidates
        .into_iter()
        .next()
        .map(|c| c.with_sample_rate(rate).config())
}

struct StreamWorker {
    stop: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StreamWorker {
    /// Run `build` on a new thread and keep the stream it returns playing until stopped.
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
    {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build().and_then(|s| {
                    s.play().map_err(|e| VoxError::Device(e.to_string()))?;
                    Ok(s)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop: stop_tx,
                thread,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(VoxError::Device(format!("{name} thread exited early"))),
        }
    }

    fn shutdown(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("Audio stream thread panicked");
        }
    }
}

/// Microphone capture delivering fixed-size mono blocks.
pub struct CpalCapture {
    config: StreamConfig,
    block_size: usize,
    worker: Option<StreamWorker>,
}

impl CaptureDevice for CpalCapture {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn start(&mut self, sink: mpsc::UnboundedSender<Vec<f32>>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let config = self.config.clone();
        let channels = usize::from(config.channels.max(1));
        let block_size = self.block_size;

        let worker = StreamWorker::spawn("vox-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| VoxError::Device("no input device".into()))?;
            let mut blocks = BlockAccumulator::new(block_size);
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mono: Vec<f32> = data
                            .chunks(channels)
                            .map(|f| f.iter().sum::<f32>() / f.len() as f32)
                            .collect();
                        for block in blocks.push(&mono) {
                            if sink.send(block).is_err() {
                                return;
                            }
                        }
                    },
                    |err| error!(error = %err, "Audio capture error"),
                    None,
                )
                .map_err(|e| VoxError::Device(e.to_string()))
        })?;

        self.worker = Some(worker);
        debug!("Audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
            debug!("Audio capture stopped");
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker output whose clock is advanced by the output callback.
pub struct CpalPlayback {
    inner: TimelinePlayback,
    worker: Mutex<Option<StreamWorker>>,
}

impl CpalPlayback {
    fn spawn(config: StreamConfig, sample_rate: u32) -> Result<Self> {
        let clock = ManualClock::new();
        let inner = TimelinePlayback::new(sample_rate, Arc::new(clock.clone()));
        let timeline = inner.timeline();
        let channels = usize::from(config.channels.max(1));

        let worker = StreamWorker::spawn("vox-playback", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| VoxError::Device("no output device".into()))?;
            let mut mono = Vec::new();
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        render_output(&timeline, &clock, &mut mono, data, channels);
                    },
                    |err| error!(error = %err, "Audio playback error"),
                    None,
                )
                .map_err(|e| VoxError::Device(e.to_string()))
        })?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn render_output(
    timeline: &Mutex<Timeline>,
    clock: &ManualClock,
    mono: &mut Vec<f32>,
    data: &mut [f32],
    channels: usize,
) {
    use crate::clock::Clock;

    let frames = data.len() / channels;
    mono.resize(frames, 0.0);
    let now = clock.now_frames();
    match timeline.lock() {
        Ok(timeline) => timeline.render(now, mono),
        Err(_) => mono.fill(0.0),
    }
    for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
        frame.fill(sample);
    }
    clock.advance(frames as u64);
}

impl PlaybackContext for CpalPlayback {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn start(&self, buffer: &AudioBuffer, at: f64) -> Result<SourceId> {
        self.inner.start(buffer, at)
    }

    fn stop(&self, id: SourceId) -> Result<()> {
        self.inner.stop(id)
    }

    fn is_finished(&self, id: SourceId) -> bool {
        self.inner.is_finished(id)
    }

    fn output_energy(&self) -> f32 {
        self.inner.output_energy()
    }

    fn close(&self) {
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            worker.shutdown();
        }
        self.inner.close();
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[test]
    fn test_render_output_fans_out_and_advances_clock() {
        let timeline = Mutex::new(Timeline::new());
        timeline
            .lock()
            .unwrap()
            .insert(vec![0.25, 0.5, 0.75].into(), 1);
        let clock = ManualClock::new();
        let mut mono = Vec::new();
        let mut data = vec![9.0f32; 8];

        render_output(&timeline, &clock, &mut mono, &mut data, 2);

        assert_eq!(data, vec![0.0, 0.0, 0.25, 0.25, 0.5, 0.5, 0.75, 0.75]);
        assert_eq!(clock.now_frames(), 4);
    }
}
