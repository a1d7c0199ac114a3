//! Session lifecycle manager.
//!
//! Owns at most one live session at a time: the capture device, both audio
//! contexts, the remote connection, and the tasks that move data between them.
//! Every session carries a generation number; anything produced on behalf of an
//! older generation is dropped on arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vox_persona_core::config::{
    CAPTURE_SAMPLE_RATE, Config, DEFAULT_MODEL, PLAYBACK_SAMPLE_RATE,
};
use vox_persona_core::error::{Result, VoxError};
use vox_persona_core::instruction::compose_system_instruction;
use vox_persona_core::types::{AgentConfig, ChatMessage, KnowledgeFile};
use vox_persona_media::analyser::Analyser;
use vox_persona_media::decoder::{decode_audio, parse_pcm_rate};
use vox_persona_media::framer::encode_block;
use vox_persona_media::{AudioBackend, CaptureDevice, PlaybackContext, PlaybackScheduler};

use crate::channel::{
    ChannelEvent, ConnectRequest, LiveConnection, LiveConnector, LiveEvent, LiveSender,
    ResponseModality,
};
use crate::monitor::VolumeMonitor;
use crate::transcript::TranscriptAccumulator;

/// Shown to the user when the live channel fails.
pub const SESSION_ERROR_MESSAGE: &str =
    "The live session encountered an error. Check your API key and quota.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
    Errored,
}

/// Everything a rendering layer needs to draw the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub is_active: bool,
    pub messages: Vec<ChatMessage>,
    pub live_input_text: String,
    pub live_output_text: String,
    /// Combined input/output level in [0, 1].
    pub level: f32,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: String,
    pub capture_block_size: usize,
    pub level_ceiling: f32,
    pub monitor_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            capture_block_size: 1024,
            level_ceiling: 128.0,
            monitor_interval: Duration::from_millis(16),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let audio = config.audio();
        Self {
            model: config.model(),
            capture_block_size: audio.capture_block_size,
            level_ceiling: audio.level_ceiling,
            monitor_interval: Duration::from_millis(audio.monitor_interval_ms),
        }
    }
}

struct Session {
    generation: u64,
    cancel: CancellationToken,
    capture: Box<dyn CaptureDevice>,
    playback: Arc<dyn PlaybackContext>,
    scheduler: PlaybackScheduler,
    analyser: Arc<Analyser>,
    transcript: TranscriptAccumulator,
    sender: Option<LiveSender>,
    monitor: Option<VolumeMonitor>,
    capture_pump: Option<JoinHandle<()>>,
}

impl Session {
    fn new(
        generation: u64,
        capture: Box<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackContext>,
    ) -> Self {
        Self {
            generation,
            cancel: CancellationToken::new(),
            capture,
            scheduler: PlaybackScheduler::new(Arc::clone(&playback)),
            playback,
            analyser: Arc::new(Analyser::new()),
            transcript: TranscriptAccumulator::new(),
            sender: None,
            monitor: None,
            capture_pump: None,
        }
    }

    /// Release everything the session holds. Idempotent.
    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(pump) = self.capture_pump.take() {
            pump.abort();
        }
        if let Some(sender) = self.sender.take() {
            sender.close();
        }
        self.capture.stop();
        self.scheduler.interrupt();
        self.playback.close();
        self.analyser.clear();
        self.transcript.reset();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Inner {
    connector: Arc<dyn LiveConnector>,
    backend: Arc<dyn AudioBackend>,
    settings: SessionSettings,
    session: Mutex<Option<Session>>,
    view: watch::Sender<SessionView>,
    generation: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    fn publish(&self, update: impl FnOnce(&mut SessionView)) {
        self.view.send_modify(update);
    }

    /// Run `f` against the session if it is still generation `generation`.
    fn with_session<R>(&self, generation: u64, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(session) if session.generation == generation => Some(f(session)),
            _ => None,
        }
    }

    /// Tear down the current session, or only generation `only` when given.
    fn stop_session(&self, only: Option<u64>) {
        let mut guard = self.lock();
        if let Some(generation) = only {
            if guard.as_ref().map(|s| s.generation) != Some(generation) {
                return;
            }
        }
        self.generation.fetch_add(1, Ordering::AcqRel);

        if let Some(mut session) = guard.take() {
            self.publish(|v| v.state = SessionState::Stopping);
            session.shutdown();
            info!(generation = session.generation, "Live session stopped");
        }
        self.publish(|v| {
            v.state = SessionState::Idle;
            v.is_active = false;
            v.level = 0.0;
            v.live_input_text.clear();
            v.live_output_text.clear();
        });
    }

    /// Record a fatal session error, then tear the session down.
    fn fail(&self, generation: u64, message: String) {
        let current = self.with_session(generation, |_| {
            self.publish(|v| {
                v.state = SessionState::Errored;
                v.error = Some(message);
            });
        });
        if current.is_some() {
            self.stop_session(Some(generation));
        }
    }

    fn publish_level(&self, generation: u64, level: f32) -> bool {
        self.with_session(generation, |_| {
            self.view.send_if_modified(|v| {
                if v.level == level {
                    return false;
                }
                v.level = level;
                true
            });
        })
        .is_some()
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => self.activate(generation),
            ChannelEvent::Message(LiveEvent::Audio { data, mime_type }) => {
                self.play_audio(generation, &data, &mime_type)
            }
            ChannelEvent::Message(LiveEvent::Interrupted) => {
                self.with_session(generation, |s| s.scheduler.interrupt());
                debug!(generation, "Model output interrupted");
            }
            ChannelEvent::Message(LiveEvent::InputTranscript(text)) => {
                self.with_session(generation, |s| {
                    s.transcript.append_input(&text);
                    let live = s.transcript.live_input().to_string();
                    self.publish(|v| v.live_input_text = live);
                });
            }
            ChannelEvent::Message(LiveEvent::OutputTranscript(text)) => {
                self.with_session(generation, |s| {
                    s.transcript.append_output(&text);
                    let live = s.transcript.live_output().to_string();
                    self.publish(|v| v.live_output_text = live);
                });
            }
            ChannelEvent::Message(LiveEvent::TurnComplete) => {
                self.with_session(generation, |s| {
                    let committed = s.transcript.commit(Utc::now());
                    debug!(generation, messages = committed.len(), "Turn complete");
                    self.publish(|v| {
                        v.messages.extend(committed);
                        v.live_input_text.clear();
                        v.live_output_text.clear();
                    });
                });
            }
            ChannelEvent::Error(detail) => {
                error!(generation, error = %detail, "Live channel error");
                self.fail(generation, format!("{SESSION_ERROR_MESSAGE} ({detail})"));
            }
            ChannelEvent::Closed => {
                info!(generation, "Live channel closed");
                self.stop_session(Some(generation));
            }
        }
    }

    /// The remote side accepted the setup: start capture and monitoring.
    fn activate(self: &Arc<Self>, generation: u64) {
        let result = self.with_session(generation, |session| -> Result<()> {
            let sender = session
                .sender
                .clone()
                .ok_or_else(|| VoxError::ChannelRuntime("channel opened without a sender".into()))?;

            let (block_tx, block_rx) = mpsc::unbounded_channel();
            session.capture.start(block_tx)?;
            session.capture_pump = Some(tokio::spawn(pump_capture(
                block_rx,
                Arc::clone(&session.analyser),
                sender,
                session.cancel.clone(),
            )));

            let weak = Arc::downgrade(self);
            session.monitor = Some(VolumeMonitor::spawn(
                self.settings.monitor_interval,
                Arc::clone(&session.analyser),
                Arc::clone(&session.playback),
                self.settings.level_ceiling,
                move |level| {
                    weak.upgrade()
                        .is_some_and(|inner| inner.publish_level(generation, level))
                },
            ));

            self.publish(|v| {
                v.state = SessionState::Active;
                v.is_active = true;
            });
            Ok(())
        });

        match result {
            Some(Ok(())) => info!(generation, "Live session active"),
            Some(Err(e)) => {
                error!(generation, error = %e, "Failed to start capture");
                self.fail(generation, e.to_string());
            }
            None => debug!(generation, "Open for a stale session ignored"),
        }
    }

    fn play_audio(&self, generation: u64, data: &str, mime_type: &str) {
        if let Some(rate) = parse_pcm_rate(mime_type) {
            if rate != PLAYBACK_SAMPLE_RATE {
                debug!(rate, "Inbound audio rate differs from playback rate");
            }
        }
        let buffer = match decode_audio(data, PLAYBACK_SAMPLE_RATE, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(generation, error = %e, "Dropping undecodable audio payload");
                return;
            }
        };
        self.with_session(generation, |s| {
            if let Err(e) = s.scheduler.enqueue(&buffer) {
                warn!(generation, error = %e, "Failed to schedule audio");
            }
        });
    }
}

/// Capture blocks → analyser → framer → channel.
async fn pump_capture(
    mut blocks: mpsc::UnboundedReceiver<Vec<f32>>,
    analyser: Arc<Analyser>,
    sender: LiveSender,
    cancel: CancellationToken,
) {
    loop {
        let block = tokio::select! {
            _ = cancel.cancelled() => break,
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };
        analyser.push(&block);
        if let Err(e) = sender.send_audio(encode_block(&block, CAPTURE_SAMPLE_RATE)) {
            debug!(error = %e, "Capture pump stopping");
            break;
        }
    }
}

/// Inbound channel events, handled strictly in arrival order.
async fn pump_events(
    inner: Weak<Inner>,
    generation: u64,
    cancel: CancellationToken,
    mut events: mpsc::Receiver<ChannelEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event.unwrap_or(ChannelEvent::Closed),
        };
        let Some(manager) = inner.upgrade() else {
            break;
        };
        if !manager.is_current(generation) {
            break;
        }
        let last = matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_));
        manager.handle_event(generation, event);
        if last {
            break;
        }
    }
    debug!(generation, "Event pump exited");
}

/// Entry point for hosts: start, stop, and observe live sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        backend: Arc<dyn AudioBackend>,
        settings: SessionSettings,
    ) -> Self {
        let (view, _) = watch::channel(SessionView::default());
        Self {
            inner: Arc::new(Inner {
                connector,
                backend,
                settings,
                session: Mutex::new(None),
                view,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start a session for `agent`. Any running session is stopped first.
    ///
    /// Returns once the connection is established; the session becomes
    /// active when the remote side confirms the setup.
    pub async fn start(&self, agent: &AgentConfig, files: &[KnowledgeFile]) -> Result<()> {
        let inner = &self.inner;
        inner.stop_session(None);
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        inner.publish(|v| {
            *v = SessionView {
                state: SessionState::Starting,
                ..SessionView::default()
            };
        });
        info!(
            generation,
            agent = %agent.name,
            voice = %agent.voice,
            files = files.len(),
            "Starting live session"
        );

        let devices = inner
            .backend
            .open_capture(CAPTURE_SAMPLE_RATE, inner.settings.capture_block_size)
            .and_then(|capture| {
                let playback = inner.backend.open_playback(PLAYBACK_SAMPLE_RATE)?;
                Ok((capture, playback))
            });
        let (capture, playback) = match devices {
            Ok(devices) => devices,
            Err(e) => {
                error!(generation, error = %e, "Failed to open audio devices");
                if inner.is_current(generation) {
                    inner.publish(|v| {
                        v.state = SessionState::Idle;
                        v.error = Some(e.to_string());
                    });
                }
                return Err(e);
            }
        };

        {
            let mut guard = inner.lock();
            if !inner.is_current(generation) {
                playback.close();
                return Err(VoxError::Cancelled);
            }
            *guard = Some(Session::new(generation, capture, playback));
        }

        let request = ConnectRequest {
            model: inner.settings.model.clone(),
            voice: agent.voice,
            system_instruction: compose_system_instruction(&agent.system_instruction, files),
            response_modality: ResponseModality::Audio,
            input_transcription: true,
            output_transcription: true,
        };

        let LiveConnection { sender, events } = match inner.connector.connect(request).await {
            Ok(connection) => connection,
            Err(e) if !inner.is_current(generation) => {
                debug!(generation, error = %e, "Connect failed after stop");
                return Err(VoxError::Cancelled);
            }
            Err(e) => {
                let e = match e {
                    VoxError::ChannelOpen(_) => e,
                    other => VoxError::ChannelOpen(other.to_string()),
                };
                error!(generation, error = %e, "Failed to open live channel");
                inner.fail(generation, format!("{SESSION_ERROR_MESSAGE} ({e})"));
                return Err(e);
            }
        };

        let cancel = inner.with_session(generation, |session| {
            session.sender = Some(sender.clone());
            session.cancel.clone()
        });
        let Some(cancel) = cancel else {
            sender.close();
            info!(generation, "Session stopped while connecting");
            return Err(VoxError::Cancelled);
        };

        tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            generation,
            cancel,
            events,
        ));
        Ok(())
    }

    /// Stop the current session, if any. Safe to call from any state, any
    /// number of times.
    pub fn stop(&self) {
        self.inner.stop_session(None);
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> SessionView {
        self.inner.view.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.view.borrow().state
    }

    /// Whether a volume monitor is currently running.
    pub fn is_monitoring(&self) -> bool {
        self.inner
            .lock()
            .as_ref()
            .and_then(|s| s.monitor.as_ref())
            .is_some_and(VolumeMonitor::is_running)
    }

    /// Send a typed user turn on the active session.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| VoxError::ChannelRuntime("no active session".into()))?;
        let sender = session
            .sender
            .as_ref()
            .ok_or_else(|| VoxError::ChannelRuntime("session is not connected".into()))?;
        sender.send_text(text)?;
        session.transcript.append_input(text);
        let live = session.transcript.live_input().to_string();
        self.inner.publish(|v| v.live_input_text = live);
        Ok(())
    }
}
