//! Engine actor and its handles
//!
//! One task owns the playback controller, the queue, the live session and
//! the resource guard. Handle calls, device events and finished loads all
//! arrive as messages and are applied one at a time, so state is never
//! mutated from two places at once.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::audio::backend::{
    device_channel, AudioBackend, DeviceEvent, DeviceEventReceiver, DeviceEventSender,
};
use crate::audio::buffer::PcmBuffer;
use crate::audio::guard::ResourceGuard;
use crate::config::EngineConfig;
use crate::error::{Error, Result, SessionError};
use crate::playback::{
    load_track, LoadRequest, PlaybackController, QueueOrchestrator, QueueTransition, TrackLoader,
};
use crate::protocol::{InlineAudio, PlaybackState, QueueSnapshot, SessionSnapshot, Track};
use crate::session::{FrameSink, StreamingSession, TurnSink};

/// Inputs the remote transport feeds into a live session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Opened,
    ServerAudio(String),
    ServerInline(InlineAudio),
    Closed,
    RemoteError(String),
    Acknowledge,
    UserStop,
}

enum Command {
    PlaySingle(Track),
    Pause,
    Resume,
    Stop,
    Seek(f64),
    Retry,
    StartQueue {
        tracks: Vec<Track>,
        start_index: Option<usize>,
    },
    StopQueue,
    Next,
    Previous,
    StartSession {
        id: Uuid,
        on_frame: FrameSink,
        on_turn_complete: TurnSink,
    },
    StopSession(Uuid),
    Session(Uuid, SessionCommand),
    Shutdown,
}

struct LoadCompletion {
    generation: u64,
    result: Result<PcmBuffer>,
}

pub struct AudioEngine {
    config: EngineConfig,
    loader: Arc<dyn TrackLoader>,
    guard: ResourceGuard,
    controller: PlaybackController,
    queue: QueueOrchestrator,
    session: Option<StreamingSession>,
    session_tx: watch::Sender<SessionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: DeviceEventSender,
    events: DeviceEventReceiver,
    loads_tx: mpsc::UnboundedSender<LoadCompletion>,
    loads: mpsc::UnboundedReceiver<LoadCompletion>,
}

impl AudioEngine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn AudioBackend>,
        loader: Arc<dyn TrackLoader>,
    ) -> (AudioEngine, EngineHandle) {
        let guard = ResourceGuard::new(backend, config.capture.clone());
        let (events_tx, events) = device_channel();
        let controller = PlaybackController::new(guard.clone(), events_tx.clone());
        let queue = QueueOrchestrator::new(controller.subscribe());
        let (session_tx, session_rx) = watch::channel(SessionSnapshot::default());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (loads_tx, loads) = mpsc::unbounded_channel();

        let handle = EngineHandle {
            commands: commands_tx,
            playback: controller.subscribe(),
            queue: queue.subscribe(),
            session: session_rx,
        };
        let engine = AudioEngine {
            config,
            loader,
            guard,
            controller,
            queue,
            session: None,
            session_tx,
            commands,
            events_tx,
            events,
            loads_tx,
            loads,
        };
        (engine, handle)
    }

    /// Run on the current tokio runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process messages until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let mut position = tokio::time::interval(Duration::from_millis(
            self.config.playback.position_interval_ms.max(1),
        ));
        position.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut capture = tokio::time::interval(Duration::from_millis(
            self.config.capture.poll_interval_ms.max(1),
        ));
        capture.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Audio engine running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events.recv() => self.handle_device_event(event),
                Some(done) = self.loads.recv() => {
                    self.controller.complete_load(done.generation, done.result);
                }
                _ = position.tick() => self.controller.tick(),
                _ = capture.tick() => {
                    if let Some(session) = self.session.as_mut() {
                        session.pump_capture();
                    }
                    self.publish_session();
                }
            }
        }

        self.shutdown();
        tracing::info!("Audio engine stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::PlaySingle(track) => {
                self.end_session();
                self.queue.deactivate();
                let request = self.controller.play(track);
                self.spawn_load(request);
            }
            Command::Pause => self.controller.pause(),
            Command::Resume => self.controller.resume(),
            Command::Seek(seconds) => self.controller.seek(seconds),
            Command::Stop => {
                self.queue.deactivate();
                self.controller.stop();
            }
            Command::Retry => {
                let request = if self.queue.is_active() {
                    self.queue.retry(&mut self.controller)
                } else {
                    self.controller.retry()
                };
                self.spawn_load(request);
            }
            Command::StartQueue { tracks, start_index } => {
                self.end_session();
                let request = self
                    .queue
                    .start(tracks, start_index.unwrap_or(0), &mut self.controller);
                self.spawn_load(request);
            }
            Command::StopQueue => self.queue.stop(&mut self.controller),
            Command::Next => {
                let request = self.queue.skip_next(&mut self.controller);
                self.spawn_load(request);
            }
            Command::Previous => {
                let request = self.queue.skip_previous(&mut self.controller);
                self.spawn_load(request);
            }
            Command::StartSession {
                id,
                on_frame,
                on_turn_complete,
            } => {
                self.queue.deactivate();
                self.controller.stop();
                self.end_session();

                tracing::info!("Starting session {}", id);
                let mut session = StreamingSession::new(
                    id,
                    &self.config.capture,
                    &self.config.stream,
                    on_frame,
                    on_turn_complete,
                );
                session.start(&self.guard, self.events_tx.clone());
                self.session = Some(session);
            }
            Command::StopSession(id) => {
                if self.session.as_ref().is_some_and(|s| s.id() == id) {
                    self.end_session();
                }
            }
            Command::Session(id, command) => self.handle_session_command(id, command),
            Command::Shutdown => {}
        }
        self.publish_session();
    }

    fn handle_session_command(&mut self, id: Uuid, command: SessionCommand) {
        let Some(session) = self.session.as_mut().filter(|s| s.id() == id) else {
            tracing::debug!("Ignoring {:?} for inactive session {}", command, id);
            return;
        };
        match command {
            SessionCommand::Opened => session.opened(),
            SessionCommand::ServerAudio(data) => session.server_audio(&data),
            SessionCommand::ServerInline(blob) => session.server_inline(&blob),
            SessionCommand::Closed => session.closed(),
            SessionCommand::RemoteError(message) => session.remote_error(&message),
            SessionCommand::Acknowledge => session.acknowledge(),
            SessionCommand::UserStop => session.user_stop(),
        }
    }

    fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::VoiceEnded(voice) => {
                if let Some(ended) = self.controller.on_voice_ended(voice) {
                    match self.queue.on_track_ended(&ended, &mut self.controller) {
                        QueueTransition::Advanced { index, load } => {
                            tracing::debug!("Queue advanced to {}", index);
                            self.spawn_load(load);
                        }
                        QueueTransition::Finished => tracing::info!("Queue finished"),
                        QueueTransition::Ignored => {}
                    }
                } else if let Some(session) = self.session.as_mut() {
                    session.voice_ended(voice);
                }
            }
            DeviceEvent::OutputFailed(message) => {
                if self.controller.holds_output() {
                    self.controller.on_output_failed(&message);
                } else if let Some(session) = self.session.as_mut() {
                    session.output_failed(&message);
                }
            }
            DeviceEvent::CaptureFailed(message) => {
                if let Some(session) = self.session.as_mut() {
                    session.capture_failed(&message);
                }
            }
        }
        self.publish_session();
    }

    fn spawn_load(&self, request: Option<LoadRequest>) {
        let Some(LoadRequest { generation, track }) = request else {
            return;
        };
        let loader = self.loader.clone();
        let stream = self.config.stream.clone();
        let done = self.loads_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = load_track(loader.as_ref(), &track, &stream);
            let _ = done.send(LoadCompletion { generation, result });
        });
    }

    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            tracing::info!("Ending session {}", session.id());
            session.shutdown();
            self.session_tx.send_replace(session.snapshot());
        }
    }

    fn publish_session(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let snapshot = session.snapshot();
        self.session_tx.send_if_modified(|s| {
            if *s == snapshot {
                return false;
            }
            *s = snapshot;
            true
        });
    }

    fn shutdown(&mut self) {
        self.end_session();
        self.queue.deactivate();
        self.controller.stop();
    }
}

/// Cloneable front door to a running [`AudioEngine`]
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    playback: watch::Receiver<PlaybackState>,
    queue: watch::Receiver<QueueSnapshot>,
    session: watch::Receiver<SessionSnapshot>,
}

impl EngineHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Session(SessionError::EngineStopped))
    }

    /// Play one track, replacing whatever plays now
    pub fn play_single(&self, track: Track) -> Result<()> {
        self.send(Command::PlaySingle(track))
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub fn seek(&self, seconds: f64) -> Result<()> {
        self.send(Command::Seek(seconds))
    }

    pub fn retry(&self) -> Result<()> {
        self.send(Command::Retry)
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.playback.clone()
    }

    pub fn start_queue(&self, tracks: Vec<Track>, start_index: Option<usize>) -> Result<()> {
        self.send(Command::StartQueue { tracks, start_index })
    }

    pub fn stop_queue(&self) -> Result<()> {
        self.send(Command::StopQueue)
    }

    pub fn next(&self) -> Result<()> {
        self.send(Command::Next)
    }

    pub fn previous(&self) -> Result<()> {
        self.send(Command::Previous)
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<QueueSnapshot> {
        self.queue.clone()
    }

    /// Start a live session. `on_frame` receives every encoded capture
    /// frame; `on_turn_complete` fires each time a reply finishes playing.
    pub fn start_session<F, T>(&self, on_frame: F, on_turn_complete: T) -> Result<SessionHandle>
    where
        F: FnMut(Bytes) + Send + 'static,
        T: FnMut() + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.send(Command::StartSession {
            id,
            on_frame: Box::new(on_frame),
            on_turn_complete: Box::new(on_turn_complete),
        })?;
        Ok(SessionHandle {
            id,
            commands: self.commands.clone(),
            snapshot: self.session.clone(),
        })
    }

    pub fn stop_session(&self, session: &SessionHandle) -> Result<()> {
        self.send(Command::StopSession(session.id))
    }

    pub fn subscribe_session(&self) -> watch::Receiver<SessionSnapshot> {
        self.session.clone()
    }

    /// Stop everything and end the engine task
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

/// What the remote transport drives for one session. Commands for a
/// session that has since been replaced are ignored.
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(Command::Session(self.id, command))
            .map_err(|_| Error::Session(SessionError::EngineStopped))
    }

    /// The remote handshake completed
    pub fn opened(&self) -> Result<()> {
        self.send(SessionCommand::Opened)
    }

    /// A base64 PCM16 chunk arrived
    pub fn server_audio(&self, data: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::ServerAudio(data.into()))
    }

    pub fn server_inline(&self, blob: InlineAudio) -> Result<()> {
        self.send(SessionCommand::ServerInline(blob))
    }

    /// The remote closed the connection
    pub fn closed(&self) -> Result<()> {
        self.send(SessionCommand::Closed)
    }

    pub fn remote_error(&self, message: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::RemoteError(message.into()))
    }

    pub fn acknowledge(&self) -> Result<()> {
        self.send(SessionCommand::Acknowledge)
    }

    pub fn user_stop(&self) -> Result<()> {
        self.send(SessionCommand::UserStop)
    }

    /// Session snapshots. Snapshots of other sessions carry a different
    /// `session_id`.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }
}
