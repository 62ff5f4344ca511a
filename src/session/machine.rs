//! Live session state machine
//!
//! ```text
//!  Idle ──start──▶ Connecting ──opened──▶ Listening ──user_stop──▶ Analyzing ──closed──▶ Idle
//!                                          │  ▲                       │
//!                              server_audio│  │drained      server_audio│
//!                                          ▼  │                       ▼
//!                                         Speaking ◀───────────────────┘
//!
//!  any live state ──remote_error / unexpected close / device failure──▶ Error
//!  Error ──acknowledge──▶ Idle
//! ```
//!
//! The session owns its [`ResourceBundle`] for as long as it is live and
//! releases it on every path back to `Idle` or `Error`.

use std::sync::Arc;
use uuid::Uuid;

use crate::audio::backend::{DeviceEventSender, VoiceId};
use crate::audio::buffer::PcmBuffer;
use crate::audio::guard::{ResourceBundle, ResourceGuard, ResourceRequest};
use crate::codec::ChunkDecoder;
use crate::config::{CaptureConfig, StreamConfig};
use crate::error::{AudioError, ErrorKind};
use crate::protocol::{InlineAudio, SessionSnapshot, SessionState};
use crate::session::capture::{CapturePipeline, FrameSink};
use crate::session::scheduler::{GaplessScheduler, VoiceOutcome};

/// Called whenever the remote's reply has finished playing
pub type TurnSink = Box<dyn FnMut() + Send>;

pub struct StreamingSession {
    id: Uuid,
    state: SessionState,
    error: Option<ErrorKind>,
    capture_config: CaptureConfig,
    decoder: ChunkDecoder,
    scheduler: GaplessScheduler,
    bundle: Option<ResourceBundle>,
    capture: Option<CapturePipeline>,
    /// Chunks that arrived before the handshake completed
    early_chunks: Vec<Arc<PcmBuffer>>,
    user_stopped: bool,
    frames_sent: u64,
    on_frame: FrameSink,
    on_turn_complete: TurnSink,
}

impl StreamingSession {
    pub fn new(
        id: Uuid,
        capture: &CaptureConfig,
        stream: &StreamConfig,
        on_frame: FrameSink,
        on_turn_complete: TurnSink,
    ) -> Self {
        Self {
            id,
            state: SessionState::Idle,
            error: None,
            capture_config: capture.clone(),
            decoder: ChunkDecoder::new(stream),
            scheduler: GaplessScheduler::new(),
            bundle: None,
            capture: None,
            early_chunks: Vec::new(),
            user_stopped: false,
            frames_sent: 0,
            on_frame,
            on_turn_complete,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn error(&self) -> Option<&ErrorKind> {
        self.error.as_ref()
    }

    pub fn holds_resources(&self) -> bool {
        self.bundle.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: Some(self.id),
            state: self.state,
            error: self.error.clone(),
            frames_sent: self.frames_sent,
            chunks_scheduled: self.scheduler.chunks_scheduled(),
            chunks_dropped: self.decoder.chunks_dropped(),
        }
    }

    /// Acquire the microphone and output and wait for the remote handshake
    pub fn start(&mut self, guard: &ResourceGuard, events: DeviceEventSender) {
        if self.state != SessionState::Idle {
            tracing::debug!("Session {} already started", self.id);
            return;
        }

        let bundle = match guard.acquire(ResourceRequest::Duplex, events) {
            Ok(bundle) => bundle,
            Err(e) => return self.fail(ErrorKind::from(&e)),
        };
        let pipeline = match bundle.input() {
            Some(input) => CapturePipeline::new(input, self.capture_config.target_sample_rate),
            None => return self.fail(ErrorKind::ResourceUnavailable("no capture device".into())),
        };
        match pipeline {
            Ok(pipeline) => {
                self.bundle = Some(bundle);
                self.capture = Some(pipeline);
                self.error = None;
                self.user_stopped = false;
                self.transition(SessionState::Connecting);
            }
            Err(e) => self.fail(ErrorKind::ResourceUnavailable(e.to_string())),
        }
    }

    /// Remote handshake completed
    pub fn opened(&mut self) {
        if self.state != SessionState::Connecting {
            tracing::debug!("Ignoring open in {}", self.state);
            return;
        }
        self.transition(SessionState::Listening);

        let early = std::mem::take(&mut self.early_chunks);
        if !early.is_empty() {
            tracing::debug!("Scheduling {} chunks received while connecting", early.len());
        }
        for chunk in early {
            self.accept_chunk(chunk);
        }
    }

    /// Base64 PCM16 chunk at the stream rate
    pub fn server_audio(&mut self, data: &str) {
        match self.decoder.decode_base64(data) {
            Ok(pcm) => self.accept_chunk(Arc::new(pcm)),
            Err(e) => tracing::warn!("Dropping chunk: {}", e),
        }
    }

    /// Inline blob carrying its own mime type
    pub fn server_inline(&mut self, blob: &InlineAudio) {
        match self.decoder.decode_inline(blob) {
            Ok(pcm) => self.accept_chunk(Arc::new(pcm)),
            Err(e) => tracing::warn!("Dropping inline chunk: {}", e),
        }
    }

    fn accept_chunk(&mut self, chunk: Arc<PcmBuffer>) {
        match self.state {
            SessionState::Connecting => self.early_chunks.push(chunk),
            SessionState::Listening | SessionState::Analyzing | SessionState::Speaking => {
                let Some(output) = self.bundle.as_mut().and_then(|b| b.output_mut()) else {
                    return self.fail(ErrorKind::PlaybackFailed("output unavailable".into()));
                };
                match self.scheduler.schedule(output, chunk) {
                    Ok(_) => {
                        if self.state != SessionState::Speaking {
                            self.transition(SessionState::Speaking);
                        }
                    }
                    Err(e) => self.fail(ErrorKind::from(&playback_failed(e))),
                }
            }
            SessionState::Idle | SessionState::Error => {
                tracing::debug!("Dropping chunk in {}", self.state);
            }
        }
    }

    /// Returns true when the voice belonged to this session
    pub fn voice_ended(&mut self, voice: VoiceId) -> bool {
        match self.scheduler.on_voice_ended(voice) {
            VoiceOutcome::Unknown => false,
            VoiceOutcome::Pending => true,
            VoiceOutcome::Drained => {
                if self.state == SessionState::Speaking {
                    let next = if self.user_stopped {
                        SessionState::Analyzing
                    } else {
                        SessionState::Listening
                    };
                    self.transition(next);
                    (self.on_turn_complete)();
                }
                true
            }
        }
    }

    /// The user is done talking: capture stops, output stays until the
    /// remote closes.
    pub fn user_stop(&mut self) {
        match self.state {
            SessionState::Listening | SessionState::Speaking => {
                self.capture = None;
                if let Some(bundle) = self.bundle.as_mut() {
                    bundle.release_input();
                }
                self.user_stopped = true;
                if self.state == SessionState::Listening {
                    self.transition(SessionState::Analyzing);
                }
            }
            _ => tracing::debug!("Ignoring user stop in {}", self.state),
        }
    }

    /// The remote closed the session
    pub fn closed(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Error => {}
            _ if self.user_stopped => {
                self.teardown();
                self.transition(SessionState::Idle);
            }
            _ => self.fail(ErrorKind::TransportClosed("remote closed the session".into())),
        }
    }

    pub fn remote_error(&mut self, message: &str) {
        if self.state.is_live() {
            self.fail(ErrorKind::TransportClosed(message.to_string()));
        }
    }

    pub fn output_failed(&mut self, message: &str) {
        if self.state.is_live() && self.bundle.is_some() {
            self.fail(ErrorKind::PlaybackFailed(message.to_string()));
        }
    }

    pub fn capture_failed(&mut self, message: &str) {
        if self.state.is_live() && self.capture.is_some() {
            self.fail(ErrorKind::ResourceUnavailable(message.to_string()));
        }
    }

    /// Leave the error state
    pub fn acknowledge(&mut self) {
        if self.state == SessionState::Error {
            self.error = None;
            self.transition(SessionState::Idle);
        }
    }

    /// Release everything and go idle, from any state
    pub fn shutdown(&mut self) {
        self.teardown();
        self.error = None;
        if self.state != SessionState::Idle {
            self.transition(SessionState::Idle);
        }
    }

    /// Send captured audio while listening; otherwise drop it
    pub fn pump_capture(&mut self) -> usize {
        let Some(capture) = self.capture.as_mut() else {
            return 0;
        };
        if self.state != SessionState::Listening {
            let dropped = capture.discard();
            if dropped > 0 {
                tracing::trace!("Discarded {} blocks in {}", dropped, self.state);
            }
            return 0;
        }
        let sent = capture.pump(&mut *self.on_frame);
        self.frames_sent += sent as u64;
        sent
    }

    fn fail(&mut self, kind: ErrorKind) {
        tracing::error!("Session {} failed: {}", self.id, kind);
        self.teardown();
        self.error = Some(kind);
        self.transition(SessionState::Error);
    }

    fn teardown(&mut self) {
        match self.bundle.as_mut().and_then(|b| b.output_mut()) {
            Some(output) => self.scheduler.cancel_all(Some(output)),
            None => self.scheduler.cancel_all(None),
        }
        self.capture = None;
        self.early_chunks.clear();
        if let Some(mut bundle) = self.bundle.take() {
            bundle.release();
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::info!("Session {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn playback_failed(err: AudioError) -> AudioError {
    match err {
        AudioError::PlaybackFailed(_) => err,
        other => AudioError::PlaybackFailed(other.to_string()),
    }
}
