//! Single-track playback controller
//!
//! Sole owner of [`PlaybackState`]. Every mutation goes through one of the
//! methods below and is published on a watch channel; everyone else only
//! reads. Failures are never returned: they land in
//! [`PlaybackState::last_error`] with `is_playing` forced off.
//!
//! Loading is split in two so decoding can happen off the engine task:
//! [`PlaybackController::play`] hands back a [`LoadRequest`] and the result
//! comes back through [`PlaybackController::complete_load`]. Each request
//! carries a generation; completions from older generations are dropped.

use std::sync::Arc;
use tokio::sync::watch;

use crate::audio::backend::{DeviceEventSender, VoiceId};
use crate::audio::buffer::PcmBuffer;
use crate::audio::guard::{ResourceBundle, ResourceGuard, ResourceRequest};
use crate::error::{Error, ErrorKind};
use crate::protocol::{PlaybackState, Track};

/// A track that needs fetching and decoding
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub generation: u64,
    pub track: Track,
}

/// The active track played to its natural end
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEnded {
    pub track: Track,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveVoice {
    id: VoiceId,
    /// Output clock when the voice started
    started_at: f64,
    /// Track position the voice started from
    offset: f64,
}

pub struct PlaybackController {
    guard: ResourceGuard,
    events: DeviceEventSender,
    state: watch::Sender<PlaybackState>,
    generation: u64,
    loading: bool,
    bundle: Option<ResourceBundle>,
    buffer: Option<Arc<PcmBuffer>>,
    voice: Option<ActiveVoice>,
    last_track: Option<Track>,
}

impl PlaybackController {
    pub fn new(guard: ResourceGuard, events: DeviceEventSender) -> Self {
        let (state, _) = watch::channel(PlaybackState::default());
        Self {
            guard,
            events,
            state,
            generation: 0,
            loading: false,
            bundle: None,
            buffer: None,
            voice: None,
            last_track: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PlaybackState {
        self.state.borrow().clone()
    }

    /// Generation of the most recent load
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn holds_output(&self) -> bool {
        self.bundle.is_some()
    }

    /// Play `track`. The same source, merely paused (or still loading),
    /// continues in place; anything else, including the same source while
    /// it is playing, starts over from position 0.
    pub fn play(&mut self, track: Track) -> Option<LoadRequest> {
        let in_place = {
            let state = self.state.borrow();
            let paused = self.buffer.is_some() && !state.is_playing;
            state.last_error.is_none()
                && (paused || self.loading)
                && state.active_track.as_ref().is_some_and(|t| t.same_source(&track))
        };
        if in_place {
            self.resume();
            return None;
        }
        Some(self.load(track))
    }

    /// Tear down whatever is active and start `track` from position 0
    pub fn load(&mut self, track: Track) -> LoadRequest {
        self.teardown();
        self.generation += 1;
        self.loading = true;
        self.last_track = Some(track.clone());

        tracing::info!("Loading {} (generation {})", track.locator, self.generation);
        self.state.send_replace(PlaybackState {
            active_track: Some(track.clone()),
            is_playing: true,
            position_seconds: 0.0,
            duration_seconds: 0.0,
            last_error: None,
        });

        LoadRequest {
            generation: self.generation,
            track,
        }
    }

    /// Deliver the outcome of a [`LoadRequest`]
    pub fn complete_load(&mut self, generation: u64, result: Result<PcmBuffer, Error>) {
        if generation != self.generation || !self.loading {
            tracing::debug!("Dropping stale load (generation {})", generation);
            return;
        }
        self.loading = false;

        let buffer = match result {
            Ok(buffer) if !buffer.is_empty() => buffer,
            Ok(_) => return self.fail(ErrorKind::PlaybackFailed("track contains no audio".into())),
            Err(e) => {
                tracing::warn!("Track failed to load: {}", e);
                return self.fail(ErrorKind::PlaybackFailed(e.to_string()));
            }
        };

        let duration = buffer.duration();
        self.buffer = Some(Arc::new(buffer));

        let (playing, position) = {
            let state = self.state.borrow();
            (state.is_playing, state.position_seconds.min(duration))
        };
        if playing && !self.start_voice(position) {
            return;
        }
        self.state.send_modify(|s| {
            s.duration_seconds = duration;
            s.position_seconds = position;
        });
    }

    pub fn pause(&mut self) {
        let position = self.position_now();
        let playing = {
            let state = self.state.borrow();
            state.active_track.is_some() && state.is_playing
        };
        if !playing {
            return;
        }
        self.stop_voice();
        self.state.send_modify(|s| {
            s.is_playing = false;
            s.position_seconds = position;
        });
        tracing::debug!("Paused at {:.2}s", position);
    }

    /// Continue from the stored position. At or past the end the track
    /// starts over.
    pub fn resume(&mut self) {
        let (position, duration) = {
            let state = self.state.borrow();
            if state.active_track.is_none() || state.is_playing || state.last_error.is_some() {
                return;
            }
            (state.position_seconds, state.duration_seconds)
        };
        let position = if duration > 0.0 && position >= duration {
            0.0
        } else {
            position
        };

        if self.buffer.is_some() && !self.start_voice(position) {
            return;
        }
        self.state.send_modify(|s| {
            s.is_playing = true;
            s.position_seconds = position;
        });
    }

    /// Jump to `seconds`, clamped into `[0, duration]`. Ignored while an
    /// error is pending or nothing is active.
    pub fn seek(&mut self, seconds: f64) {
        if seconds.is_nan() {
            return;
        }
        let (playing, duration) = {
            let state = self.state.borrow();
            if state.active_track.is_none() || state.last_error.is_some() {
                return;
            }
            (state.is_playing, state.duration_seconds)
        };
        let target = seconds.clamp(0.0, duration);

        if playing && self.buffer.is_some() {
            self.stop_voice();
            if !self.start_voice(target) {
                return;
            }
        }
        self.state.send_modify(|s| s.position_seconds = target);
    }

    /// Discard the active track and reset to the empty state. Idempotent.
    pub fn stop(&mut self) {
        self.teardown();
        self.generation += 1;
        self.loading = false;
        self.last_track = None;
        let changed = self.state.send_if_modified(|s| {
            if *s == PlaybackState::default() {
                return false;
            }
            *s = PlaybackState::default();
            true
        });
        if changed {
            tracing::info!("Playback stopped");
        }
    }

    /// Clear the error and play the last-known track again
    pub fn retry(&mut self) -> Option<LoadRequest> {
        let track = self.last_track.clone()?;
        self.state.send_modify(|s| s.last_error = None);
        tracing::info!("Retrying {}", track.locator);
        self.play(track)
    }

    /// Refresh the position from the output clock
    pub fn tick(&mut self) {
        if self.voice.is_none() {
            return;
        }
        let position = self.position_now();
        self.state.send_if_modified(|s| {
            if !s.is_playing || s.position_seconds == position {
                return false;
            }
            s.position_seconds = position;
            true
        });
    }

    /// A voice finished on its own. Only the active voice counts, and only
    /// once: the voice is forgotten as soon as it is reported.
    pub fn on_voice_ended(&mut self, voice: VoiceId) -> Option<TrackEnded> {
        if self.voice.map(|v| v.id) != Some(voice) {
            return None;
        }
        self.voice = None;
        self.release_output();

        let mut ended = None;
        self.state.send_modify(|s| {
            s.is_playing = false;
            s.position_seconds = s.duration_seconds;
            ended = s.active_track.clone();
        });
        let track = ended?;
        tracing::info!("{} ended", track.locator);
        Some(TrackEnded {
            track,
            generation: self.generation,
        })
    }

    pub fn on_output_failed(&mut self, message: &str) {
        if self.bundle.is_none() {
            return;
        }
        tracing::error!("Output failed during playback: {}", message);
        self.fail(ErrorKind::PlaybackFailed(message.to_string()));
    }

    /// Start the loaded buffer at `offset`. On failure the error is
    /// recorded and false is returned.
    fn start_voice(&mut self, offset: f64) -> bool {
        let Some(buffer) = self.buffer.clone() else {
            return false;
        };

        if self.bundle.is_none() {
            match self.guard.acquire(ResourceRequest::Output, self.events.clone()) {
                Ok(bundle) => self.bundle = Some(bundle),
                Err(e) => {
                    self.fail(ErrorKind::from(&e));
                    return false;
                }
            }
        }
        let Some(output) = self.bundle.as_mut().and_then(|b| b.output_mut()) else {
            self.fail(ErrorKind::PlaybackFailed("output unavailable".into()));
            return false;
        };

        let now = output.current_time();
        match output.start_voice(buffer, now, offset) {
            Ok(id) => {
                self.voice = Some(ActiveVoice {
                    id,
                    started_at: now,
                    offset,
                });
                true
            }
            Err(e) => {
                self.fail(ErrorKind::PlaybackFailed(e.to_string()));
                false
            }
        }
    }

    fn stop_voice(&mut self) {
        if let Some(voice) = self.voice.take() {
            if let Some(output) = self.bundle.as_mut().and_then(|b| b.output_mut()) {
                output.stop_voice(voice.id);
            }
        }
    }

    fn release_output(&mut self) {
        if let Some(mut bundle) = self.bundle.take() {
            bundle.release();
        }
    }

    fn teardown(&mut self) {
        self.stop_voice();
        self.release_output();
        self.buffer = None;
    }

    fn fail(&mut self, kind: ErrorKind) {
        let position = self.position_now();
        self.teardown();
        self.loading = false;
        tracing::warn!("Playback error: {}", kind);
        self.state.send_modify(|s| {
            s.is_playing = false;
            if s.active_track.is_some() {
                s.position_seconds = position;
            }
            s.last_error = Some(kind);
        });
    }

    fn position_now(&self) -> f64 {
        let state = self.state.borrow();
        let output = self.bundle.as_ref().and_then(|b| b.output());
        let (Some(voice), Some(output)) = (self.voice, output) else {
            return state.position_seconds;
        };
        let elapsed = (output.current_time() - voice.started_at).max(0.0);
        (voice.offset + elapsed).min(state.duration_seconds)
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::{device_channel, DeviceEvent, DeviceEventReceiver};
    use crate::audio::virtual_device::VirtualBackend;
    use crate::config::CaptureConfig;
    use crate::error::CodecError;

    fn setup() -> (VirtualBackend, PlaybackController, DeviceEventReceiver) {
        let backend = VirtualBackend::new();
        let guard = ResourceGuard::new(Arc::new(backend.clone()), CaptureConfig::default());
        let (tx, rx) = device_channel();
        (backend, PlaybackController::new(guard, tx), rx)
    }

    fn loaded(controller: &mut PlaybackController, track: &str, seconds: f64) {
        let request = controller.play(Track::file(track)).unwrap();
        controller.complete_load(request.generation, Ok(PcmBuffer::silence(seconds, 24000, 1)));
    }

    fn ended_voice(rx: &mut DeviceEventReceiver) -> VoiceId {
        match rx.try_recv().unwrap() {
            DeviceEvent::VoiceEnded(voice) => voice,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_play_loads_then_starts() {
        let (backend, mut controller, _rx) = setup();
        let request = controller.play(Track::file("a.mp3")).unwrap();
        assert_eq!(request.generation, 1);

        let state = controller.state();
        assert!(state.is_playing);
        assert_eq!(state.duration_seconds, 0.0);
        assert_eq!(backend.live_outputs(), 0);

        controller.complete_load(1, Ok(PcmBuffer::silence(2.0, 24000, 1)));
        let state = controller.state();
        assert_eq!(state.duration_seconds, 2.0);
        assert_eq!(backend.active_voices().len(), 1);
        assert!(controller.holds_output());
    }

    #[test]
    fn test_stale_load_is_dropped() {
        let (backend, mut controller, _rx) = setup();
        let first = controller.play(Track::file("a.mp3")).unwrap();
        let second = controller.play(Track::file("b.mp3")).unwrap();

        controller.complete_load(first.generation, Ok(PcmBuffer::silence(1.0, 24000, 1)));
        assert!(backend.active_voices().is_empty());
        assert_eq!(controller.state().duration_seconds, 0.0);

        controller.complete_load(second.generation, Ok(PcmBuffer::silence(3.0, 24000, 1)));
        assert_eq!(controller.state().duration_seconds, 3.0);
        assert_eq!(controller.state().active_track, Some(Track::file("b.mp3")));
    }

    #[test]
    fn test_seek_clamps() {
        let (_backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 10.0);

        controller.seek(-5.0);
        assert_eq!(controller.state().position_seconds, 0.0);
        controller.seek(42.0);
        assert_eq!(controller.state().position_seconds, 10.0);
        controller.seek(4.5);
        assert_eq!(controller.state().position_seconds, 4.5);
    }

    #[test]
    fn test_seek_restarts_voice_at_offset() {
        let (backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 10.0);
        controller.seek(6.0);

        let voices = backend.active_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].offset, 6.0);
        assert!((voices[0].end - voices[0].start - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_seek_ignored_while_failed() {
        let (_backend, mut controller, _rx) = setup();
        let request = controller.play(Track::file("a.mp3")).unwrap();
        controller.complete_load(
            request.generation,
            Err(CodecError::DecodeFailed("bad header".into()).into()),
        );
        controller.seek(3.0);
        let state = controller.state();
        assert_eq!(state.position_seconds, 0.0);
        assert!(!state.is_playing);
        assert!(matches!(state.last_error, Some(ErrorKind::PlaybackFailed(_))));
    }

    #[test]
    fn test_pause_resume_keeps_position() {
        let (backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 5.0);

        backend.advance(1.5);
        controller.pause();
        let state = controller.state();
        assert!(!state.is_playing);
        assert!((state.position_seconds - 1.5).abs() < 1e-9);
        assert!(backend.active_voices().is_empty());

        backend.advance(10.0);
        controller.resume();
        let state = controller.state();
        assert!(state.is_playing);
        assert!((state.position_seconds - 1.5).abs() < 1e-9);
        assert_eq!(backend.active_voices()[0].offset, 1.5);
    }

    #[test]
    fn test_play_same_track_resumes_in_place() {
        let (backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 5.0);
        backend.advance(2.0);
        controller.pause();

        let relabelled = Track::new(
            "a.mp3",
            "relabelled",
            crate::protocol::TrackEncoding::ContainerFile,
        );
        assert!(controller.play(relabelled).is_none());
        let state = controller.state();
        assert!(state.is_playing);
        assert!((state.position_seconds - 2.0).abs() < 1e-9);
        assert_eq!(controller.generation(), 1);
    }

    #[test]
    fn test_play_same_track_while_playing_restarts() {
        let (backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 5.0);
        backend.advance(2.0);

        let request = controller.play(Track::file("a.mp3")).unwrap();
        assert_eq!(request.generation, 2);
        let state = controller.state();
        assert!(state.is_playing);
        assert_eq!(state.position_seconds, 0.0);
        assert!(backend.active_voices().is_empty());

        controller.complete_load(request.generation, Ok(PcmBuffer::silence(5.0, 24000, 1)));
        let voices = backend.active_voices();
        assert_eq!(voices.len(), 1);
        assert_eq!(voices[0].offset, 0.0);
    }

    #[test]
    fn test_play_same_track_while_loading_keeps_load() {
        let (_backend, mut controller, _rx) = setup();
        let request = controller.play(Track::file("a.mp3")).unwrap();
        assert!(controller.play(Track::file("a.mp3")).is_none());
        assert_eq!(controller.generation(), request.generation);
    }

    #[test]
    fn test_natural_end_fires_once() {
        let (backend, mut controller, mut rx) = setup();
        loaded(&mut controller, "a.mp3", 1.0);

        backend.advance(1.0);
        let voice = ended_voice(&mut rx);
        let ended = controller.on_voice_ended(voice).unwrap();
        assert_eq!(ended.track, Track::file("a.mp3"));
        assert!(controller.on_voice_ended(voice).is_none());

        let state = controller.state();
        assert!(!state.is_playing);
        assert_eq!(state.position_seconds, 1.0);
        assert_eq!(backend.live_outputs(), 0);
    }

    #[test]
    fn test_stopped_voice_never_reports_end() {
        let (backend, mut controller, mut rx) = setup();
        loaded(&mut controller, "a.mp3", 1.0);
        controller.pause();
        backend.advance(5.0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_resume_at_end_restarts() {
        let (backend, mut controller, mut rx) = setup();
        loaded(&mut controller, "a.mp3", 1.0);
        backend.advance(1.0);
        let voice = ended_voice(&mut rx);
        controller.on_voice_ended(voice);

        controller.resume();
        let state = controller.state();
        assert!(state.is_playing);
        assert_eq!(state.position_seconds, 0.0);
        assert_eq!(backend.active_voices()[0].offset, 0.0);
    }

    #[test]
    fn test_stop_resets_and_releases() {
        let (backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 3.0);
        controller.stop();
        controller.stop();

        assert_eq!(controller.state(), PlaybackState::default());
        assert_eq!(backend.live_outputs(), 0);
        assert!(controller.retry().is_none());

        loaded(&mut controller, "b.mp3", 3.0);
        assert_eq!(backend.live_outputs(), 1);
    }

    #[test]
    fn test_output_failure_then_retry() {
        let (backend, mut controller, _rx) = setup();
        backend.reject_voices(Some("device gone"));
        loaded(&mut controller, "a.mp3", 3.0);

        let state = controller.state();
        assert!(!state.is_playing);
        assert!(matches!(state.last_error, Some(ErrorKind::PlaybackFailed(_))));
        assert_eq!(backend.live_outputs(), 0);

        backend.reject_voices(None);
        let request = controller.retry().unwrap();
        assert_eq!(request.track, Track::file("a.mp3"));
        assert!(controller.state().last_error.is_none());
        controller.complete_load(request.generation, Ok(PcmBuffer::silence(3.0, 24000, 1)));
        assert!(controller.state().is_playing);
        assert_eq!(backend.active_voices().len(), 1);
    }

    #[test]
    fn test_busy_output_is_resource_unavailable() {
        let (backend, mut controller, _rx) = setup();
        backend.deny_output("in use by another app");
        loaded(&mut controller, "a.mp3", 1.0);
        assert!(matches!(
            controller.state().last_error,
            Some(ErrorKind::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_tick_tracks_clock() {
        let (backend, mut controller, _rx) = setup();
        loaded(&mut controller, "a.mp3", 4.0);
        let mut rx = controller.subscribe();
        rx.borrow_and_update();

        backend.advance(0.25);
        controller.tick();
        assert!(rx.has_changed().unwrap());
        assert!((rx.borrow_and_update().position_seconds - 0.25).abs() < 1e-9);

        controller.tick();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_device_failure_mid_track() {
        let (backend, mut controller, mut rx) = setup();
        loaded(&mut controller, "a.mp3", 4.0);
        backend.advance(1.0);
        backend.fail_output("unplugged");
        match rx.try_recv().unwrap() {
            DeviceEvent::OutputFailed(msg) => controller.on_output_failed(&msg),
            other => panic!("unexpected event {:?}", other),
        }
        let state = controller.state();
        assert!(!state.is_playing);
        assert!((state.position_seconds - 1.0).abs() < 1e-9);
        assert_eq!(state.last_error, Some(ErrorKind::PlaybackFailed("unplugged".into())));
        assert!(state.is_consistent());
    }
}
