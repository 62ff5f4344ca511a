//! Sequential autoplay queue
//!
//! The queue never owns playback. It delegates tracks to the
//! [`PlaybackController`] and advances only when the controller reports a
//! natural end, at most once per delegated track.

use tokio::sync::watch;

use crate::playback::controller::{LoadRequest, PlaybackController, TrackEnded};
use crate::protocol::{PlaybackState, QueueSnapshot, Track};

/// Fires at most once per armed key
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SingleFlight {
    key: Option<u64>,
    fired: bool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for a new unit of work, forgetting any previous firing
    pub fn arm(&mut self, key: u64) {
        self.key = Some(key);
        self.fired = false;
    }

    pub fn disarm(&mut self) {
        self.key = None;
        self.fired = false;
    }

    /// True the first time it is called with the armed key
    pub fn try_fire(&mut self, key: u64) -> bool {
        if self.key != Some(key) || self.fired {
            return false;
        }
        self.fired = true;
        true
    }

    pub fn is_armed(&self) -> bool {
        self.key.is_some() && !self.fired
    }
}

/// What an end-of-track signal did to the queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueTransition {
    /// Not for us: inactive queue, duplicate signal or a foreign track
    Ignored,
    /// Moved on to `index`
    Advanced {
        index: usize,
        load: Option<LoadRequest>,
    },
    /// The last track ended and the queue stopped
    Finished,
}

pub struct QueueOrchestrator {
    tracks: Vec<Track>,
    current: Option<usize>,
    latch: SingleFlight,
    playback: watch::Receiver<PlaybackState>,
    snapshot: watch::Sender<QueueSnapshot>,
}

impl QueueOrchestrator {
    pub fn new(playback: watch::Receiver<PlaybackState>) -> Self {
        let (snapshot, _) = watch::channel(QueueSnapshot::default());
        Self {
            tracks: Vec::new(),
            current: None,
            latch: SingleFlight::new(),
            playback,
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            tracks: self.tracks.clone(),
            current_index: self.current,
            active: self.current.is_some(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Start at `start_index`, clamped into range. An empty list does
    /// nothing.
    pub fn start(
        &mut self,
        tracks: Vec<Track>,
        start_index: usize,
        controller: &mut PlaybackController,
    ) -> Option<LoadRequest> {
        if tracks.is_empty() {
            tracing::debug!("Ignoring empty queue");
            return None;
        }
        let index = start_index.min(tracks.len() - 1);
        tracing::info!("Queue started with {} tracks at {}", tracks.len(), index);
        self.tracks = tracks;
        Some(self.delegate(index, controller))
    }

    /// Handle the controller's natural end signal
    pub fn on_track_ended(
        &mut self,
        ended: &TrackEnded,
        controller: &mut PlaybackController,
    ) -> QueueTransition {
        let Some(index) = self.current else {
            return QueueTransition::Ignored;
        };
        let ours = self.tracks[index].same_source(&ended.track)
            && self
                .playback
                .borrow()
                .active_track
                .as_ref()
                .is_some_and(|t| t.same_source(&ended.track));
        if !ours || !self.latch.try_fire(ended.generation) {
            tracing::debug!("Ignoring end of {}", ended.track.locator);
            return QueueTransition::Ignored;
        }

        let next = index + 1;
        if next >= self.tracks.len() {
            self.stop(controller);
            return QueueTransition::Finished;
        }
        let load = self.delegate(next, controller);
        QueueTransition::Advanced {
            index: next,
            load: Some(load),
        }
    }

    /// Move to the next track; past the last one the queue finishes
    pub fn skip_next(&mut self, controller: &mut PlaybackController) -> Option<LoadRequest> {
        let index = self.current?;
        if index + 1 >= self.tracks.len() {
            self.stop(controller);
            return None;
        }
        Some(self.delegate(index + 1, controller))
    }

    /// Move to the previous track; the first track restarts
    pub fn skip_previous(&mut self, controller: &mut PlaybackController) -> Option<LoadRequest> {
        let index = self.current?;
        Some(self.delegate(index.saturating_sub(1), controller))
    }

    /// Retry the current track, re-arming the latch for its new load
    pub fn retry(&mut self, controller: &mut PlaybackController) -> Option<LoadRequest> {
        let request = controller.retry();
        if self.current.is_some() {
            self.latch.arm(controller.generation());
        }
        request
    }

    /// Deactivate and stop playback. Idempotent.
    pub fn stop(&mut self, controller: &mut PlaybackController) {
        if self.current.is_some() {
            tracing::info!("Queue stopped");
        }
        self.deactivate();
        controller.stop();
    }

    /// Forget the queue without touching playback
    pub fn deactivate(&mut self) {
        self.current = None;
        self.latch.disarm();
        self.publish();
    }

    fn delegate(&mut self, index: usize, controller: &mut PlaybackController) -> LoadRequest {
        self.current = Some(index);
        let request = controller.load(self.tracks[index].clone());
        self.latch.arm(request.generation);
        self.publish();
        request
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot.send_if_modified(|s| {
            if *s == snapshot {
                return false;
            }
            *s = snapshot;
            true
        });
    }
}
