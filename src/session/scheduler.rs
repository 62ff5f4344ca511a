//! Gapless chunk scheduler
//!
//! Chunks are placed back to back on the output clock: each one starts at
//! `max(now, scheduled_until)` and pushes the cursor forward by its own
//! duration. Chunks that arrive in time play with no gap; late chunks
//! leave a pause but never overlap.

use std::collections::HashSet;
use std::sync::Arc;

use crate::audio::backend::{AudioOutput, VoiceId};
use crate::audio::buffer::PcmBuffer;
use crate::error::AudioError;

/// Start time for a chunk arriving at `now`
pub fn next_start(now: f64, scheduled_until: f64) -> f64 {
    now.max(scheduled_until)
}

/// Result of a voice completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceOutcome {
    /// Not one of ours
    Unknown,
    /// Ours, more chunks still pending
    Pending,
    /// Ours and it was the last pending one
    Drained,
}

/// A chunk placed on the output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub voice: VoiceId,
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Debug, Default)]
pub struct GaplessScheduler {
    scheduled_until: f64,
    pending: HashSet<VoiceId>,
    chunks_scheduled: u64,
}

impl GaplessScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where a chunk arriving now would start
    pub fn plan_start(&self, now: f64) -> f64 {
        next_start(now, self.scheduled_until)
    }

    /// Place `buffer` right after everything already scheduled
    pub fn schedule(
        &mut self,
        output: &mut dyn AudioOutput,
        buffer: Arc<PcmBuffer>,
    ) -> Result<ScheduledChunk, AudioError> {
        let start_at = self.plan_start(output.current_time());
        let duration = buffer.duration();
        let voice = output.start_voice(buffer, start_at, 0.0)?;

        self.pending.insert(voice);
        self.scheduled_until = start_at + duration;
        self.chunks_scheduled += 1;
        tracing::debug!(
            "Scheduled {} at {:.3}s for {:.3}s ({} pending)",
            voice,
            start_at,
            duration,
            self.pending.len()
        );

        Ok(ScheduledChunk {
            voice,
            start_at,
            duration,
        })
    }

    pub fn on_voice_ended(&mut self, voice: VoiceId) -> VoiceOutcome {
        if !self.pending.remove(&voice) {
            return VoiceOutcome::Unknown;
        }
        if self.pending.is_empty() {
            VoiceOutcome::Drained
        } else {
            VoiceOutcome::Pending
        }
    }

    /// Stop every pending chunk and rewind the cursor
    pub fn cancel_all(&mut self, output: Option<&mut dyn AudioOutput>) {
        if let Some(output) = output {
            for voice in &self.pending {
                output.stop_voice(*voice);
            }
        }
        if !self.pending.is_empty() {
            tracing::debug!("Cancelled {} pending chunks", self.pending.len());
        }
        self.pending.clear();
        self.scheduled_until = 0.0;
    }

    pub fn owns(&self, voice: VoiceId) -> bool {
        self.pending.contains(&voice)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn scheduled_until(&self) -> f64 {
        self.scheduled_until
    }

    pub fn chunks_scheduled(&self) -> u64 {
        self.chunks_scheduled
    }
}
