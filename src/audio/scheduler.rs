//! Gapless playback scheduling.
//!
//! Chunks arrive over the network with jitter; the scheduler pins each one
//! to the output clock so consecutive chunks render back-to-back with no
//! gap and no overlap. A burst of chunks queues further into the future,
//! so backpressure turns into latency instead of data loss.

use std::time::Duration;

use crate::audio::codec::DecodedChunk;
use crate::audio::device::{AudioSink, PlaybackItem};
use crate::error::DeviceError;

pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    /// First timestamp on the output clock not yet claimed by a chunk.
    /// Never moves backward except in `reset_to_now`.
    next_free_slot: Duration,
    /// Items handed to the sink that have not ended yet.
    outstanding: usize,
    cancel_on_reset: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioSink>, cancel_on_reset: bool) -> Self {
        let next_free_slot = sink.now();
        Self {
            sink,
            next_free_slot,
            outstanding: 0,
            cancel_on_reset,
        }
    }

    /// Place `chunk` on the timeline and return the start it was given.
    ///
    /// `start = max(next_free_slot, now)`: consecutive chunks land
    /// back-to-back, and a chunk arriving after the timeline drained starts
    /// immediately instead of in the past.
    pub fn schedule_next(&mut self, chunk: DecodedChunk) -> Result<Duration, DeviceError> {
        let now = self.sink.now();
        let start_at = self.next_free_slot.max(now);
        let duration = chunk.duration;
        self.sink.play_at(PlaybackItem {
            samples: chunk.samples,
            start_at,
            duration,
        })?;
        self.next_free_slot = start_at + duration;
        self.outstanding += 1;
        tracing::trace!(?start_at, ?duration, "scheduled chunk");
        Ok(start_at)
    }

    /// Interruption: collapse the timeline to "now". Chunks decoded after
    /// this schedule from the current clock instead of the old backlog.
    /// Already-started audio plays out; pending items are dropped only when
    /// configured to.
    pub fn reset_to_now(&mut self) {
        self.next_free_slot = self.sink.now();
        if self.cancel_on_reset {
            let dropped = self.sink.cancel_pending();
            self.outstanding = self.outstanding.saturating_sub(dropped);
            tracing::debug!(dropped, "playback reset, pending chunks cancelled");
        } else {
            tracing::debug!("playback reset, already-scheduled chunks play out");
        }
    }

    /// Account for one chunk finishing. Returns true when the timeline
    /// drained with it.
    pub fn on_chunk_ended(&mut self) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.outstanding == 0
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding == 0
    }
}
