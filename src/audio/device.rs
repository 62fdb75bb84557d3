//! Capability traits for the platform audio devices.
//!
//! The core never touches hardware directly: a capture backend implements
//! [`AudioSource`], a playback backend implements [`AudioSink`]. Implementors
//! own their device exclusively and release it in `Drop`, which is the single
//! release point the controller relies on.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DeviceError;

/// A decoded buffer placed on the playback timeline. Immutable once handed
/// to the sink; a timeline reset supersedes it, never mutates it.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub samples: Vec<f32>,
    pub start_at: Duration,
    pub duration: Duration,
}

/// Notifications from the sink back to the controller loop.
#[derive(Debug)]
pub enum SinkEvent {
    /// A scheduled item finished rendering.
    ChunkEnded,
}

/// Exclusive, scoped microphone access producing fixed-size float blocks.
#[async_trait]
pub trait AudioSource: Send {
    /// Native rate of the blocks this source produces.
    fn sample_rate(&self) -> u32;

    /// Wait for the next block. Returns `Ok(None)` when the source is
    /// exhausted (only simulated sources ever are) and `Err` when the
    /// device disappears. Must not block beyond the block's natural
    /// availability.
    async fn next_block(&mut self) -> Result<Option<Vec<f32>>, DeviceError>;
}

/// Exclusive speaker access with sample-accurate scheduling.
///
/// The sink owns the output clock: `now()` is the only "now" the scheduler
/// consults, so device-side drift can never open gaps between chunks.
/// Chunk-ended notifications are delivered on the channel handed to the
/// backend at construction.
pub trait AudioSink: Send {
    /// Playback rate the sink renders at.
    fn sample_rate(&self) -> u32;

    /// Monotonic timestamp on the output clock.
    fn now(&self) -> Duration;

    /// Render `item.samples` starting at `item.start_at` on the output
    /// clock. Items arrive with non-decreasing, non-overlapping windows.
    fn play_at(&mut self, item: PlaybackItem) -> Result<(), DeviceError>;

    /// Drop items that are scheduled but have not started rendering.
    /// Returns how many were dropped. The currently rendering item (if
    /// any) plays out.
    fn cancel_pending(&mut self) -> usize;
}

/// Channel type the controller listens on for [`SinkEvent`]s.
pub type SinkEventSender = mpsc::Sender<SinkEvent>;
