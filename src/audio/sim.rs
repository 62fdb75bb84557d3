//! Simulated audio backend.
//!
//! Stands in for real hardware when none is available (CI, the demo binary
//! without the `alsa-backend` feature, integration tests). `SimSource`
//! produces paced sine blocks; `SimSink` keeps an output clock anchored to
//! the moment it was created and reports chunk ends on a timer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::device::{AudioSink, AudioSource, PlaybackItem, SinkEvent, SinkEventSender};
use crate::error::DeviceError;

/// Sine-tone microphone. Blocks are delivered at their natural rate, one
/// block duration apart, like a real capture callback would.
pub struct SimSource {
    sample_rate: u32,
    block_len: usize,
    amplitude: f32,
    phase: f32,
    /// Remaining blocks, or `None` for an unbounded source.
    remaining: Option<usize>,
    released: Option<Arc<AtomicUsize>>,
}

impl SimSource {
    pub fn new(sample_rate: u32, block_len: usize) -> Self {
        Self {
            sample_rate,
            block_len,
            amplitude: 0.3,
            phase: 0.0,
            remaining: None,
            released: None,
        }
    }

    /// Stop after `n` blocks instead of running forever.
    pub fn with_block_limit(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }

    /// Count device releases into `counter` (incremented from `Drop`).
    pub fn with_release_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.released = Some(counter);
        self
    }
}

#[async_trait]
impl AudioSource for SimSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn next_block(&mut self) -> Result<Option<Vec<f32>>, DeviceError> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return Ok(None);
            }
            *remaining -= 1;
        }
        // Pace delivery like a hardware period.
        let block_duration =
            Duration::from_secs_f64(self.block_len as f64 / self.sample_rate as f64);
        tokio::time::sleep(block_duration).await;

        let step = 2.0 * std::f32::consts::PI * 440.0 / self.sample_rate as f32;
        let mut block = Vec::with_capacity(self.block_len);
        for _ in 0..self.block_len {
            block.push(self.amplitude * self.phase.sin());
            self.phase += step;
        }
        Ok(Some(block))
    }
}

impl Drop for SimSource {
    fn drop(&mut self) {
        if let Some(counter) = &self.released {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Virtual speaker: renders nothing, but honors the scheduling contract.
/// One timer task per scheduled item fires `ChunkEnded` when its window
/// elapses; cancelling pending items aborts their timers.
pub struct SimSink {
    origin: Instant,
    sample_rate: u32,
    events: SinkEventSender,
    pending: Vec<(Duration, JoinHandle<()>)>,
    released: Option<Arc<AtomicUsize>>,
}

impl SimSink {
    pub fn new(sample_rate: u32, events: SinkEventSender) -> Self {
        Self {
            origin: Instant::now(),
            sample_rate,
            events,
            pending: Vec::new(),
            released: None,
        }
    }

    pub fn with_release_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.released = Some(counter);
        self
    }

    fn prune_finished(&mut self) {
        self.pending.retain(|(_, handle)| !handle.is_finished());
    }
}

impl AudioSink for SimSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn play_at(&mut self, item: PlaybackItem) -> Result<(), DeviceError> {
        self.prune_finished();
        let ends_at = self.origin + item.start_at + item.duration;
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(ends_at).await;
            let _ = events.send(SinkEvent::ChunkEnded).await;
        });
        self.pending.push((item.start_at, handle));
        Ok(())
    }

    fn cancel_pending(&mut self) -> usize {
        self.prune_finished();
        let now = self.now();
        let mut dropped = 0;
        self.pending.retain(|(start_at, handle)| {
            if *start_at > now {
                handle.abort();
                dropped += 1;
                false
            } else {
                true
            }
        });
        dropped
    }
}

impl Drop for SimSink {
    fn drop(&mut self) {
        for (_, handle) in &self.pending {
            handle.abort();
        }
        if let Some(counter) = &self.released {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn source_paces_and_honors_block_limit() {
        let mut source = SimSource::new(16000, 160).with_block_limit(2);
        let first = source.next_block().await.unwrap().unwrap();
        assert_eq!(first.len(), 160);
        assert!(source.next_block().await.unwrap().is_some());
        assert!(source.next_block().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sink_reports_chunk_end_when_window_elapses() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = SimSink::new(24000, tx);
        sink.play_at(PlaybackItem {
            samples: vec![0.0; 2400],
            start_at: sink.now(),
            duration: Duration::from_millis(100),
        })
        .unwrap();

        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(matches!(rx.recv().await, Some(SinkEvent::ChunkEnded)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_only_drops_unstarted_items() {
        let (tx, _rx) = mpsc::channel(4);
        let mut sink = SimSink::new(24000, tx);
        let now = sink.now();
        for i in 0..3u32 {
            sink.play_at(PlaybackItem {
                samples: vec![0.0; 2400],
                start_at: now + Duration::from_millis(100 * i as u64),
                duration: Duration::from_millis(100),
            })
            .unwrap();
        }
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(sink.cancel_pending(), 2);
    }
}
