//! ALSA implementations of the audio capability traits.
//!
//! Real-time i/o runs on dedicated OS threads (NOT tokio tasks) to avoid
//! contention with the async network side; the threads bridge to the async
//! traits over channels. The playback thread continuously writes mixed
//! periods, so the output clock advances with the device, not the wall
//! clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::device::{AudioSink, AudioSource, PlaybackItem, SinkEvent, SinkEventSender};
use crate::error::DeviceError;

const PCM16_SCALE: f32 = 32768.0;

struct Negotiated {
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
) -> Result<(PCM, Negotiated), DeviceError> {
    let pcm = PCM::new(device, direction, false).map_err(|e| DeviceError::NotFound {
        name: format!("{device}: {e}"),
    })?;
    {
        let hwp = HwParams::any(&pcm).map_err(|e| DeviceError::Backend(e.to_string()))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| DeviceError::FormatNotSupported(e.to_string()))?;
        hwp.set_format(Format::S16LE)
            .map_err(|e| DeviceError::FormatNotSupported(e.to_string()))?;
        hwp.set_channels_near(1)
            .map_err(|e| DeviceError::FormatNotSupported(e.to_string()))?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)
            .map_err(|e| DeviceError::FormatNotSupported(e.to_string()))?;
        pcm.hw_params(&hwp)
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
    }
    let negotiated = {
        let hwp = pcm
            .hw_params_current()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        Negotiated {
            sample_rate: hwp.get_rate().map_err(|e| DeviceError::Backend(e.to_string()))?,
            channels: hwp
                .get_channels()
                .map_err(|e| DeviceError::Backend(e.to_string()))?,
            period_size: hwp
                .get_period_size()
                .map_err(|e| DeviceError::Backend(e.to_string()))? as usize,
        }
    };
    tracing::info!(
        device,
        rate = negotiated.sample_rate,
        channels = negotiated.channels,
        period = negotiated.period_size,
        "ALSA PCM opened"
    );
    Ok((pcm, negotiated))
}

// ======================== Capture ========================

/// Microphone backed by an ALSA capture PCM. A reader thread accumulates
/// periods into fixed blocks and converts them to mono floats.
pub struct AlsaSource {
    sample_rate: u32,
    rx: mpsc::Receiver<Result<Vec<f32>, DeviceError>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AlsaSource {
    pub fn open(device: &str, sample_rate: u32, block_len: usize) -> Result<Self, DeviceError> {
        let (pcm, params) = open_pcm(device, Direction::Capture, sample_rate)?;
        let negotiated_rate = params.sample_rate;
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(8);

        let thread = {
            let running = running.clone();
            thread::Builder::new()
                .name("alsa-capture".into())
                .spawn(move || capture_thread(pcm, params, block_len, tx, &running))
                .map_err(|e| DeviceError::Backend(e.to_string()))?
        };

        Ok(Self {
            sample_rate: negotiated_rate,
            rx,
            running,
            thread: Some(thread),
        })
    }
}

fn capture_thread(
    pcm: PCM,
    params: Negotiated,
    block_len: usize,
    tx: mpsc::Sender<Result<Vec<f32>, DeviceError>>,
    running: &AtomicBool,
) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            let _ = tx.blocking_send(Err(DeviceError::Backend(e.to_string())));
            return;
        }
    };
    let channels = params.channels as usize;
    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut block: Vec<f32> = Vec::with_capacity(block_len);

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                for frame in read_buf[..frames * channels].chunks_exact(channels) {
                    // Downmix to mono by averaging, then to float.
                    let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                    block.push((sum / channels as i32) as f32 / PCM16_SCALE);
                    if block.len() == block_len {
                        let full = std::mem::replace(&mut block, Vec::with_capacity(block_len));
                        if tx.blocking_send(Ok(full)).is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("ALSA capture error: {e}, recovering");
                if pcm.prepare().is_err() {
                    let _ = tx.blocking_send(Err(DeviceError::Disconnected));
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl AudioSource for AlsaSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn next_block(&mut self) -> Result<Option<Vec<f32>>, DeviceError> {
        match self.rx.recv().await {
            Some(Ok(block)) => Ok(Some(block)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl Drop for AlsaSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.rx.close();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ======================== Playback ========================

/// Speaker backed by an ALSA playback PCM. The writer thread mixes scheduled
/// items into a continuous stream of periods (silence where nothing is
/// scheduled), which keeps the clock sample-accurate.
pub struct AlsaSink {
    sample_rate: u32,
    frames_written: Arc<AtomicU64>,
    queue: Arc<Mutex<VecDeque<PlaybackItem>>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AlsaSink {
    pub fn open(device: &str, sample_rate: u32, events: SinkEventSender) -> Result<Self, DeviceError> {
        let (pcm, params) = open_pcm(device, Direction::Playback, sample_rate)?;
        if params.channels != 1 {
            return Err(DeviceError::FormatNotSupported(format!(
                "mono playback required, device negotiated {} channels",
                params.channels
            )));
        }
        let negotiated_rate = params.sample_rate;
        let frames_written = Arc::new(AtomicU64::new(0));
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let frames_written = frames_written.clone();
            let queue = queue.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("alsa-playback".into())
                .spawn(move || playback_thread(pcm, params, frames_written, queue, events, &running))
                .map_err(|e| DeviceError::Backend(e.to_string()))?
        };

        Ok(Self {
            sample_rate: negotiated_rate,
            frames_written,
            queue,
            running,
            thread: Some(thread),
        })
    }

    fn now_frames(&self) -> u64 {
        self.frames_written.load(Ordering::Acquire)
    }
}

fn playback_thread(
    pcm: PCM,
    params: Negotiated,
    frames_written: Arc<AtomicU64>,
    queue: Arc<Mutex<VecDeque<PlaybackItem>>>,
    events: SinkEventSender,
    running: &AtomicBool,
) {
    let io = match pcm.io_i16() {
        Ok(io) => io,
        Err(e) => {
            tracing::error!("ALSA playback io: {e}");
            return;
        }
    };
    let rate = params.sample_rate as u64;
    let period = params.period_size;
    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period];

    while running.load(Ordering::Relaxed) {
        let head = frames_written.load(Ordering::Acquire);
        mix.fill(0.0);

        let mut ended = 0;
        {
            let mut q = queue.lock().unwrap();
            q.retain(|item| {
                let item_start = (item.start_at.as_secs_f64() * rate as f64).round() as u64;
                let item_end = item_start + item.samples.len() as u64;
                let window_end = head + period as u64;
                if item_end <= head {
                    // Window elapsed (can happen after an xrun recovery).
                    ended += 1;
                    return false;
                }
                if item_start < window_end {
                    let from = item_start.max(head);
                    let to = item_end.min(window_end);
                    for frame in from..to {
                        mix[(frame - head) as usize] +=
                            item.samples[(frame - item_start) as usize];
                    }
                    if item_end <= window_end {
                        ended += 1;
                        return false;
                    }
                }
                true
            });
        }
        for _ in 0..ended {
            let _ = events.blocking_send(SinkEvent::ChunkEnded);
        }

        for (dst, &s) in out.iter_mut().zip(mix.iter()) {
            *dst = (s * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }

        let mut written = 0usize;
        while written < period {
            match io.writei(&out[written..]) {
                Ok(n) => written += n,
                Err(e) => {
                    tracing::warn!("ALSA playback error: {e}, recovering");
                    if pcm.prepare().is_err() {
                        tracing::error!("failed to recover PCM playback");
                        return;
                    }
                }
            }
        }
        frames_written.fetch_add(period as u64, Ordering::Release);
    }
}

impl AudioSink for AlsaSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> Duration {
        Duration::from_secs_f64(self.now_frames() as f64 / self.sample_rate as f64)
    }

    fn play_at(&mut self, item: PlaybackItem) -> Result<(), DeviceError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(DeviceError::Disconnected);
        }
        self.queue.lock().unwrap().push_back(item);
        Ok(())
    }

    fn cancel_pending(&mut self) -> usize {
        let now = self.now();
        let mut q = self.queue.lock().unwrap();
        let before = q.len();
        q.retain(|item| item.start_at <= now);
        before - q.len()
    }
}

impl Drop for AlsaSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
