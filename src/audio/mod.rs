//! Audio capture, wire codec, and gapless playback scheduling.
//!
//! Hardware access goes through the [`device`] capability traits; the
//! simulated backend in [`sim`] covers machines without audio devices, and
//! the ALSA backend is available behind the `alsa-backend` feature.

#[cfg(feature = "alsa-backend")]
mod alsa_backend;
pub mod capture;
pub mod codec;
pub mod device;
pub mod scheduler;
pub mod sim;

#[cfg(feature = "alsa-backend")]
pub use alsa_backend::{AlsaSink, AlsaSource};
pub use capture::CaptureEvent;
pub use codec::DecodedChunk;
pub use device::{AudioSink, AudioSource, PlaybackItem, SinkEvent};
pub use scheduler::PlaybackScheduler;
