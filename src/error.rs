//! Error types for the voice pipeline.
//!
//! Device and transport errors are fatal to a session; decode errors are
//! local and recoverable (the offending chunk is dropped).

use thiserror::Error;

/// Microphone or speaker failure. Fatal to session start, and fatal to a
/// running session if the device disappears mid-capture.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("audio device not found: {name}")]
    NotFound { name: String },

    #[error("audio device disconnected")]
    Disconnected,

    #[error("unsupported device format: {0}")]
    FormatNotSupported(String),

    #[error("audio backend error: {0}")]
    Backend(String),
}

/// Duplex session failure: the connection could not be opened, closed
/// unexpectedly, or the backend reported an error. Reconnect policy belongs
/// to the surrounding application.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("session closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("backend error: {0}")]
    Remote(String),
}

/// Malformed inbound audio chunk. Local and recoverable: the chunk is
/// skipped, the session and the playback timeline continue unaffected.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload length {len} is not a multiple of 2 bytes")]
    OddLength { len: usize },

    #[error("empty payload")]
    Empty,
}

/// Startup error surface of the demo binary: everything that can go wrong
/// before a session is spawned. Transport failures never appear here; they
/// stay inside a running session as [`TransportError`].
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("configuration error: {0}")]
    Config(String),
}
