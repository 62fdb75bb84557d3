//! voicelink: real-time bidirectional voice pipeline.
//!
//! Captures microphone audio, frames it as PCM16 for a streaming
//! conversational backend, and replays the returned audio gaplessly while
//! staying interruptible mid-utterance. Hardware and transport sit behind
//! capability traits so the whole pipeline runs against simulated devices
//! and a scripted session in tests.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod session;
pub mod state;

pub use config::VoiceConfig;
pub use controller::{ControlCommand, ControllerHandle, PipelineOptions, SessionController, StatusEvent};
pub use error::{DecodeError, DeviceError, TransportError, VoiceError};
pub use protocol::{SessionConfig, SessionEvent, TransportEnvelope};
pub use session::{Connector, DuplexSession, WsConnector};
pub use state::SessionState;
