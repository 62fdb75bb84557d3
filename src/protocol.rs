//! Wire types shared between the controller and the duplex session.
//!
//! Outbound audio travels as binary WebSocket frames described by a setup
//! message; control signaling is JSON text, tagged by a `type` string.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One outbound wire frame: little-endian 16-bit PCM plus its encoding
/// descriptor. Produced once per capture block, consumed exactly once.
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    pub payload: Bytes,
    pub mime_type: String,
}

/// Inbound session events, delivered strictly in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    /// The backend acknowledged the setup message; the session is live.
    Opened,
    /// Raw little-endian PCM16 at the backend's declared rate.
    AudioDelta(Bytes),
    /// The user barged in; truncate the playback timeline.
    Interrupted,
    /// The backend finished producing audio for the current turn.
    TurnComplete,
    /// Orderly close. No further sends are meaningful.
    Closed,
    /// Transport-level failure. Terminal.
    Error(String),
}

/// Connection parameters handed to a [`crate::session::Connector`].
///
/// `system_instruction` is supplied verbatim by the surrounding coaching
/// application and forwarded untouched.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: String,
    pub token: String,
    pub system_instruction: String,
    /// Request spoken (audio) responses rather than text.
    pub voice_response: bool,
    /// Outbound PCM rate declared in the setup message.
    pub send_sample_rate: u32,
    /// Rate the backend declares for its audio deltas.
    pub receive_sample_rate: u32,
}

/// Setup message sent immediately after the WebSocket opens; declares the
/// audio formats for both directions.
#[derive(Serialize)]
pub struct SetupMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub modality: String,
    pub system_instruction: String,
    pub audio_params: AudioParams,
}

#[derive(Serialize)]
pub struct AudioParams {
    pub format: String,
    pub send_sample_rate: u32,
    pub receive_sample_rate: u32,
    pub channels: u8,
}

/// Control message from the backend.
#[derive(Deserialize, Debug)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub reason: Option<String>,
}

impl SetupMessage {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            msg_type: "setup".to_string(),
            modality: if config.voice_response { "audio" } else { "text" }.to_string(),
            system_instruction: config.system_instruction.clone(),
            audio_params: AudioParams {
                format: "pcm".to_string(),
                send_sample_rate: config.send_sample_rate,
                receive_sample_rate: config.receive_sample_rate,
                channels: 1,
            },
        }
    }
}
