//! Runtime configuration, loaded from a TOML file with full defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::controller::PipelineOptions;
use crate::error::VoiceError;
use crate::protocol::SessionConfig;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VoiceConfig {
    pub session: SessionSection,
    pub audio: AudioSection,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionSection {
    pub endpoint: String,
    pub token: String,
    /// Forwarded verbatim to the backend; supplied by the surrounding
    /// coaching application.
    pub system_instruction: String,
    pub voice_response: bool,
    /// Seconds to wait for the session to open; absent means wait forever.
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AudioSection {
    /// "sim" or "alsa".
    pub backend: String,
    pub capture_device: String,
    pub playback_device: String,
    /// Outbound wire rate.
    pub send_sample_rate: u32,
    /// Rate the backend declares for its deltas.
    pub receive_sample_rate: u32,
    /// Capture block length in milliseconds.
    pub block_ms: u32,
    /// Drop scheduled-but-unstarted chunks on interruption.
    pub cancel_on_interrupt: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            endpoint: "wss://localhost:8443/live".to_string(),
            token: String::new(),
            system_instruction: "You are a supportive voice coach.".to_string(),
            voice_response: true,
            connect_timeout_secs: Some(15),
        }
    }
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            backend: "sim".to_string(),
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            send_sample_rate: 16000,
            receive_sample_rate: 24000,
            block_ms: 256,
            cancel_on_interrupt: false,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            session: SessionSection::default(),
            audio: AudioSection::default(),
        }
    }
}

impl VoiceConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, VoiceError> {
        match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| VoiceError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(VoiceError::Config(format!("{}: {e}", path.display()))),
        }
    }

    /// Samples per capture block at the outbound wire rate.
    pub fn block_len(&self) -> usize {
        (self.audio.send_sample_rate as u64 * self.audio.block_ms as u64 / 1000) as usize
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.session.endpoint.clone(),
            token: self.session.token.clone(),
            system_instruction: self.session.system_instruction.clone(),
            voice_response: self.session.voice_response,
            send_sample_rate: self.audio.send_sample_rate,
            receive_sample_rate: self.audio.receive_sample_rate,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            session: self.session_config(),
            connect_timeout: self.session.connect_timeout_secs.map(Duration::from_secs),
            cancel_on_interrupt: self.audio.cancel_on_interrupt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_for_missing_sections() {
        let config: VoiceConfig = toml::from_str(
            r#"
            [session]
            endpoint = "wss://example.test/live"
            token = "abc"
            "#,
        )
        .unwrap();
        assert_eq!(config.session.endpoint, "wss://example.test/live");
        assert_eq!(config.audio.send_sample_rate, 16000);
        assert_eq!(config.audio.receive_sample_rate, 24000);
        assert_eq!(config.block_len(), 4096);
        assert!(!config.audio.cancel_on_interrupt);
    }

    #[test]
    fn timeout_is_optional() {
        let config: VoiceConfig = toml::from_str(
            r#"
            [session]
            connect_timeout_secs = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.pipeline_options().connect_timeout,
            Some(Duration::from_secs(3))
        );
    }
}
