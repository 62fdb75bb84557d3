use std::path::Path;

use tokio::signal;
use tokio::sync::mpsc;

use voicelink::audio::device::{AudioSink, AudioSource, SinkEvent};
use voicelink::audio::sim::{SimSink, SimSource};
use voicelink::controller::{SessionController, StatusEvent};
use voicelink::session::WsConnector;
use voicelink::{VoiceConfig, VoiceError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = VoiceConfig::load(Path::new("voicelink.toml"))?;
    tracing::info!(backend = %config.audio.backend, "voicelink starting");

    let (sink_tx, sink_rx) = mpsc::channel(64);
    let (source, sink) = open_backend(&config, sink_tx)?;

    let (handle, mut status_rx) = SessionController::spawn(
        config.pipeline_options(),
        source,
        sink,
        sink_rx,
        Box::new(WsConnector::new()),
    );

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("ctrl-c, stopping session");
                handle.stop().await;
                break;
            }
            status = status_rx.recv() => match status {
                Some(StatusEvent::State(state)) => {
                    println!("state: {state:?}");
                    if state.is_terminal() {
                        break;
                    }
                }
                Some(StatusEvent::InputLevel(level)) => {
                    tracing::debug!(level, "input level");
                }
                None => break,
            },
        }
    }

    handle.join().await;
    Ok(())
}

/// Acquire the configured devices. Failures here happen before any session
/// is spawned, so they never appear as a `Failed` status.
fn open_backend(
    config: &VoiceConfig,
    sink_tx: mpsc::Sender<SinkEvent>,
) -> Result<(Box<dyn AudioSource>, Box<dyn AudioSink>), VoiceError> {
    match config.audio.backend.as_str() {
        "sim" => Ok((
            Box::new(SimSource::new(config.audio.send_sample_rate, config.block_len())),
            Box::new(SimSink::new(config.audio.receive_sample_rate, sink_tx)),
        )),
        #[cfg(feature = "alsa-backend")]
        "alsa" => {
            use voicelink::audio::{AlsaSink, AlsaSource};
            let source = AlsaSource::open(
                &config.audio.capture_device,
                config.audio.send_sample_rate,
                config.block_len(),
            )
            .map_err(VoiceError::Device)?;
            let sink = AlsaSink::open(
                &config.audio.playback_device,
                config.audio.receive_sample_rate,
                sink_tx,
            )
            .map_err(VoiceError::Device)?;
            Ok((Box::new(source), Box::new(sink)))
        }
        other => Err(VoiceError::Config(format!("unknown audio backend: {other}"))),
    }
}
