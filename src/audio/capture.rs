//! Capture pump: microphone blocks → level metering → wire envelopes.
//!
//! The pump exclusively owns its [`AudioSource`]; when the task returns the
//! source is dropped and the device released, which is the one and only
//! release point for the capture side.

use tokio::sync::{mpsc, watch};

use crate::audio::codec;
use crate::audio::device::AudioSource;
use crate::error::DeviceError;
use crate::protocol::TransportEnvelope;

/// What the pump hands to the controller, one per capture block.
#[derive(Debug)]
pub enum CaptureEvent {
    Block {
        envelope: TransportEnvelope,
        /// RMS level of the raw block, for metering.
        level: f32,
    },
    /// The device disappeared mid-capture.
    Failed(DeviceError),
}

/// Pull blocks until shutdown, the source ends, or the receiver goes away.
///
/// Each block is metered, resampled onto `wire_rate` when the source's
/// native rate differs, quantized to PCM16, and forwarded in capture order.
pub async fn run_pump(
    mut source: Box<dyn AudioSource>,
    wire_rate: u32,
    tx: mpsc::Sender<CaptureEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let native_rate = source.sample_rate();
    tracing::info!(native_rate, wire_rate, "capture pump started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            block = source.next_block() => match block {
                Ok(Some(block)) => {
                    let level = codec::rms(&block);
                    let resampled = codec::resample_linear(&block, native_rate, wire_rate);
                    let envelope = codec::encode_block(&resampled, wire_rate);
                    if tx.send(CaptureEvent::Block { envelope, level }).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!("capture source exhausted");
                    break;
                }
                Err(e) => {
                    tracing::error!("capture device failed: {e}");
                    let _ = tx.send(CaptureEvent::Failed(e)).await;
                    break;
                }
            },
        }
    }

    // Dropping the source here releases the device.
    drop(source);
    tracing::info!("capture pump stopped");
}
