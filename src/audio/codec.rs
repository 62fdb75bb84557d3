//! PCM16 wire codec: float blocks in, little-endian bytes out, and back.
//!
//! Everything here is stateless and deterministic: identical input bytes
//! always produce identical output bytes.

use std::time::Duration;

use bytes::Bytes;

use crate::error::DecodeError;
use crate::protocol::TransportEnvelope;

const PCM16_SCALE: f32 = 32768.0;

/// A decoded inbound chunk: float samples at the playback rate plus the
/// wall-time it occupies when rendered.
#[derive(Debug, Clone)]
pub struct DecodedChunk {
    pub samples: Vec<f32>,
    pub duration: Duration,
}

/// Quantize one float block to signed 16-bit little-endian PCM and wrap it
/// in a wire envelope tagged with its rate.
///
/// Samples are scaled by 32768 and clamped to the i16 range, so exactly
/// +1.0 lands on 32767 (one LSB of error, the accepted full-scale edge).
pub fn encode_block(samples: &[f32], sample_rate: u32) -> TransportEnvelope {
    let mut payload = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        payload.extend_from_slice(&v.to_le_bytes());
    }
    TransportEnvelope {
        payload: Bytes::from(payload),
        mime_type: format!("audio/pcm;rate={}", sample_rate),
    }
}

/// Decode a raw little-endian PCM16 payload into floats in [-1, 1] plus its
/// duration at `sample_rate`.
///
/// An odd byte length is a malformed chunk; the caller skips it and the
/// session continues.
pub fn decode_pcm16(payload: &[u8], sample_rate: u32) -> Result<DecodedChunk, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    if payload.len() % 2 != 0 {
        return Err(DecodeError::OddLength { len: payload.len() });
    }
    let samples: Vec<f32> = payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / PCM16_SCALE)
        .collect();
    let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
    Ok(DecodedChunk { samples, duration })
}

/// Root-mean-square level of one block, for metering.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

/// Linear-interpolation resampler for capture blocks whose native rate
/// differs from the wire rate. Passthrough when the rates match.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = if idx + 1 < samples.len() { samples[idx + 1] } else { a };
        out.push(a + (b - a) * frac);
    }
    out
}
