//! Reply payload decoding
//!
//! Payloads arrive as base64 text. Underneath is either a container the
//! probe recognizes (WAV, MP3, FLAC, OGG) or raw PCM16LE mono. Everything
//! ends up as mono f32 at the output rate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::audio::resample;
use crate::config::ReplyFormat;
use crate::error::{VoiceError, VoiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackConfig {
    /// Rate of the output device, and of raw PCM replies
    pub output_sample_rate: u32,
    pub reply_format: ReplyFormat,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 24000,
            reply_format: ReplyFormat::Auto,
        }
    }
}

/// Decoded mono audio ready for the output
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode one base64 reply payload
pub fn decode_payload(payload: &str, config: &PlaybackConfig) -> VoiceResult<PlaybackBuffer> {
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| VoiceError::DecodeFailure(format!("invalid base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(VoiceError::DecodeFailure("empty payload".to_string()));
    }

    let (samples, rate) = match config.reply_format {
        ReplyFormat::Pcm16 => (pcm16_to_f32(&bytes)?, config.output_sample_rate),
        ReplyFormat::Auto => decode_container(bytes)?,
    };

    if samples.is_empty() {
        return Err(VoiceError::DecodeFailure("payload decoded to no samples".to_string()));
    }

    let samples = if rate == config.output_sample_rate {
        samples
    } else {
        debug!("Resampling reply {}Hz -> {}Hz", rate, config.output_sample_rate);
        resample(&samples, rate, config.output_sample_rate)
            .map_err(|e| VoiceError::DecodeFailure(format!("{:#}", e)))?
    };

    Ok(PlaybackBuffer::new(samples, config.output_sample_rate))
}

fn pcm16_to_f32(bytes: &[u8]) -> VoiceResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(VoiceError::DecodeFailure(format!(
            "odd PCM16 payload length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Probe and decode a container, downmixing to mono
fn decode_container(bytes: Vec<u8>) -> VoiceResult<(Vec<f32>, u32)> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::DecodeFailure(format!("unrecognized audio: {}", e)))?;

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| VoiceError::DecodeFailure("no audio track".to_string()))?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::DecodeFailure(format!("unsupported codec: {}", e)))?;

    let mut mono = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(VoiceError::DecodeFailure(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate.get_or_insert(spec.rate);
                let channels = spec.channels.count().max(1);

                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);

                mono.extend(
                    buffer
                        .samples()
                        .chunks_exact(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                );
            }
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping corrupt packet in reply audio: {}", e);
            }
            Err(e) => return Err(VoiceError::DecodeFailure(e.to_string())),
        }
    }

    let sample_rate =
        sample_rate.ok_or_else(|| VoiceError::DecodeFailure("unknown sample rate".to_string()))?;
    Ok((mono, sample_rate))
}
