//! Sample-rate conversion for capture and playback
//!
//! Both paths go through rubato's FFT resampler, which band-limits before
//! changing rate. The filter delay is trimmed so output lines up with input.

use anyhow::{Context, Result};
use rubato::{FftFixedIn, Resampler};

/// Input block for whole-buffer conversion
const BUFFER_CHUNK: usize = 1024;

/// Convert a complete mono buffer from `from_rate` to `to_rate`
///
/// Output length is `len * to_rate / from_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, BUFFER_CHUNK, 2, 1)
            .with_context(|| format!("Failed to create {}Hz -> {}Hz resampler", from_rate, to_rate))?;

    let expected =
        (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate.max(1))) as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay);

    let mut chunks = samples.chunks(BUFFER_CHUNK);
    while output.len() < expected + delay {
        let mut chunk = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        chunk.resize(BUFFER_CHUNK, 0.0);

        let result = resampler
            .process(&[chunk], None)
            .context("Resampling failed")?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output[delay..delay + expected].to_vec())
}

/// Incremental mono conversion for a live stream
///
/// Input is buffered into 10ms blocks; whatever does not fill a block waits
/// for the next call.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    input: Vec<f32>,
    /// Output samples still owed to the filter delay
    skip: usize,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                inner: None,
                input: Vec::new(),
                skip: 0,
            });
        }

        let block = (from_rate as usize / 100).max(1);
        let resampler = FftFixedIn::<f32>::new(from_rate as usize, to_rate as usize, block, 2, 1)
            .with_context(|| format!("Failed to create {}Hz -> {}Hz resampler", from_rate, to_rate))?;

        Ok(Self {
            skip: resampler.output_delay(),
            inner: Some(resampler),
            input: Vec::with_capacity(block * 2),
        })
    }

    /// Whether any conversion happens at all
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed device-rate samples, get back whatever target-rate samples are ready
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let resampler = match self.inner.as_mut() {
            Some(resampler) => resampler,
            None => return Ok(samples.to_vec()),
        };

        self.input.extend_from_slice(samples);
        let mut output = Vec::new();

        loop {
            let needed = resampler.input_frames_next();
            if self.input.len() < needed {
                break;
            }

            let block: Vec<f32> = self.input.drain(..needed).collect();
            let result = resampler
                .process(&[block], None)
                .context("Resampling failed")?;

            let produced = &result[0];
            let trimmed = self.skip.min(produced.len());
            self.skip -= trimmed;
            output.extend_from_slice(&produced[trimmed..]);
        }

        Ok(output)
    }
}
