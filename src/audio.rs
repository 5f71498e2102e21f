//! Audio primitives shared by the pipeline
//!
//! Frames are mono `f32` samples in `[-1.0, 1.0]`. The sample buffer is
//! reference counted so a frame can be handed to VAD, STT and the output
//! sink without copying.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::Result;

/// Sample rate used for speech input (16kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Default frame length used when splitting raw sample buffers
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// A chunk of mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Create a frame from owned samples
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// A frame of digital silence lasting `duration`
    #[must_use]
    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        Self::new(vec![0.0; samples_for(duration, sample_rate)], sample_rate)
    }

    /// Sample buffer
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether the frame carries no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of the frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = self.samples.len() as u64 * 1_000_000_000 / u64::from(self.sample_rate);
        Duration::from_nanos(nanos)
    }

    /// RMS energy of the frame
    #[must_use]
    pub fn energy(&self) -> f32 {
        calculate_energy(&self.samples)
    }

    /// Return a new frame with every sample passed through `f`
    #[must_use]
    pub fn map_samples(&self, f: impl Fn(f32) -> f32) -> Self {
        Self::new(self.samples.iter().map(|&s| f(s)).collect(), self.sample_rate)
    }
}

/// Number of samples covering `duration` at `sample_rate`
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Split a contiguous sample buffer into fixed-length frames
///
/// The trailing frame may be shorter than `frame_duration`.
#[must_use]
pub fn split_frames(samples: &[f32], sample_rate: u32, frame_duration: Duration) -> Vec<AudioFrame> {
    let frame_len = samples_for(frame_duration, sample_rate).max(1);
    samples
        .chunks(frame_len)
        .map(|chunk| AudioFrame::new(chunk.to_vec(), sample_rate))
        .collect()
}

/// Concatenate frames into one sample buffer
///
/// Returns the samples and the sample rate of the first frame.
#[must_use]
pub fn concat_frames(frames: &[AudioFrame]) -> (Vec<f32>, u32) {
    let sample_rate = frames.first().map_or(SAMPLE_RATE, AudioFrame::sample_rate);
    let samples = frames
        .iter()
        .flat_map(|f| f.samples().iter().copied())
        .collect();
    (samples, sample_rate)
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = wav_spec(sample_rate);

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(to_i16(sample))?;
        }
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Write f32 samples to a 16-bit PCM WAV file
///
/// # Errors
///
/// Returns error if the file cannot be created or encoding fails
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, wav_spec(sample_rate))?;
    for &sample in samples {
        writer.write_sample(to_i16(sample))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Read a WAV file as mono f32 samples
///
/// Multi-channel input is downmixed by averaging channels.
///
/// # Errors
///
/// Returns error if the file cannot be read or decoded
#[allow(clippy::cast_precision_loss)]
pub fn read_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, hound::Error>>()?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>()?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

/// Decode little-endian signed 16-bit PCM into f32 samples
///
/// A trailing odd byte is ignored; callers streaming PCM should carry it
/// over to the next chunk (see [`PcmDecoder`]).
#[must_use]
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect()
}

/// Incremental PCM16 decoder for chunked HTTP bodies
#[derive(Debug, Default)]
pub struct PcmDecoder {
    remainder: Option<u8>,
}

impl PcmDecoder {
    /// Decode a body chunk, carrying an odd trailing byte to the next call
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<f32> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        if let Some(b) = self.remainder.take() {
            bytes.push(b);
        }
        bytes.extend_from_slice(chunk);

        if bytes.len() % 2 == 1 {
            self.remainder = bytes.pop();
        }
        decode_pcm16(&bytes)
    }
}

const fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    // Convert f32 [-1.0, 1.0] to i16
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
