//! WAV loading for enrollment and identification audio.

use std::path::Path;

use crate::error::{Result, VoicePrintError};

/// Reads a WAV file into mono f32 samples in [-1, 1].
///
/// Multi-channel audio is downmixed by averaging; 16-bit integer and 32-bit
/// float encodings are accepted.
pub fn read_wav_mono(path: impl AsRef<Path>) -> Result<(u32, Vec<f32>)> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| VoicePrintError::InvalidAudio(format!("{}: {e}", path.display())))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            if spec.bits_per_sample != 16 {
                return Err(VoicePrintError::InvalidAudio(format!(
                    "{}: unsupported bit depth {}",
                    path.display(),
                    spec.bits_per_sample
                )));
            }
            reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoicePrintError::InvalidAudio(format!("{}: {e}", path.display())))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VoicePrintError::InvalidAudio(format!("{}: {e}", path.display())))?,
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok((spec.sample_rate, samples))
}
