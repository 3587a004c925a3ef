use anyhow::{anyhow, Result};
use hound::{WavSpec, WavWriter};
use log::debug;
use std::path::Path;

/// Convert normalized f32 samples to little-endian 16-bit PCM bytes.
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian 16-bit PCM bytes into normalized f32 samples.
///
/// Rejects an empty or odd-length payload so a malformed chunk never reaches
/// the mixer.
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.is_empty() {
        return Err(anyhow!("empty audio chunk"));
    }
    if bytes.len() % 2 != 0 {
        return Err(anyhow!("audio chunk has odd byte length {}", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Save audio samples as a 16-bit mono WAV file
pub fn save_wav_file<P: AsRef<Path>>(file_path: P, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = WavWriter::create(file_path.as_ref(), spec)?;

    for sample in samples {
        let sample_i16 = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer.write_sample(sample_i16)?;
    }

    writer.finalize()?;
    debug!("Saved WAV file: {:?}", file_path.as_ref());
    Ok(())
}
