use crate::{PcmBuf, Sample};
use anyhow::Result;
use rubato::{FftFixedIn, Resampler};
use tracing::debug;

/// Convert one mono block between sample rates. The result always holds
/// `len * to / from` samples: whatever the resampler does not produce is
/// silence.
pub fn resample_mono(input: &[Sample], from: u32, to: u32) -> PcmBuf {
    if from == to || input.is_empty() {
        return input.to_vec();
    }
    let expected = (input.len() as u64 * to as u64 / from as u64) as usize;
    let mut output = match convert_block(input, from, to) {
        Ok(output) => output,
        Err(e) => {
            debug!(from, to, len = input.len(), "resample failed: {}", e);
            Vec::new()
        }
    };
    output.resize(expected, 0);
    output
}

fn convert_block(input: &[Sample], from: u32, to: u32) -> Result<PcmBuf> {
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, input.len(), 1, 1)?;
    let block: Vec<f32> = input.iter().map(|s| *s as f32 / 32768.0).collect();
    let mut channels = resampler.process(&[block], None)?;
    let samples = channels.pop().unwrap_or_default();
    Ok(samples
        .into_iter()
        .map(|v| (v * 32767.0).clamp(Sample::MIN as f32, Sample::MAX as f32) as Sample)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_to_narrowband() {
        let tone: Vec<i16> = (0..960)
            .map(|i| ((i as f64 * 0.05).sin() * 8000.0) as i16)
            .collect();
        // 20ms at 48kHz becomes 20ms at 8kHz
        assert_eq!(resample_mono(&tone, 48000, 8000).len(), 160);
        assert_eq!(resample_mono(&tone[..320], 16000, 8000).len(), 160);
        assert_eq!(resample_mono(&tone[..160], 8000, 48000).len(), 960);
        assert_eq!(resample_mono(&tone[..160], 8000, 8000), tone[..160].to_vec());
        assert!(resample_mono(&[], 48000, 8000).is_empty());
    }
}
