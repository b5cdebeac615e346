use crate::{PcmBuf, Sample};
pub mod pcma;
pub mod pcmu;
pub mod resample;

/// G.711 variants negotiated with the PBX. Both run at 8 kHz mono.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CodecType {
    PCMU,
    PCMA,
}

pub trait Decoder: Send + Sync {
    fn decode(&mut self, data: &[u8]) -> PcmBuf;
    fn sample_rate(&self) -> u32;
}

pub trait Encoder: Send + Sync {
    fn encode(&mut self, samples: &[Sample]) -> Vec<u8>;
    fn sample_rate(&self) -> u32;
}

pub fn create_decoder(codec: CodecType) -> Box<dyn Decoder> {
    match codec {
        CodecType::PCMU => Box::new(pcmu::PcmuDecoder::new()),
        CodecType::PCMA => Box::new(pcma::PcmaDecoder::new()),
    }
}

pub fn create_encoder(codec: CodecType) -> Box<dyn Encoder> {
    match codec {
        CodecType::PCMU => Box::new(pcmu::PcmuEncoder::new()),
        CodecType::PCMA => Box::new(pcma::PcmaEncoder::new()),
    }
}

impl CodecType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            CodecType::PCMU => "audio/PCMU",
            CodecType::PCMA => "audio/PCMA",
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            CodecType::PCMU => 0,
            CodecType::PCMA => 8,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        8000
    }

    /// Match a negotiated mime type, case-insensitively.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        if mime.eq_ignore_ascii_case("audio/PCMU") {
            Some(CodecType::PCMU)
        } else if mime.eq_ignore_ascii_case("audio/PCMA") {
            Some(CodecType::PCMA)
        } else {
            None
        }
    }
}

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(samples: &[Sample], channels: u16) -> PcmBuf {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|s| *s as i32).sum();
            (sum / frame.len() as i32) as Sample
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g711_roundtrip_is_close() {
        for codec in [CodecType::PCMA, CodecType::PCMU] {
            let mut encoder = create_encoder(codec);
            let mut decoder = create_decoder(codec);
            let input: Vec<i16> = vec![0, 1000, -1000, 12000, -12000, 30000];
            let encoded = encoder.encode(&input);
            assert_eq!(encoded.len(), input.len());
            let decoded = decoder.decode(&encoded);
            for (a, b) in input.iter().zip(decoded.iter()) {
                let tolerance = (a.unsigned_abs() as i32 / 16).max(16);
                assert!(
                    (*a as i32 - *b as i32).abs() <= tolerance,
                    "{:?}: {} decoded as {}",
                    codec,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_mime_and_downmix() {
        assert_eq!(CodecType::from_mime_type("audio/pcma"), Some(CodecType::PCMA));
        assert_eq!(CodecType::from_mime_type("audio/opus"), None);
        assert_eq!(CodecType::PCMU.payload_type(), 0);
        assert_eq!(downmix_to_mono(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix_to_mono(&[1, 2, 3], 1), vec![1, 2, 3]);
    }
}
