use super::{Decoder, Encoder};
use crate::{PcmBuf, Sample};

/// Largest 13-bit magnitude covered by each A-law segment.
const SEGMENT_END: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
/// Even bits are inverted on the wire.
const EVEN_BITS: u8 = 0x55;

#[derive(Default)]
pub struct PcmaDecoder;

impl PcmaDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PcmaDecoder {
    fn decode(&mut self, data: &[u8]) -> PcmBuf {
        data.iter().copied().map(alaw_to_linear).collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}

#[derive(Default)]
pub struct PcmaEncoder;

impl PcmaEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for PcmaEncoder {
    fn encode(&mut self, samples: &[Sample]) -> Vec<u8> {
        samples.iter().copied().map(linear_to_alaw).collect()
    }

    fn sample_rate(&self) -> u32 {
        8000
    }
}

fn alaw_to_linear(byte: u8) -> Sample {
    let a = byte ^ EVEN_BITS;
    let segment = ((a >> 4) & 0x07) as i32;
    let step = ((a & 0x0F) as i32) << 4;
    let magnitude = match segment {
        0 => step + 8,
        1 => step + 0x108,
        s => (step + 0x108) << (s - 1),
    };
    // sign bit set means positive
    if a & 0x80 != 0 {
        magnitude as Sample
    } else {
        -magnitude as Sample
    }
}

fn linear_to_alaw(sample: Sample) -> u8 {
    // work on 13 bits; widening first keeps i16::MIN in range
    let value = (sample as i32) >> 3;
    let (sign, magnitude) = if value >= 0 {
        (0x80, value)
    } else {
        (0x00, -value - 1)
    };
    let code = match SEGMENT_END.iter().position(|end| magnitude <= *end) {
        Some(segment) => {
            let shift = if segment < 2 { 1 } else { segment };
            ((segment as u8) << 4) | ((magnitude >> shift) & 0x0F) as u8
        }
        None => 0x7F,
    };
    (sign | code) ^ EVEN_BITS
}
