use serde::{Deserialize, Serialize};

pub mod backend;
pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod lock;
pub mod media;
pub mod ui;
pub mod useragent;
pub mod version;

pub type Sample = i16;
pub type PcmBuf = Vec<Sample>;

/// A block of interleaved PCM audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcmFrame {
    pub samples: PcmBuf,
    pub sample_rate: u32,
    pub channels: u16,
}

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
