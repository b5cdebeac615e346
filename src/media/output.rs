use super::codecs::resample::resample_mono;
use super::codecs::downmix_to_mono;
use crate::{PcmFrame, Sample};
use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Decoded remote audio offered by a media session.
#[derive(Debug)]
pub struct RemoteTrack {
    pub id: String,
    pub frames: mpsc::Receiver<PcmFrame>,
}

/// Where remote audio ends up: a speaker, or nothing at all.
pub trait AudioSink: Send + Sync {
    fn write(&self, track_id: &str, frame: &PcmFrame);
}

/// Discards audio, counting the samples it was given.
#[derive(Default)]
pub struct NullSink {
    written: AtomicUsize,
}

impl NullSink {
    pub fn samples_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

impl AudioSink for NullSink {
    fn write(&self, _track_id: &str, frame: &PcmFrame) {
        self.written.fetch_add(frame.samples.len(), Ordering::SeqCst);
    }
}

/// Playback half of a call. Tracks are only ever added until the output is
/// detached at teardown. A track re-offered under a known id is merged: it
/// gets its own reader next to the ones already playing.
pub struct AudioOutput {
    sink: Arc<dyn AudioSink>,
    attached: HashMap<String, usize>,
    token: CancellationToken,
}

impl AudioOutput {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            attached: HashMap::new(),
            token: CancellationToken::new(),
        }
    }

    /// Distinct remote track ids seen so far.
    pub fn track_count(&self) -> usize {
        self.attached.len()
    }

    pub fn is_detached(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns whether a reader was started for the track.
    pub fn attach(&mut self, track: RemoteTrack) -> bool {
        if self.token.is_cancelled() {
            debug!(track_id = track.id, "output detached, ignoring remote track");
            return false;
        }
        let offers = {
            let count = self.attached.entry(track.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let sink = self.sink.clone();
        let token = self.token.child_token();
        let RemoteTrack { id, mut frames } = track;
        if offers > 1 {
            info!(track_id = id, offers, "remote track replaced, merging into output");
        } else {
            info!(track_id = id, "remote track attached to output");
        }
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => sink.write(&id, &frame),
                        None => break,
                    },
                }
            }
            debug!(track_id = id, "remote track playback ended");
        });
        true
    }

    pub fn detach_all(&mut self) {
        self.token.cancel();
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Per-track playout queues, mixed on the way out.
#[derive(Debug)]
struct AudioBuffer {
    tracks: Mutex<HashMap<String, VecDeque<Sample>>>,
    max_size: usize,
}

impl AudioBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            max_size,
        }
    }

    fn push(&self, track_id: &str, samples: &[Sample]) {
        let Ok(mut tracks) = self.tracks.lock() else {
            return;
        };
        let queue = tracks
            .entry(track_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.max_size));
        queue.extend(samples.iter().copied());
        while queue.len() > self.max_size {
            queue.pop_front();
        }
    }

    /// Fill an interleaved output buffer with the sum of every track,
    /// repeating each mono sample across channels and padding with silence.
    fn drain_into<T: Copy>(&self, out: &mut [T], channels: usize, convert: impl Fn(Sample) -> T) {
        let Ok(mut tracks) = self.tracks.lock() else {
            return;
        };
        for frame in out.chunks_mut(channels.max(1)) {
            let mixed = tracks
                .values_mut()
                .filter_map(|queue| queue.pop_front())
                .fold(0 as Sample, |acc, s| acc.saturating_add(s));
            frame.fill(convert(mixed));
        }
        tracks.retain(|_, queue| !queue.is_empty());
    }
}

/// Speaker output through cpal. The stream runs on its own thread.
pub struct CpalSink {
    buffer: Arc<AudioBuffer>,
    sample_rate: u32,
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl CpalSink {
    pub fn open_default() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default output device"))?;
        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;
        // two seconds of slack
        let buffer = Arc::new(AudioBuffer::new(sample_rate as usize * 2));
        info!(device = device.name().unwrap_or_default(), sample_rate, "using output device");

        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let thread_buffer = buffer.clone();
        std::thread::spawn(move || {
            let stream = match build_output_stream(&device, &config, sample_format, thread_buffer)
            {
                Ok(stream) => stream,
                Err(e) => {
                    ready_tx.send(Err(e)).ok();
                    return;
                }
            };
            if let Err(e) = stream.play() {
                ready_tx.send(Err(anyhow!("failed to start output: {}", e))).ok();
                return;
            }
            ready_tx.send(Ok(())).ok();
            stop_rx.recv().ok();
        });
        ready_rx
            .recv()
            .map_err(|_| anyhow!("output thread exited"))??;
        Ok(Self {
            buffer,
            sample_rate,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }
}

impl AudioSink for CpalSink {
    fn write(&self, track_id: &str, frame: &PcmFrame) {
        let mono = downmix_to_mono(&frame.samples, frame.channels);
        let samples = resample_mono(&mono, frame.sample_rate, self.sample_rate);
        self.buffer.push(track_id, &samples);
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.lock().ok().and_then(|mut tx| tx.take()) {
            tx.send(()).ok();
        }
    }
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: SampleFormat,
    buffer: Arc<AudioBuffer>,
) -> Result<cpal::Stream> {
    let channels = config.channels as usize;
    let err_fn = move |err| {
        error!("Error on output stream: {}", err);
    };
    let stream = match sample_format {
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                buffer.drain_into(data, channels, |s| s);
            },
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                buffer.drain_into(data, channels, |s| s as f32 / 32767.0);
            },
            err_fn,
            None,
        )?,
        other => return Err(anyhow!("Unsupported sample format: {:?}", other)),
    };
    Ok(stream)
}
