use super::device::{AudioBackend, CaptureTrack, DeviceDescriptor, DeviceError, OpenedInput};
use crate::PcmFrame;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use std::sync::Mutex;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const FRAME_QUEUE: usize = 100;

/// Microphone access through the platform's default cpal host.
pub struct CpalAudioBackend {
    host: cpal::Host,
}

impl Default for CpalAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalAudioBackend {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn find_device(&self, device_id: Option<&str>) -> Result<cpal::Device, DeviceError> {
        match device_id {
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| DeviceError::NotFound("default".to_string())),
            Some(id) => self
                .host
                .input_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?
                .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(id.to_string())),
        }
    }
}

fn classify(detail: String) -> DeviceError {
    let lower = detail.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        DeviceError::PermissionDenied
    } else {
        DeviceError::Backend(detail)
    }
}

impl From<cpal::BuildStreamError> for DeviceError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                DeviceError::NotFound("device not available".to_string())
            }
            other => classify(other.to_string()),
        }
    }
}

impl AudioBackend for CpalAudioBackend {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let default_name = self
            .host
            .default_input_device()
            .and_then(|d| d.name().ok());
        let devices = self
            .host
            .input_devices()
            .map_err(|e| classify(e.to_string()))?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| DeviceDescriptor {
                is_default: default_name.as_deref() == Some(name.as_str()),
                id: name.clone(),
                label: name,
            })
            .collect())
    }

    fn open_input(&self, device_id: Option<&str>) -> Result<OpenedInput, DeviceError> {
        let device = self.find_device(device_id)?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let descriptor = DeviceDescriptor {
            id: name.clone(),
            label: name.clone(),
            is_default: device_id.is_none(),
        };
        let (track, frames) = CpalCaptureTrack::start(device)?;
        info!(device = name, track_id = track.id, "capture track started");
        Ok(OpenedInput {
            device: descriptor,
            track: Box::new(track),
            frames,
        })
    }
}

/// A cpal input stream living on its own thread; `cpal::Stream` is not `Send`.
pub struct CpalCaptureTrack {
    id: String,
    stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
}

impl CpalCaptureTrack {
    fn start(device: cpal::Device) -> Result<(Self, mpsc::Receiver<PcmFrame>), DeviceError> {
        let (frame_tx, frame_rx) = mpsc::channel::<PcmFrame>(FRAME_QUEUE);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), DeviceError>>();
        let id = uuid::Uuid::new_v4().to_string();

        let thread_id = id.clone();
        thread::spawn(move || {
            let stream = match build_input_stream(&device, frame_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    ready_tx.send(Err(e)).ok();
                    return;
                }
            };
            if let Err(e) = stream.play() {
                ready_tx.send(Err(classify(e.to_string()))).ok();
                return;
            }
            ready_tx.send(Ok(())).ok();
            // parked until the track is stopped or its handle dropped
            stop_rx.recv().ok();
            drop(stream);
            info!(track_id = thread_id, "capture track stopped");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok((
                Self {
                    id,
                    stop_tx: Mutex::new(Some(stop_tx)),
                },
                frame_rx,
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DeviceError::Backend("capture thread exited".to_string())),
        }
    }
}

impl CaptureTrack for CpalCaptureTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().ok().and_then(|mut tx| tx.take()) {
            tx.send(()).ok();
        }
    }
}

impl Drop for CpalCaptureTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream(
    device: &cpal::Device,
    frame_tx: mpsc::Sender<PcmFrame>,
) -> Result<cpal::Stream, DeviceError> {
    let supported = device
        .default_input_config()
        .map_err(|e| classify(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let err_fn = move |err| {
        error!("Error on input stream: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                push_frame(&frame_tx, data.to_vec(), sample_rate, channels);
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let samples = data.iter().map(|&s| (s as i32 - 32768) as i16).collect();
                push_frame(&frame_tx, samples, sample_rate, channels);
            },
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let samples = data
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
                    .collect();
                push_frame(&frame_tx, samples, sample_rate, channels);
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(DeviceError::Backend(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    };
    Ok(stream)
}

fn push_frame(tx: &mpsc::Sender<PcmFrame>, samples: Vec<i16>, sample_rate: u32, channels: u16) {
    let frame = PcmFrame {
        samples,
        sample_rate,
        channels,
    };
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(frame) {
        warn!("capture queue full, dropping frame");
    }
}
