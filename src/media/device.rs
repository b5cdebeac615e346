use crate::error::MediaAcquisitionError;
use crate::PcmFrame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

/// Failure reported by an audio backend when enumerating or opening a device.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl DeviceError {
    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::PermissionDenied => "permission-denied",
            DeviceError::NotFound(_) => "no-device-found",
            DeviceError::Backend(_) => "unknown",
        }
    }
}

impl From<DeviceError> for MediaAcquisitionError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::PermissionDenied => MediaAcquisitionError::PermissionDenied,
            DeviceError::NotFound(_) => MediaAcquisitionError::NoDevice,
            DeviceError::Backend(detail) => MediaAcquisitionError::Unknown(detail),
        }
    }
}

/// One live capture track. Stopping must be idempotent.
pub trait CaptureTrack: Send + Sync {
    fn id(&self) -> &str;
    fn stop(&self);
}

pub struct OpenedInput {
    pub device: DeviceDescriptor,
    pub track: Box<dyn CaptureTrack>,
    pub frames: mpsc::Receiver<PcmFrame>,
}

/// Platform audio input. Calls may block and are run off the async runtime.
pub trait AudioBackend: Send + Sync {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;
    /// `None` opens the platform default input.
    fn open_input(&self, device_id: Option<&str>) -> Result<OpenedInput, DeviceError>;
}

struct StreamInner {
    id: String,
    device: DeviceDescriptor,
    tracks: Mutex<Vec<Box<dyn CaptureTrack>>>,
    frames: Mutex<Option<mpsc::Receiver<PcmFrame>>>,
    live_tracks: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl StreamInner {
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracks = match self.tracks.lock() {
            Ok(mut tracks) => std::mem::take(&mut *tracks),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for track in tracks.iter() {
            track.stop();
            self.live_tracks.fetch_sub(1, Ordering::SeqCst);
        }
        if let Ok(mut frames) = self.frames.lock() {
            frames.take();
        }
        info!(stream_id = self.id, tracks = tracks.len(), "local media stream released");
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle to an acquired microphone stream. Clones share the same tracks.
#[derive(Clone)]
pub struct LocalMediaStream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for LocalMediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaStream")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl LocalMediaStream {
    fn new(opened: OpenedInput, live_tracks: Arc<AtomicUsize>) -> Self {
        live_tracks.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::new(StreamInner {
                id: uuid::Uuid::new_v4().to_string(),
                device: opened.device,
                tracks: Mutex::new(vec![opened.track]),
                frames: Mutex::new(Some(opened.frames)),
                live_tracks,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.inner.device
    }

    /// Hand the captured frames to the uplink. Only the first caller gets them.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<PcmFrame>> {
        self.inner.frames.lock().ok().and_then(|mut f| f.take())
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    fn downgrade(&self) -> Weak<StreamInner> {
        Arc::downgrade(&self.inner)
    }
}

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone)]
pub enum MicrophoneAcquisition {
    Granted(LocalMediaStream),
    Denied,
    NoDevice,
    Error(String),
}

impl MicrophoneAcquisition {
    pub fn into_result(self) -> Result<LocalMediaStream, MediaAcquisitionError> {
        match self {
            MicrophoneAcquisition::Granted(stream) => Ok(stream),
            MicrophoneAcquisition::Denied => Err(MediaAcquisitionError::PermissionDenied),
            MicrophoneAcquisition::NoDevice => Err(MediaAcquisitionError::NoDevice),
            MicrophoneAcquisition::Error(detail) => Err(MediaAcquisitionError::Unknown(detail)),
        }
    }
}

impl From<DeviceError> for MicrophoneAcquisition {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::PermissionDenied => MicrophoneAcquisition::Denied,
            DeviceError::NotFound(_) => MicrophoneAcquisition::NoDevice,
            DeviceError::Backend(detail) => MicrophoneAcquisition::Error(detail),
        }
    }
}

/// Pick an input device: remembered id, then label heuristics, then the first
/// non-default device, then whatever comes first.
pub fn select_device<'a>(
    devices: &'a [DeviceDescriptor],
    remembered: Option<&str>,
    preferred_label: Option<&str>,
) -> Option<&'a DeviceDescriptor> {
    if let Some(id) = remembered {
        if let Some(device) = devices.iter().find(|d| d.id == id) {
            return Some(device);
        }
    }
    let labels = preferred_label
        .filter(|l| !l.trim().is_empty())
        .into_iter()
        .chain(["usb", "communications"]);
    for label in labels {
        let needle = label.to_lowercase();
        if let Some(device) = devices
            .iter()
            .find(|d| d.label.to_lowercase().contains(&needle))
        {
            return Some(device);
        }
    }
    devices
        .iter()
        .find(|d| !d.is_default)
        .or_else(|| devices.first())
}

struct DeviceAccessInner {
    backend: Box<dyn AudioBackend>,
    preferred_label: Option<String>,
    remembered: Mutex<Option<String>>,
    permission_granted: AtomicBool,
    live_tracks: Arc<AtomicUsize>,
    last_stream: Mutex<Option<Weak<StreamInner>>>,
}

/// Enumerates inputs and acquires microphone streams.
#[derive(Clone)]
pub struct DeviceAccess {
    inner: Arc<DeviceAccessInner>,
}

impl DeviceAccess {
    pub fn new(backend: Box<dyn AudioBackend>, preferred_label: Option<String>) -> Self {
        Self {
            inner: Arc::new(DeviceAccessInner {
                backend,
                preferred_label,
                remembered: Mutex::new(None),
                permission_granted: AtomicBool::new(false),
                live_tracks: Arc::new(AtomicUsize::new(0)),
                last_stream: Mutex::new(None),
            }),
        }
    }

    pub fn permission_granted(&self) -> bool {
        self.inner.permission_granted.load(Ordering::SeqCst)
    }

    /// Number of capture tracks acquired and not yet stopped.
    pub fn active_track_count(&self) -> usize {
        self.inner.live_tracks.load(Ordering::SeqCst)
    }

    pub fn remember_device(&self, device_id: Option<String>) {
        if let Ok(mut remembered) = self.inner.remembered.lock() {
            *remembered = device_id;
        }
    }

    pub fn remembered_device(&self) -> Option<String> {
        self.inner.remembered.lock().ok().and_then(|r| r.clone())
    }

    /// Until a stream has been granted once, only generic identifiers are exposed.
    pub fn list_input_devices(&self) -> Vec<DeviceDescriptor> {
        let devices = match self.inner.backend.input_devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("failed to enumerate input devices: {}", e);
                return vec![];
            }
        };
        if self.permission_granted() {
            return devices;
        }
        devices
            .into_iter()
            .enumerate()
            .map(|(i, d)| DeviceDescriptor {
                id: format!("input-{}", i),
                label: String::new(),
                is_default: d.is_default,
            })
            .collect()
    }

    fn release_previous(&self) {
        let previous = self
            .inner
            .last_stream
            .lock()
            .ok()
            .and_then(|mut last| last.take())
            .and_then(|weak| weak.upgrade());
        if let Some(inner) = previous {
            debug!(stream_id = inner.id, "stopping previous stream before acquiring");
            inner.stop();
        }
    }

    fn open(&self, device_id: Option<&str>) -> Result<LocalMediaStream, DeviceError> {
        let opened = self.inner.backend.open_input(device_id)?;
        self.inner.permission_granted.store(true, Ordering::SeqCst);
        let stream = LocalMediaStream::new(opened, self.inner.live_tracks.clone());
        if let Ok(mut last) = self.inner.last_stream.lock() {
            *last = Some(stream.downgrade());
        }
        Ok(stream)
    }

    fn acquire_blocking(&self, preferred_device_id: Option<String>) -> MicrophoneAcquisition {
        self.release_previous();

        let pinned = preferred_device_id.or_else(|| self.remembered_device());
        let devices = match self.inner.backend.input_devices() {
            Ok(devices) => devices,
            Err(e) => return e.into(),
        };
        if devices.is_empty() {
            return MicrophoneAcquisition::NoDevice;
        }
        let target = match pinned {
            Some(id) => Some(id),
            None => select_device(&devices, None, self.inner.preferred_label.as_deref())
                .map(|d| d.id.clone()),
        };

        match self.open(target.as_deref()) {
            Ok(stream) => {
                info!(device = stream.device().label, "microphone acquired");
                MicrophoneAcquisition::Granted(stream)
            }
            Err(DeviceError::NotFound(id)) if target.is_some() => {
                warn!(device = id, "selected device is gone, retrying with the default input");
                if self.remembered_device() == target {
                    self.remember_device(None);
                }
                match self.open(None) {
                    Ok(stream) => MicrophoneAcquisition::Granted(stream),
                    Err(e) => e.into(),
                }
            }
            Err(e) => {
                warn!("microphone acquisition failed: {}", e);
                e.into()
            }
        }
    }

    /// Acquire a microphone stream. Any stream acquired earlier is stopped first.
    pub async fn acquire_stream(&self, preferred_device_id: Option<String>) -> MicrophoneAcquisition {
        let access = self.clone();
        match tokio::task::spawn_blocking(move || access.acquire_blocking(preferred_device_id))
            .await
        {
            Ok(result) => result,
            Err(e) => MicrophoneAcquisition::Error(e.to_string()),
        }
    }
}
