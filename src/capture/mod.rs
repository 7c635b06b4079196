//! Capture devices and the backends that open them.
//!
//! A [`CaptureBackend`] turns an [`OpenRequest`] into an exclusively owned
//! [`CaptureDevice`]. Dropping the device releases the underlying handle.

pub mod decoder;
pub mod frame;
pub mod synthetic;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use synthetic::SyntheticBackend;

use crate::BackendKind;

/// Stable identity of one camera: a device index or a URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    Index(u32),
    Uri(String),
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Index(i) => write!(f, "{}", i),
            SourceId::Uri(uri) => f.write_str(uri),
        }
    }
}

impl FromStr for SourceId {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CaptureError::InvalidSource(s.to_string()));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse()
                .map(SourceId::Index)
                .map_err(|_| CaptureError::InvalidSource(s.to_string()));
        }
        Ok(SourceId::Uri(s.to_string()))
    }
}

impl From<u32> for SourceId {
    fn from(index: u32) -> Self {
        SourceId::Index(index)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawSourceId {
    Index(u32),
    Text(String),
}

impl Serialize for SourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SourceId::Index(i) => RawSourceId::Index(*i).serialize(serializer),
            SourceId::Uri(uri) => RawSourceId::Text(uri.clone()).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for SourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawSourceId::deserialize(deserializer)? {
            RawSourceId::Index(i) => Ok(SourceId::Index(i)),
            RawSourceId::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Everything a backend needs to open one device.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub source: SourceId,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Upper bound for the device to reach a streaming state.
    pub ready_timeout: Duration,
}

/// Factory for capture devices.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a device exclusively. Fails if it cannot be opened or does not
    /// become ready within `request.ready_timeout`.
    fn open(&self, request: &OpenRequest) -> Result<Box<dyn CaptureDevice>, CaptureError>;

    /// Discover usable sources among the first `limit` device indices.
    fn probe(&self, limit: u32) -> Vec<SourceId> {
        crate::utils::probe_video_devices(limit)
    }
}

/// One open device. Released on drop.
pub trait CaptureDevice: Send {
    /// Pull the next frame as RGB24. `Ok(None)` means nothing arrived within
    /// `timeout`.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CaptureError>;
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot open source {id}: {reason}")]
    Open { id: SourceId, reason: String },

    #[error("source {id} not ready after {timeout:?}")]
    NotReady { id: SourceId, timeout: Duration },

    #[error("read failed: {0}")]
    Read(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("frame buffer has {actual} bytes, expected {expected}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("invalid source id: {0:?}")]
    InvalidSource(String),

    #[error("backend {0} not compiled in")]
    BackendUnavailable(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the backend selected in configuration.
pub fn backend_for(kind: BackendKind) -> Result<Arc<dyn CaptureBackend>, CaptureError> {
    match kind {
        BackendKind::Synthetic => Ok(Arc::new(SyntheticBackend::new())),
        #[cfg(feature = "v4l2")]
        BackendKind::V4l2 => Ok(Arc::new(v4l2::V4l2Backend)),
        #[cfg(not(feature = "v4l2"))]
        BackendKind::V4l2 => Err(CaptureError::BackendUnavailable("v4l2")),
        #[cfg(feature = "gstreamer-pipeline")]
        BackendKind::Gstreamer => Ok(Arc::new(gst_capture::GstBackend::new()?)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        BackendKind::Gstreamer => Err(CaptureError::BackendUnavailable("gstreamer")),
    }
}
