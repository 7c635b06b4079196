//! Per-frame detection.
//!
//! A [`Detector`] is the black-box model. The [`DetectionHook`] wraps it for
//! the capture loop: it filters raw detections, turns them into
//! [`DetectionEvent`]s, draws them onto the frame and fans the events out to
//! the [`DetectionHistory`](crate::pipeline::DetectionHistory) and an
//! [`EventSink`].

pub mod hook;
pub mod motion;
pub mod sink;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{Frame, SourceId};

pub use hook::DetectionHook;
pub use motion::MotionDetector;
pub use sink::{EventSink, LogSink, QueuedSink, SinkError};

#[cfg(feature = "mqtt")]
pub use sink::MqttSink;

/// Axis-aligned box in source-frame pixel coordinates, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    /// Clip to a `width` x `height` frame.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        Self::new(
            self.x1.min(width),
            self.y1.min(height),
            self.x2.min(width),
            self.y2.min(height),
        )
    }
}

/// Raw detector output for one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

/// One detection attributed to a camera at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub camera: SourceId,
    pub label: String,
    /// 0.0 - 1.0
    pub confidence: f32,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
    pub timestamp: DateTime<Utc>,
}

impl DetectionEvent {
    pub fn new(camera: SourceId, detection: Detection) -> Self {
        Self {
            camera,
            label: detection.label,
            confidence: detection.confidence.clamp(0.0, 1.0),
            bbox: detection.bbox,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),
}

/// Object detector invoked synchronously from a capture thread.
///
/// Shared by every source, so implementations keep any per-source state
/// behind their own synchronization.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, source: &SourceId, frame: &Frame) -> Result<Vec<Detection>, DetectError>;
}
