pub mod capture;
pub mod controller;
pub mod detect;
pub mod error;
pub mod pipeline;
pub mod transport;
pub mod utils;

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capture::SourceId;

pub use controller::{SourceStatus, StreamController, StreamSnapshot, StreamState, StreamStatus};
pub use error::{ConfigError, StreamError};

pub const MIN_WIDTH: u32 = 160;
pub const MAX_WIDTH: u32 = 1920;
pub const MIN_HEIGHT: u32 = 120;
pub const MAX_HEIGHT: u32 = 1080;
pub const MIN_FPS: u32 = 1;
pub const MAX_FPS: u32 = 60;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamSettings,
    pub capture: CaptureConfig,
    pub compositor: CompositorConfig,
    pub detection: DetectionConfig,
    pub events: EventsConfig,
    pub controller: ControllerConfig,
}

/// Requested stream parameters. Also the unit of `reconfigure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Canvas size of one mosaic cell
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Ordered source list; empty means probe for devices.
    pub sources: Vec<SourceId>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            sources: Vec::new(),
        }
    }
}

impl StreamSettings {
    pub fn new(width: u32, height: u32, fps: u32, sources: Vec<SourceId>) -> Self {
        Self {
            width,
            height,
            fps,
            sources,
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&self.width) {
            return Err(StreamError::InvalidConfig(format!(
                "width {} outside {}..={}",
                self.width, MIN_WIDTH, MAX_WIDTH
            )));
        }
        if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&self.height) {
            return Err(StreamError::InvalidConfig(format!(
                "height {} outside {}..={}",
                self.height, MIN_HEIGHT, MAX_HEIGHT
            )));
        }
        if !(MIN_FPS..=MAX_FPS).contains(&self.fps) {
            return Err(StreamError::InvalidConfig(format!(
                "fps {} outside {}..={}",
                self.fps, MIN_FPS, MAX_FPS
            )));
        }

        let mut seen = HashSet::new();
        if let Some(duplicate) = self.sources.iter().find(|id| !seen.insert(*id)) {
            return Err(StreamError::InvalidConfig(format!(
                "source {} listed more than once",
                duplicate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Generated test pattern
    Synthetic,
    V4l2,
    Gstreamer,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "v4l2") {
            BackendKind::V4l2
        } else if cfg!(feature = "gstreamer-pipeline") {
            BackendKind::Gstreamer
        } else {
            BackendKind::Synthetic
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    pub ready_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_read_retries: u32,
    pub retry_backoff_ms: u64,
    pub stop_timeout_ms: u64,
    /// Device indices tried when no sources are configured
    pub probe_limit: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            ready_timeout_ms: 5000,
            read_timeout_ms: 1000,
            max_read_retries: 5,
            retry_backoff_ms: 100,
            stop_timeout_ms: 3000,
            probe_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositorConfig {
    pub idle_interval_ms: u64,
    pub failure_backoff_ms: u64,
    pub jpeg_quality: u8,
    /// Encoded composites buffered for the consumer
    pub output_queue: usize,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 10,
            failure_backoff_ms: 100,
            jpeg_quality: 80,
            output_queue: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub history_capacity: usize,
    pub min_confidence: f32,
    /// Minimum box side in pixels
    pub min_box_size: u32,
    /// Run the detector on every n-th frame of a source
    pub detect_every: u32,
    pub annotate: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 50,
            min_confidence: 0.2,
            min_box_size: 10,
            detect_every: 1,
            annotate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub queue_capacity: usize,
    pub mqtt: Option<MqttConfig>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            mqtt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            topic: "multicam/detections".into(),
            client_id: "multicam".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Pause between teardown and rebuild so devices settle
    pub settle_delay_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1000,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file at `path` if given, then `MULTICAM__*`
    /// environment variables (`MULTICAM__STREAM__FPS=15`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("MULTICAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        self.stream.validate()?;

        let nonzero = [
            ("detection.history_capacity", self.detection.history_capacity),
            ("compositor.output_queue", self.compositor.output_queue),
            ("events.queue_capacity", self.events.queue_capacity),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(StreamError::InvalidConfig(format!("{} must be non-zero", name)));
        }
        if !(1..=100).contains(&self.compositor.jpeg_quality) {
            return Err(StreamError::InvalidConfig(format!(
                "compositor.jpeg_quality {} outside 1..=100",
                self.compositor.jpeg_quality
            )));
        }
        if !(0.0..=1.0).contains(&self.detection.min_confidence) {
            return Err(StreamError::InvalidConfig(format!(
                "detection.min_confidence {} outside 0..=1",
                self.detection.min_confidence
            )));
        }
        Ok(())
    }
}
