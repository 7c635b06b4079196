//! GStreamer-based capture with platform video sources

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, info, warn};

use super::{CaptureBackend, CaptureDevice, CaptureError, Frame, OpenRequest, SourceId};

/// Builds one `... ! appsink` pipeline per source.
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> Result<Self, CaptureError> {
        gst::init().map_err(|e| CaptureError::Read(format!("Failed to initialize GStreamer: {}", e)))?;
        Ok(Self)
    }

    /// Platform source element for a device index.
    fn video_source(index: u32) -> String {
        if cfg!(target_os = "macos") {
            format!("avfvideosrc device-index={}", index)
        } else if cfg!(target_os = "windows") {
            format!("dshowvideosrc device-index={}", index)
        } else {
            format!("v4l2src device=/dev/video{}", index)
        }
    }

    /// Raw RGB out of an appsink that keeps only the newest buffer.
    fn build_pipeline_string(request: &OpenRequest) -> String {
        let sink = "appsink name=appsink emit-signals=false max-buffers=1 drop=true sync=false";
        match &request.source {
            SourceId::Index(index) => format!(
                "{} ! video/x-raw,width={},height={},framerate={}/1 ! \
                 videoconvert ! video/x-raw,format=RGB ! {}",
                Self::video_source(*index),
                request.width,
                request.height,
                request.fps,
                sink
            ),
            SourceId::Uri(uri) => format!(
                "uridecodebin uri={} ! videoconvert ! videoscale ! \
                 video/x-raw,format=RGB,width={},height={} ! {}",
                uri, request.width, request.height, sink
            ),
        }
    }
}

impl CaptureBackend for GstBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn open(&self, request: &OpenRequest) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let open_err = |reason: String| CaptureError::Open {
            id: request.source.clone(),
            reason,
        };

        let pipeline_str = Self::build_pipeline_string(request);
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_err(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_err("Failed to create pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| open_err("Failed to find appsink element".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_err("Failed to cast to AppSink".into()))?;

        // From here on the pipeline is torn down by Drop on every exit path.
        let device = GstDevice { pipeline, appsink };

        device
            .pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_err(format!("Failed to start pipeline: {:?}", e)))?;

        let timeout = gst::ClockTime::from_mseconds(request.ready_timeout.as_millis() as u64);
        let (state_change, current, _) = device.pipeline.state(Some(timeout));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Pipeline for source {} is {:?}", request.source, current);
                Ok(Box::new(device))
            }
            Ok(gst::StateChangeSuccess::Async) => Err(CaptureError::NotReady {
                id: request.source.clone(),
                timeout: request.ready_timeout,
            }),
            Err(e) => Err(open_err(format!("{:?}", e))),
        }
    }
}

struct GstDevice {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
}

impl GstDevice {
    fn pending_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }
}

impl CaptureDevice for GstDevice {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CaptureError> {
        if let Some(err) = self.pending_error() {
            return Err(CaptureError::Read(err));
        }

        let timeout = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(Some(timeout)) else {
            if self.appsink.is_eos() {
                return Err(CaptureError::Disconnected);
            }
            return Ok(None);
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::Read("Sample contains no buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::Read("Sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| CaptureError::Read("Failed to parse video info from caps".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::Read("Failed to map buffer".into()))?;

        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0] as usize;
        let row = width as usize * 3;
        let data = map.as_slice();

        // Rows may be padded to the stride; repack them tightly.
        let mut pixels = Vec::with_capacity(row * height as usize);
        for y in 0..height as usize {
            let start = y * stride;
            let line = data.get(start..start + row).ok_or(CaptureError::InvalidFrame {
                expected: stride * height as usize,
                actual: data.len(),
            })?;
            pixels.extend_from_slice(line);
        }

        let image = RgbImage::from_raw(width, height, pixels).ok_or(CaptureError::InvalidFrame {
            expected: row * height as usize,
            actual: data.len(),
        })?;

        let mut frame = Frame::from_image(image);
        if let Some(pts) = buffer.pts() {
            frame = frame.with_device_timestamp(Duration::from_nanos(pts.nseconds()));
        }
        Ok(Some(frame))
    }
}

impl Drop for GstDevice {
    fn drop(&mut self) {
        debug!("Stopping GStreamer pipeline");
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}
