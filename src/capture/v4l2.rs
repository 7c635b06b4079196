//! V4L2 capture with memory-mapped streaming

use std::io;
use std::time::{Duration, Instant};

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    decoder, CaptureBackend, CaptureDevice, CaptureError, Frame, OpenRequest, PixelFormat,
    SourceId,
};

const BUFFER_COUNT: u32 = 4;

/// Opens `/dev/video<N>` nodes (or explicit `/dev/...` paths).
pub struct V4l2Backend;

impl CaptureBackend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    #[instrument(skip(self), fields(source = %request.source))]
    fn open(&self, request: &OpenRequest) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let started = Instant::now();
        let open_err = |reason: String| CaptureError::Open {
            id: request.source.clone(),
            reason,
        };

        let device = match &request.source {
            SourceId::Index(index) => Device::new(*index as usize),
            SourceId::Uri(path) if path.starts_with("/dev/") => Device::with_path(path),
            SourceId::Uri(uri) => return Err(open_err(format!("not a V4L2 node: {}", uri))),
        }
        .map_err(|e| open_err(e.to_string()))?;

        let caps = device.query_caps().map_err(|e| open_err(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(open_err("device doesn't support video capture".into()));
        }

        let format = negotiate_format(&device, request).map_err(|e| open_err(e.to_string()))?;

        if let Err(e) = device.set_params(&Parameters::with_fps(request.fps)) {
            warn!("Source {} rejected {} fps: {}", request.source, request.fps, e);
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| open_err(e.to_string()))?;
        stream.set_timeout(request.ready_timeout);

        if started.elapsed() > request.ready_timeout {
            return Err(CaptureError::NotReady {
                id: request.source.clone(),
                timeout: request.ready_timeout,
            });
        }

        info!(
            "Capture stream started with {} buffers ({:?} {}x{})",
            BUFFER_COUNT, format.pixel_format, format.width, format.height
        );

        Ok(Box::new(V4l2Device {
            stream,
            width: format.width,
            height: format.height,
            format: format.pixel_format,
            _device: device,
        }))
    }

    fn probe(&self, limit: u32) -> Vec<SourceId> {
        crate::utils::probe_capture_devices(limit)
    }
}

struct Negotiated {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// Prefer MJPEG, fall back to YUYV, then RGB3.
fn negotiate_format(device: &Device, request: &OpenRequest) -> io::Result<Negotiated> {
    let candidates = [
        (FourCC::new(b"MJPG"), PixelFormat::Mjpeg),
        (FourCC::new(b"YUYV"), PixelFormat::Yuyv),
        (FourCC::new(b"RGB3"), PixelFormat::Rgb24),
    ];

    for (fourcc, pixel_format) in candidates {
        let mut fmt = device.format()?;
        fmt.width = request.width;
        fmt.height = request.height;
        fmt.fourcc = fourcc;

        let applied = device.set_format(&fmt)?;
        if applied.fourcc == fourcc {
            return Ok(Negotiated {
                width: applied.width,
                height: applied.height,
                pixel_format,
            });
        }
    }

    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no supported pixel format",
    ))
}

struct V4l2Device {
    // Declared before the device so the buffers are unmapped first.
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
    _device: Device,
}

impl CaptureDevice for V4l2Device {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CaptureError> {
        self.stream.set_timeout(timeout);

        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) if e.raw_os_error() == Some(19) => return Err(CaptureError::Disconnected), // ENODEV
            Err(e) => return Err(CaptureError::Read(e.to_string())),
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let image = decoder::decode_frame(&buf[..used], self.width, self.height, self.format)?;
        let device_ts = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);

        Ok(Some(Frame::from_image(image).with_device_timestamp(device_ts)))
    }
}
