//! Mosaic of the latest frame from every active source.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::{Frame, PixelFormat, SourceId};
use crate::controller::StreamSnapshot;
use crate::CompositorConfig;

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("mosaic of {columns}x{rows} cells at {width}x{height} is too large")]
    TooLarge {
        columns: u32,
        rows: u32,
        width: u32,
        height: u32,
    },

    #[error("cannot composite {0:?} frames")]
    UnsupportedFrame(PixelFormat),

    #[error("encode failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("compositing panicked: {0}")]
    Panicked(String),
}

/// Cell arrangement for a number of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridLayout {
    pub columns: u32,
    pub rows: u32,
}

impl GridLayout {
    /// One frame fills the canvas, two sit side by side, anything more goes
    /// into a `ceil(sqrt(n))` square filled row-major.
    pub fn for_count(count: usize) -> Option<Self> {
        let count = u32::try_from(count).ok()?;
        match count {
            0 => None,
            1 => Some(Self { columns: 1, rows: 1 }),
            2 => Some(Self { columns: 2, rows: 1 }),
            n => {
                let mut side = 1;
                while side * side < n {
                    side += 1;
                }
                Some(Self {
                    columns: side,
                    rows: side,
                })
            }
        }
    }

    pub fn cells(&self) -> usize {
        (self.columns * self.rows) as usize
    }
}

/// One encoded mosaic.
#[derive(Debug, Clone)]
pub struct Composite {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub layout: GridLayout,
    /// Sources in cell order.
    pub sources: Vec<SourceId>,
    /// Counts composites emitted by this compositor run.
    pub sequence: u64,
    pub timestamp: Instant,
}

/// Arranges frames on a grid of canvas-sized cells.
#[derive(Debug, Clone)]
pub struct Compositor {
    cell_width: u32,
    cell_height: u32,
    jpeg_quality: u8,
}

impl Compositor {
    pub fn new(cell_width: u32, cell_height: u32, jpeg_quality: u8) -> Self {
        Self {
            cell_width,
            cell_height,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn cell_size(&self) -> (u32, u32) {
        (self.cell_width, self.cell_height)
    }

    /// Resize every frame to the cell size and tile them. Unused cells stay
    /// black. `None` for an empty input.
    pub fn compose(&self, frames: &[Arc<Frame>]) -> Result<Option<(RgbImage, GridLayout)>, CompositeError> {
        let Some(layout) = GridLayout::for_count(frames.len()) else {
            return Ok(None);
        };

        let too_large = || CompositeError::TooLarge {
            columns: layout.columns,
            rows: layout.rows,
            width: self.cell_width,
            height: self.cell_height,
        };
        let width = layout.columns.checked_mul(self.cell_width).ok_or_else(too_large)?;
        let height = layout.rows.checked_mul(self.cell_height).ok_or_else(too_large)?;
        if (width as u64) * (height as u64) * 3 > isize::MAX as u64 {
            return Err(too_large());
        }

        let mut canvas = RgbImage::new(width, height);
        for (i, frame) in frames.iter().enumerate() {
            let column = i as u32 % layout.columns;
            let row = i as u32 / layout.columns;
            let x = i64::from(column * self.cell_width);
            let y = i64::from(row * self.cell_height);

            let view = frame
                .view()
                .ok_or(CompositeError::UnsupportedFrame(frame.meta.format))?;
            if view.dimensions() == (self.cell_width, self.cell_height) {
                imageops::replace(&mut canvas, &view, x, y);
            } else {
                let tile = imageops::resize(&view, self.cell_width, self.cell_height, FilterType::Triangle);
                imageops::replace(&mut canvas, &tile, x, y);
            }
        }

        Ok(Some((canvas, layout)))
    }

    /// Compose and encode in one go.
    pub fn render(&self, frames: &[Arc<Frame>]) -> Result<Option<(Bytes, GridLayout)>, CompositeError> {
        let Some((image, layout)) = self.compose(frames)? else {
            return Ok(None);
        };
        Ok(Some((self.encode(&image)?, layout)))
    }

    pub fn encode(&self, image: &RgbImage) -> Result<Bytes, CompositeError> {
        let mut jpeg = Vec::with_capacity(image.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality).encode_image(image)?;
        Ok(Bytes::from(jpeg))
    }
}

/// Handle on the running compositor thread.
pub struct CompositorHandle {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CompositorHandle {
    /// Start compositing whatever `shared` lists as active, pushing results
    /// into the `output` queue and mirroring the newest into `latest`. The
    /// receiver half lets a full queue evict its oldest entry.
    pub fn spawn(
        shared: Arc<ArcSwap<StreamSnapshot>>,
        output: (flume::Sender<Composite>, flume::Receiver<Composite>),
        latest: Arc<ArcSwapOption<Composite>>,
        config: CompositorConfig,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let compositing = Compositing {
            shared,
            output: output.0,
            backlog: output.1,
            latest,
            stop: Arc::clone(&stop),
            idle: Duration::from_millis(config.idle_interval_ms),
            failure_backoff: Duration::from_millis(config.failure_backoff_ms),
            jpeg_quality: config.jpeg_quality,
        };

        let handle = thread::Builder::new()
            .name("compositor".into())
            .spawn(move || compositing.run())?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Compositor thread panicked");
            }
        }
    }
}

impl Drop for CompositorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Compositing {
    shared: Arc<ArcSwap<StreamSnapshot>>,
    output: flume::Sender<Composite>,
    backlog: flume::Receiver<Composite>,
    latest: Arc<ArcSwapOption<Composite>>,
    stop: Arc<AtomicBool>,
    idle: Duration,
    failure_backoff: Duration,
    jpeg_quality: u8,
}

impl Compositing {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn run(self) {
        info!("Compositor started");
        let mut emitted = 0u64;
        let mut last_marks: Vec<(SourceId, u64)> = Vec::new();

        while !self.stopped() {
            let cycle_start = Instant::now();
            let snapshot = self.shared.load_full();

            let (ids, frames): (Vec<SourceId>, Vec<Arc<Frame>>) = snapshot
                .sources
                .iter()
                .filter_map(|source| source.slot.read_latest().map(|f| (source.id.clone(), f)))
                .unzip();

            let marks: Vec<(SourceId, u64)> = ids
                .iter()
                .cloned()
                .zip(frames.iter().map(|f| f.sequence()))
                .collect();
            if frames.is_empty() || marks == last_marks {
                self.pause(self.idle);
                continue;
            }

            let compositor = Compositor::new(
                snapshot.settings.width,
                snapshot.settings.height,
                self.jpeg_quality,
            );
            let result = panic::catch_unwind(AssertUnwindSafe(|| compositor.render(&frames)))
                .unwrap_or_else(|panic| Err(CompositeError::Panicked(panic_message(&*panic))));

            let (jpeg, layout) = match result {
                Ok(Some(encoded)) => encoded,
                Ok(None) => {
                    self.pause(self.idle);
                    continue;
                }
                Err(e) => {
                    warn!("Frame combine error: {}", e);
                    metrics::counter!("composite_failures").increment(1);
                    self.pause(self.failure_backoff);
                    continue;
                }
            };

            let (cell_width, cell_height) = compositor.cell_size();
            if let Some(oldest) = frames.iter().map(|f| f.age()).max() {
                metrics::histogram!("composite_frame_age_us").record(oldest.as_micros() as f64);
            }

            emitted += 1;
            last_marks = marks;
            let composite = Composite {
                jpeg,
                width: layout.columns * cell_width,
                height: layout.rows * cell_height,
                layout,
                sources: ids,
                sequence: emitted,
                timestamp: Instant::now(),
            };
            self.latest.store(Some(Arc::new(composite.clone())));
            self.push(composite);

            metrics::histogram!("composite_time_us").record(cycle_start.elapsed().as_micros() as f64);
            metrics::counter!("composites_emitted").increment(1);

            let interval = Duration::from_secs(1) / snapshot.settings.fps.max(1);
            if let Some(rest) = interval.checked_sub(cycle_start.elapsed()) {
                self.pause(rest);
            }
        }

        info!("Compositor stopped after {} composites", emitted);
    }

    fn push(&self, composite: Composite) {
        let evicted = push_evicting(&self.output, &self.backlog, composite);
        if evicted > 0 {
            debug!("Output queue full, evicted {} stale composites", evicted);
            metrics::counter!("composites_dropped").increment(evicted);
        }
    }
}

/// Queue `composite`, evicting the oldest entries while the queue is full.
/// Returns how many were evicted.
fn push_evicting(
    output: &flume::Sender<Composite>,
    backlog: &flume::Receiver<Composite>,
    composite: Composite,
) -> u64 {
    let mut evicted = 0;
    let mut pending = composite;
    loop {
        match output.try_send(pending) {
            Ok(()) => return evicted,
            Err(flume::TrySendError::Full(back)) => {
                if backlog.try_recv().is_ok() {
                    evicted += 1;
                }
                pending = back;
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                debug!("Composite output has no receivers");
                return evicted;
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}
