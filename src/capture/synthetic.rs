//! Test-pattern capture backend.
//!
//! Each source renders a solid colour derived from its id with a bar that
//! sweeps across the frame. Devices are exclusive: opening a source that is
//! still held by another device fails, the way a real camera node does. The
//! backend can also be scripted to refuse opens or to stop delivering frames,
//! which is what the controller tests lean on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use tracing::debug;

use super::{CaptureBackend, CaptureDevice, CaptureError, Frame, OpenRequest, SourceId};

const PALETTE: [[u8; 3]; 6] = [
    [200, 40, 40],
    [40, 160, 60],
    [40, 80, 200],
    [210, 180, 30],
    [150, 50, 170],
    [30, 170, 170],
];

#[derive(Default)]
struct Registry {
    open: HashSet<SourceId>,
    unavailable: HashSet<SourceId>,
    fail_after: HashMap<SourceId, u64>,
    open_count: HashMap<SourceId, u32>,
    open_delay: Duration,
    probe: Vec<SourceId>,
}

#[derive(Clone)]
pub struct SyntheticBackend {
    registry: Arc<Mutex<Registry>>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        let registry = Registry {
            probe: vec![SourceId::Index(0)],
            ..Default::default()
        };
        Self {
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse to open `source`.
    pub fn with_unavailable(self, source: impl Into<SourceId>) -> Self {
        self.set_unavailable(source, true);
        self
    }

    /// Deliver `frames` frames, then fail every read.
    pub fn with_read_failures_after(self, source: impl Into<SourceId>, frames: u64) -> Self {
        self.registry().fail_after.insert(source.into(), frames);
        self
    }

    /// Sources reported by [`CaptureBackend::probe`].
    pub fn with_probe(self, sources: Vec<SourceId>) -> Self {
        self.registry().probe = sources;
        self
    }

    /// Simulated time for a device to reach the streaming state.
    pub fn with_open_delay(self, delay: Duration) -> Self {
        self.registry().open_delay = delay;
        self
    }

    pub fn set_unavailable(&self, source: impl Into<SourceId>, unavailable: bool) {
        let source = source.into();
        let mut registry = self.registry();
        if unavailable {
            registry.unavailable.insert(source);
        } else {
            registry.unavailable.remove(&source);
        }
    }

    /// Whether a device for `source` is currently held.
    pub fn is_open(&self, source: &SourceId) -> bool {
        self.registry().open.contains(source)
    }

    /// Number of successful opens of `source` so far.
    pub fn open_count(&self, source: &SourceId) -> u32 {
        self.registry().open_count.get(source).copied().unwrap_or(0)
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&self, request: &OpenRequest) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        let source = request.source.clone();
        let (fail_after, open_delay) = {
            let mut registry = self.registry();
            if registry.unavailable.contains(&source) {
                return Err(CaptureError::Open {
                    id: source,
                    reason: "no such device".into(),
                });
            }
            if registry.open.contains(&source) {
                return Err(CaptureError::Open {
                    id: source,
                    reason: "device busy".into(),
                });
            }
            if registry.open_delay > request.ready_timeout {
                return Err(CaptureError::NotReady {
                    id: source,
                    timeout: request.ready_timeout,
                });
            }
            registry.open.insert(source.clone());
            *registry.open_count.entry(source.clone()).or_default() += 1;
            (registry.fail_after.get(&source).copied(), registry.open_delay)
        };

        if !open_delay.is_zero() {
            thread::sleep(open_delay);
        }

        debug!(
            "Synthetic source {} opened at {}x{}@{}",
            source, request.width, request.height, request.fps
        );

        Ok(Box::new(SyntheticDevice {
            color: color_for(&source),
            source,
            width: request.width,
            height: request.height,
            interval: Duration::from_secs(1) / request.fps.max(1),
            next_due: Instant::now(),
            produced: 0,
            fail_after,
            registry: Arc::clone(&self.registry),
        }))
    }

    fn probe(&self, limit: u32) -> Vec<SourceId> {
        self.registry()
            .probe
            .iter()
            .take(limit as usize)
            .cloned()
            .collect()
    }
}

fn color_for(source: &SourceId) -> [u8; 3] {
    let slot = match source {
        SourceId::Index(i) => *i as usize,
        SourceId::Uri(uri) => uri.bytes().map(usize::from).sum(),
    };
    PALETTE[slot % PALETTE.len()]
}

struct SyntheticDevice {
    source: SourceId,
    width: u32,
    height: u32,
    color: [u8; 3],
    interval: Duration,
    next_due: Instant,
    produced: u64,
    fail_after: Option<u64>,
    registry: Arc<Mutex<Registry>>,
}

impl SyntheticDevice {
    fn render(&self) -> RgbImage {
        let bar_width = (self.width / 16).max(1);
        let positions = u64::from((self.width / bar_width).max(1));
        let bar_x = (self.produced % positions) as u32 * bar_width;
        let color = Rgb(self.color);
        RgbImage::from_fn(self.width, self.height, |x, _| {
            if x >= bar_x && x < bar_x + bar_width {
                Rgb([255, 255, 255])
            } else {
                color
            }
        })
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CaptureError> {
        if self.fail_after.is_some_and(|limit| self.produced >= limit) {
            return Err(CaptureError::Disconnected);
        }

        let now = Instant::now();
        if self.next_due > now {
            let wait = self.next_due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return Ok(None);
            }
            thread::sleep(wait);
        }
        self.next_due = Instant::now() + self.interval;

        let frame = Frame::from_image(self.render());
        self.produced += 1;
        Ok(Some(frame))
    }
}

impl Drop for SyntheticDevice {
    fn drop(&mut self) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
            .remove(&self.source);
        debug!("Synthetic source {} released", self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(source: u32) -> OpenRequest {
        OpenRequest {
            source: SourceId::Index(source),
            width: 32,
            height: 24,
            fps: 200,
            ready_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn devices_are_exclusive_until_dropped() {
        let backend = SyntheticBackend::new();
        let device = backend.open(&request(0)).unwrap();
        assert!(backend.is_open(&SourceId::Index(0)));
        assert!(backend.open(&request(0)).is_err());

        drop(device);
        assert!(!backend.is_open(&SourceId::Index(0)));
        assert!(backend.open(&request(0)).is_ok());
        assert_eq!(backend.open_count(&SourceId::Index(0)), 2);
    }

    #[test]
    fn produces_frames_at_requested_size() {
        let backend = SyntheticBackend::new();
        let mut device = backend.open(&request(1)).unwrap();
        let frame = device
            .read_frame(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(frame.dimensions(), (32, 24));
        assert_eq!(frame.data.len(), 32 * 24 * 3);
    }

    #[test]
    fn scripted_failures() {
        let backend = SyntheticBackend::new()
            .with_unavailable(3)
            .with_read_failures_after(2, 1);

        assert!(matches!(
            backend.open(&request(3)),
            Err(CaptureError::Open { .. })
        ));

        let mut device = backend.open(&request(2)).unwrap();
        assert!(device.read_frame(Duration::from_millis(100)).is_ok());
        assert!(matches!(
            device.read_frame(Duration::from_millis(100)),
            Err(CaptureError::Disconnected)
        ));
    }

    #[test]
    fn slow_open_exceeding_ready_timeout_fails() {
        let backend = SyntheticBackend::new().with_open_delay(Duration::from_secs(5));
        assert!(matches!(
            backend.open(&request(0)),
            Err(CaptureError::NotReady { .. })
        ));
        assert!(!backend.is_open(&SourceId::Index(0)));
    }

    #[test]
    fn bar_wraps_on_long_running_sources() {
        let device = SyntheticDevice {
            source: SourceId::Index(9),
            width: 32,
            height: 4,
            color: [10, 20, 30],
            interval: Duration::from_millis(5),
            next_due: Instant::now(),
            produced: u64::MAX - 1,
            fail_after: None,
            registry: Arc::new(Mutex::new(Registry::default())),
        };

        // 16 bar positions of 2 px; u64::MAX - 1 is position 14.
        let image = device.render();
        assert_eq!(image.get_pixel(28, 0), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(29, 3), &Rgb([255, 255, 255]));
        assert_eq!(image.get_pixel(30, 0), &Rgb([10, 20, 30]));
    }
}
