//! One camera: an exclusively owned capture device and its acquisition thread.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::FrameSlot;
use crate::capture::{CaptureBackend, CaptureDevice, CaptureError, OpenRequest, SourceId};
use crate::detect::DetectionHook;
use crate::error::StreamError;
use crate::CaptureConfig;

/// Health of a running source as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    /// Opened, no frame yet.
    Starting,
    Healthy,
    /// Reads keep failing; the source stays active but publishes nothing new.
    Degraded,
    Stopped,
}

/// Lock-free health cell shared between the capture thread and observers.
#[derive(Debug)]
pub struct HealthCell(AtomicU8);

impl HealthCell {
    fn new(health: SourceHealth) -> Self {
        Self(AtomicU8::new(health as u8))
    }

    pub fn get(&self) -> SourceHealth {
        match self.0.load(Ordering::Acquire) {
            0 => SourceHealth::Starting,
            1 => SourceHealth::Healthy,
            2 => SourceHealth::Degraded,
            _ => SourceHealth::Stopped,
        }
    }

    fn set(&self, health: SourceHealth) {
        self.0.store(health as u8, Ordering::Release);
    }
}

/// Read-only handle on a running source, safe to hand to other threads.
#[derive(Debug, Clone)]
pub struct SourceView {
    pub id: SourceId,
    pub slot: Arc<FrameSlot>,
    health: Arc<HealthCell>,
}

impl SourceView {
    pub fn health(&self) -> SourceHealth {
        self.health.get()
    }
}

/// Acquisition loop tunables.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub ready_timeout: Duration,
    pub read_timeout: Duration,
    /// Consecutive failed reads before the source is reported degraded.
    pub max_read_retries: u32,
    pub retry_backoff: Duration,
    pub stop_timeout: Duration,
}

impl From<&CaptureConfig> for SourceOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            max_read_retries: config.max_read_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    /// Disconnects when the thread has dropped its device and exited.
    exited: flume::Receiver<()>,
}

pub struct CameraSource {
    id: SourceId,
    width: u32,
    height: u32,
    fps: u32,
    slot: Arc<FrameSlot>,
    health: Arc<HealthCell>,
    stop: Arc<AtomicBool>,
    worker: Option<Worker>,
    stop_timeout: Duration,
}

impl CameraSource {
    /// Open the device and start the acquisition thread.
    #[instrument(skip_all, fields(source = %request.source))]
    pub fn start(
        request: OpenRequest,
        backend: &dyn CaptureBackend,
        hook: Option<Arc<DetectionHook>>,
        options: SourceOptions,
    ) -> Result<Self, StreamError> {
        let id = request.source.clone();
        let unavailable = |reason: CaptureError| StreamError::SourceUnavailable {
            id: id.clone(),
            reason,
        };

        let device = backend.open(&request).map_err(unavailable)?;

        let slot = Arc::new(FrameSlot::new());
        let health = Arc::new(HealthCell::new(SourceHealth::Starting));
        let stop = Arc::new(AtomicBool::new(false));
        let (exit_tx, exited) = flume::bounded::<()>(0);

        if let Some(hook) = &hook {
            debug!("Source {} runs detector {}", id, hook.detector_name());
        }

        let acquisition = Acquisition {
            id: id.clone(),
            slot: Arc::clone(&slot),
            health: Arc::clone(&health),
            stop: Arc::clone(&stop),
            hook,
            options: options.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || {
                acquisition.run(device);
                drop(exit_tx);
            })
            .map_err(|e| unavailable(CaptureError::Io(e)))?;

        info!(
            "Created pipeline for source {} with resolution {}x{} @ {} FPS",
            id, request.width, request.height, request.fps
        );

        Ok(Self {
            id,
            width: request.width,
            height: request.height,
            fps: request.fps,
            slot,
            health,
            stop,
            worker: Some(Worker { handle, exited }),
            stop_timeout: options.stop_timeout,
        })
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn health(&self) -> SourceHealth {
        self.health.get()
    }

    pub fn slot(&self) -> &Arc<FrameSlot> {
        &self.slot
    }

    pub fn view(&self) -> SourceView {
        SourceView {
            id: self.id.clone(),
            slot: Arc::clone(&self.slot),
            health: Arc::clone(&self.health),
        }
    }

    /// Ask the loop to exit without waiting.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the loop and wait for the thread to release the device.
    ///
    /// Returns `false` if the thread did not exit within the stop timeout; it
    /// is then abandoned together with its device handle.
    pub fn stop(&mut self) -> bool {
        self.request_stop();
        let Some(worker) = self.worker.take() else {
            return true;
        };

        match worker.exited.recv_timeout(self.stop_timeout) {
            Err(flume::RecvTimeoutError::Timeout) => {
                error!(
                    "Source {} did not stop within {:?}; abandoning capture thread and its device handle",
                    self.id, self.stop_timeout
                );
                metrics::counter!("capture_threads_leaked").increment(1);
                false
            }
            Ok(()) | Err(flume::RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("Capture thread for source {} panicked", self.id);
                }
                debug!("Source {} stopped", self.id);
                true
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the capture thread.
struct Acquisition {
    id: SourceId,
    slot: Arc<FrameSlot>,
    health: Arc<HealthCell>,
    stop: Arc<AtomicBool>,
    hook: Option<Arc<DetectionHook>>,
    options: SourceOptions,
}

impl Acquisition {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn run(self, mut device: Box<dyn CaptureDevice>) {
        let source = self.id.to_string();
        let mut failures = 0u32;
        let mut captured = 0u64;

        while !self.stopped() {
            match device.read_frame(self.options.read_timeout) {
                Ok(Some(frame)) => {
                    if self.health.get() == SourceHealth::Degraded {
                        info!("Source {} recovered after {} failed reads", self.id, failures);
                    }
                    failures = 0;
                    self.health.set(SourceHealth::Healthy);

                    let frame = match &self.hook {
                        Some(hook) => hook.process(&self.id, captured, frame).0,
                        None => frame,
                    };
                    captured += 1;
                    self.slot.write(frame);
                    metrics::counter!("frames_captured", "source" => source.clone()).increment(1);
                }
                Ok(None) => {
                    self.read_failed(&mut failures, "no frame within read timeout");
                }
                Err(e) => {
                    self.read_failed(&mut failures, &e.to_string());
                    self.backoff();
                }
            }
        }

        drop(device);
        self.health.set(SourceHealth::Stopped);
        debug!("Capture loop for source {} exited after {} frames", self.id, captured);
    }

    fn read_failed(&self, failures: &mut u32, reason: &str) {
        *failures = failures.saturating_add(1);
        metrics::counter!("read_failures", "source" => self.id.to_string()).increment(1);

        if *failures == self.options.max_read_retries.max(1) {
            warn!(
                "Source {} degraded after {} consecutive failed reads: {}",
                self.id, failures, reason
            );
            self.health.set(SourceHealth::Degraded);
        } else {
            debug!("Source {} read failed ({}): {}", self.id, failures, reason);
        }
    }

    /// Sleep for the retry backoff, waking early on stop.
    fn backoff(&self) {
        let deadline = Instant::now() + self.options.retry_backoff;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }
}
