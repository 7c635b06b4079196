//! Stream lifecycle: the only place sources are created, replaced or torn down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureBackend, OpenRequest, SourceId};
use crate::detect::{DetectionEvent, DetectionHook, Detector, EventSink, QueuedSink};
use crate::error::StreamError;
use crate::pipeline::{
    CameraSource, Composite, CompositorHandle, DetectionHistory, SourceHealth, SourceOptions,
    SourceView,
};
use crate::{Config, StreamSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl StreamState {
    fn can_become(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// Everything readers need, published as one unit.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub state: StreamState,
    pub settings: StreamSettings,
    /// Active sources in request order.
    pub sources: Vec<SourceView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: SourceId,
    pub health: SourceHealth,
    /// Sequence number of the last published frame
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub active_sources: Vec<SourceStatus>,
    /// Events currently held in the history
    pub detection_count: usize,
    pub total_detections: u64,
}

/// Lifecycle-owned resources, guarded by the transition lock.
#[derive(Default)]
struct Run {
    settings: StreamSettings,
    sources: Vec<CameraSource>,
    compositor: Option<CompositorHandle>,
}

pub struct StreamController {
    config: Config,
    backend: Arc<dyn CaptureBackend>,
    hook: Option<Arc<DetectionHook>>,
    history: Arc<DetectionHistory>,

    lifecycle: Mutex<Run>,
    shared: Arc<ArcSwap<StreamSnapshot>>,

    output_tx: flume::Sender<Composite>,
    output_rx: flume::Receiver<Composite>,
    latest: Arc<ArcSwapOption<Composite>>,
}

impl StreamController {
    /// Stopped controller using `config.stream` as the initial request.
    pub fn new(config: Config, backend: Arc<dyn CaptureBackend>) -> Result<Self, StreamError> {
        config.validate()?;

        let settings = config.stream.clone();
        let (output_tx, output_rx) = flume::bounded(config.compositor.output_queue);
        let shared = Arc::new(ArcSwap::from_pointee(StreamSnapshot {
            state: StreamState::Stopped,
            settings: settings.clone(),
            sources: Vec::new(),
        }));

        info!("Stream controller ready with {} capture backend", backend.name());

        Ok(Self {
            history: Arc::new(DetectionHistory::new(config.detection.history_capacity)),
            config,
            backend,
            hook: None,
            lifecycle: Mutex::new(Run {
                settings,
                ..Default::default()
            }),
            shared,
            output_tx,
            output_rx,
            latest: Arc::new(ArcSwapOption::empty()),
        })
    }

    /// Run `detector` on captured frames. Events go to `sink` through a
    /// bounded queue so publishing never blocks capture.
    pub fn with_detector(
        mut self,
        detector: Arc<dyn Detector>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, StreamError> {
        let queued = QueuedSink::spawn(sink, self.config.events.queue_capacity).map_err(|e| {
            StreamError::Spawn {
                what: "event sink",
                source: e,
            }
        })?;

        info!("Detector {} attached", detector.name());
        self.hook = Some(Arc::new(DetectionHook::new(
            detector,
            Arc::new(queued),
            Arc::clone(&self.history),
            self.config.detection.clone(),
        )));
        Ok(self)
    }

    /// Start with the current parameters. No-op while running.
    #[instrument(skip(self))]
    pub fn start_stream(&self) -> Result<StreamStatus, StreamError> {
        let mut run = self.lock()?;
        if self.state() == StreamState::Stopped {
            self.launch(&mut run)?;
        }
        Ok(self.status())
    }

    /// Tear down every source and the compositor. No-op while stopped.
    #[instrument(skip(self))]
    pub fn stop_stream(&self) -> Result<StreamStatus, StreamError> {
        let mut run = self.lock()?;
        if self.state() == StreamState::Running {
            self.teardown(&mut run);
        }
        Ok(self.status())
    }

    /// Rebuild everything with the current parameters.
    #[instrument(skip(self))]
    pub fn restart(&self) -> Result<StreamStatus, StreamError> {
        let mut run = self.lock()?;
        if self.state() == StreamState::Running {
            self.teardown(&mut run);
            self.settle();
        }
        self.launch(&mut run)?;
        Ok(self.status())
    }

    /// Replace the stream parameters and rebuild. Invalid settings are
    /// rejected before anything running is touched.
    #[instrument(skip(self), fields(width = settings.width, height = settings.height, fps = settings.fps))]
    pub fn reconfigure(&self, settings: StreamSettings) -> Result<StreamStatus, StreamError> {
        settings.validate()?;
        let mut run = self.lock()?;

        if self.state() == StreamState::Running {
            self.teardown(&mut run);
            self.settle();
        }
        run.settings = settings;
        self.publish(StreamState::Stopped, &run.settings, Vec::new());
        self.launch(&mut run)?;
        Ok(self.status())
    }

    pub fn state(&self) -> StreamState {
        self.shared.load().state
    }

    pub fn status(&self) -> StreamStatus {
        let snapshot = self.shared.load_full();
        StreamStatus {
            state: snapshot.state,
            width: snapshot.settings.width,
            height: snapshot.settings.height,
            fps: snapshot.settings.fps,
            active_sources: snapshot
                .sources
                .iter()
                .map(|source| SourceStatus {
                    id: source.id.clone(),
                    health: source.health(),
                    sequence: source.slot.sequence(),
                })
                .collect(),
            detection_count: self.history.len(),
            total_detections: self.history.total_recorded(),
        }
    }

    /// The last `n` detection events, oldest first.
    pub fn recent_detections(&self, n: usize) -> Vec<DetectionEvent> {
        self.history.recent(n)
    }

    pub fn history(&self) -> &Arc<DetectionHistory> {
        &self.history
    }

    /// Encoded composites in emission order. When the queue is full the
    /// oldest queued composite is evicted. Emptied on every teardown.
    pub fn output(&self) -> flume::Receiver<Composite> {
        self.output_rx.clone()
    }

    pub fn latest_composite(&self) -> Option<Arc<Composite>> {
        self.latest.load_full()
    }

    pub fn snapshot(&self) -> Arc<StreamSnapshot> {
        self.shared.load_full()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Run>, StreamError> {
        match self.lifecycle.try_lock() {
            Ok(run) => Ok(run),
            Err(TryLockError::WouldBlock) => Err(StreamError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        }
    }

    fn publish(&self, state: StreamState, settings: &StreamSettings, sources: Vec<SourceView>) {
        self.shared.store(Arc::new(StreamSnapshot {
            state,
            settings: settings.clone(),
            sources,
        }));
    }

    fn transition(&self, next: StreamState, settings: &StreamSettings, sources: Vec<SourceView>) {
        let current = self.state();
        assert!(
            current.can_become(next),
            "illegal stream transition {:?} -> {:?}",
            current,
            next
        );
        self.publish(next, settings, sources);
    }

    fn settle(&self) {
        let delay = Duration::from_millis(self.config.controller.settle_delay_ms);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn launch(&self, run: &mut Run) -> Result<(), StreamError> {
        self.transition(StreamState::Starting, &run.settings, Vec::new());

        let requested = if run.settings.sources.is_empty() {
            let found = self.backend.probe(self.config.capture.probe_limit);
            info!("Probed {} capture devices: {:?}", found.len(), found);
            found
        } else {
            run.settings.sources.clone()
        };

        let options = SourceOptions::from(&self.config.capture);
        for id in &requested {
            let request = OpenRequest {
                source: id.clone(),
                width: run.settings.width,
                height: run.settings.height,
                fps: run.settings.fps,
                ready_timeout: options.ready_timeout,
            };
            match CameraSource::start(request, self.backend.as_ref(), self.hook.clone(), options.clone()) {
                Ok(source) => run.sources.push(source),
                Err(e) => warn!("Skipping source: {}", e),
            }
        }
        info!(
            "Created {} pipelines out of {} sources",
            run.sources.len(),
            requested.len()
        );

        let views: Vec<SourceView> = run.sources.iter().map(CameraSource::view).collect();
        self.publish(StreamState::Starting, &run.settings, views.clone());

        let compositor = CompositorHandle::spawn(
            Arc::clone(&self.shared),
            (self.output_tx.clone(), self.output_rx.clone()),
            Arc::clone(&self.latest),
            self.config.compositor.clone(),
        );
        match compositor {
            Ok(handle) => run.compositor = Some(handle),
            Err(e) => {
                self.stop_sources(run);
                self.transition(StreamState::Stopped, &run.settings, Vec::new());
                return Err(StreamError::Spawn {
                    what: "compositor",
                    source: e,
                });
            }
        }

        metrics::gauge!("active_sources").set(views.len() as f64);
        self.transition(StreamState::Running, &run.settings, views);
        info!(
            "Stream running at {}x{} @ {} FPS",
            run.settings.width, run.settings.height, run.settings.fps
        );
        Ok(())
    }

    fn teardown(&self, run: &mut Run) {
        // Readers stop seeing the sources before any of them is stopped.
        self.transition(StreamState::Stopping, &run.settings, Vec::new());

        if let Some(mut compositor) = run.compositor.take() {
            compositor.stop();
        }
        self.latest.store(None);
        let stale = self.output_rx.drain().count();
        if stale > 0 {
            debug!("Discarded {} undelivered composites", stale);
        }
        self.stop_sources(run);

        metrics::gauge!("active_sources").set(0.0);
        self.transition(StreamState::Stopped, &run.settings, Vec::new());
        info!("Stream stopped");
    }

    fn stop_sources(&self, run: &mut Run) {
        for source in &run.sources {
            let (width, height) = source.resolution();
            debug!(
                "Stopping source {} ({}x{} @ {} FPS)",
                source.id(),
                width,
                height,
                source.fps()
            );
            source.request_stop();
        }
        let leaked = run
            .sources
            .drain(..)
            .map(|mut source| source.stop())
            .filter(|stopped| !stopped)
            .count();
        if leaked > 0 {
            warn!("{} capture threads were abandoned during teardown", leaked);
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let mut run = std::mem::take(
            self.lifecycle
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if self.state() == StreamState::Running {
            self.teardown(&mut run);
        }
    }
}
