use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use multicam::capture::{Frame, SourceId, SyntheticBackend};
use multicam::detect::{
    BoundingBox, DetectError, Detection, DetectionEvent, Detector, EventSink, SinkError,
};
use multicam::pipeline::{Composite, GridLayout, SourceHealth};
use multicam::{BackendKind, Config, StreamController, StreamError, StreamSettings, StreamState};

fn config(width: u32, height: u32, fps: u32, sources: &[u32]) -> Config {
    let mut config = Config::default();
    config.stream = StreamSettings::new(
        width,
        height,
        fps,
        sources.iter().copied().map(SourceId::Index).collect(),
    );
    config.capture.backend = BackendKind::Synthetic;
    config.capture.ready_timeout_ms = 500;
    config.capture.read_timeout_ms = 100;
    config.capture.retry_backoff_ms = 10;
    config.capture.stop_timeout_ms = 2000;
    config.controller.settle_delay_ms = 0;
    config
}

fn controller(config: Config, backend: &SyntheticBackend) -> StreamController {
    StreamController::new(config, Arc::new(backend.clone())).unwrap()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn wait_for_composite(
    controller: &StreamController,
    accept: impl Fn(&Composite) -> bool,
) -> Arc<Composite> {
    let mut found = None;
    assert!(
        wait_until(|| {
            found = controller.latest_composite().filter(|c| accept(c));
            found.is_some()
        }),
        "no matching composite"
    );
    found.unwrap()
}

#[test]
fn single_source_runs() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(640, 480, 30, &[0]), &backend);
    assert_eq!(controller.state(), StreamState::Stopped);

    let status = controller.start_stream().unwrap();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!((status.width, status.height, status.fps), (640, 480, 30));
    assert_eq!(status.active_sources.len(), 1);
    assert_eq!(status.active_sources[0].id, SourceId::Index(0));

    let composite = wait_for_composite(&controller, |_| true);
    assert_eq!((composite.width, composite.height), (640, 480));
    assert_eq!(composite.layout, GridLayout { columns: 1, rows: 1 });
    assert!(controller.output().try_recv().is_ok());

    assert!(wait_until(|| {
        controller.status().active_sources[0].health == SourceHealth::Healthy
    }));

    let stopped = controller.stop_stream().unwrap();
    assert_eq!(stopped.state, StreamState::Stopped);
    assert!(stopped.active_sources.is_empty());
    assert!(!backend.is_open(&SourceId::Index(0)));
}

#[test]
fn reconfigure_applies_new_parameters() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(640, 480, 30, &[0, 1]), &backend);
    controller.start_stream().unwrap();

    let status = controller
        .reconfigure(StreamSettings::new(
            320,
            240,
            15,
            vec![SourceId::Index(0), SourceId::Index(1)],
        ))
        .unwrap();

    assert_eq!(status.state, StreamState::Running);
    assert_eq!((status.width, status.height, status.fps), (320, 240, 15));
    let ids: Vec<_> = status.active_sources.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec![SourceId::Index(0), SourceId::Index(1)]);
    assert_eq!(backend.open_count(&SourceId::Index(0)), 2);

    let composite = wait_for_composite(&controller, |c| c.height == 240);
    assert_eq!(composite.width, 640);
    assert_eq!(composite.layout, GridLayout { columns: 2, rows: 1 });
}

#[test]
fn all_sources_failing_still_runs_with_no_output() {
    let backend = SyntheticBackend::new().with_unavailable(0).with_unavailable(1);
    let controller = controller(config(640, 480, 30, &[0, 1]), &backend);

    let status = controller.start_stream().unwrap();
    assert_eq!(status.state, StreamState::Running);
    assert!(status.active_sources.is_empty());

    thread::sleep(Duration::from_millis(150));
    assert!(controller.output().is_empty());
    assert!(controller.latest_composite().is_none());
}

#[test]
fn partially_failing_sources_are_skipped() {
    let backend = SyntheticBackend::new().with_unavailable(1);
    let controller = controller(config(320, 240, 30, &[0, 1, 2]), &backend);

    let status = controller.start_stream().unwrap();
    let ids: Vec<_> = status.active_sources.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec![SourceId::Index(0), SourceId::Index(2)]);
}

#[test]
fn five_sources_make_a_three_by_three_mosaic() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(160, 120, 30, &[0, 1, 2, 3, 4]), &backend);
    controller.start_stream().unwrap();

    let composite = wait_for_composite(&controller, |c| c.sources.len() == 5);
    assert_eq!(composite.layout, GridLayout { columns: 3, rows: 3 });
    assert_eq!((composite.width, composite.height), (480, 360));

    let image = image::load_from_memory(&composite.jpeg).unwrap().to_rgb8();
    assert_eq!(image.dimensions(), (480, 360));

    let near_black = |col: u32, row: u32| {
        let pixel = image.get_pixel(col * 160 + 80, row * 120 + 60);
        pixel.0.iter().all(|c| *c < 24)
    };
    // Cells 5..9 are padding.
    assert!(near_black(2, 1));
    assert!(near_black(0, 2));
    assert!(near_black(1, 2));
    assert!(near_black(2, 2));
    assert!(!near_black(0, 0));
}

#[test]
fn invalid_reconfigure_leaves_stream_untouched() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(640, 480, 30, &[0]), &backend);
    controller.start_stream().unwrap();

    let err = controller
        .reconfigure(StreamSettings::new(640, 480, 0, vec![SourceId::Index(0)]))
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidConfig(_)));

    let err = controller
        .reconfigure(StreamSettings::new(
            640,
            480,
            30,
            vec![SourceId::Index(0), SourceId::Index(0)],
        ))
        .unwrap_err();
    assert!(matches!(err, StreamError::InvalidConfig(_)));

    let status = controller.status();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!((status.width, status.height, status.fps), (640, 480, 30));
    assert_eq!(status.active_sources.len(), 1);
    assert_eq!(backend.open_count(&SourceId::Index(0)), 1);
}

#[test]
fn concurrent_lifecycle_requests_are_rejected_as_busy() {
    let backend = SyntheticBackend::new();
    let mut config = config(320, 240, 30, &[0]);
    config.controller.settle_delay_ms = 300;
    let controller = Arc::new(controller(config, &backend));
    controller.start_stream().unwrap();

    let reconfiguring = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || loop {
            match controller.reconfigure(StreamSettings::new(640, 480, 15, vec![SourceId::Index(0)])) {
                Err(StreamError::Busy) => thread::yield_now(),
                other => return other,
            }
        })
    };

    let mut saw_busy = false;
    while !reconfiguring.is_finished() {
        if let Err(StreamError::Busy) = controller.start_stream() {
            saw_busy = true;
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(saw_busy);

    let status = reconfiguring.join().unwrap().unwrap();
    assert_eq!((status.width, status.height, status.fps), (640, 480, 15));
}

#[test]
fn status_only_reports_requested_parameters() {
    let backend = SyntheticBackend::new();
    let controller = Arc::new(controller(config(320, 240, 15, &[0]), &backend));
    controller.start_stream().unwrap();

    let requested = [(320, 240, 15), (640, 480, 30)];
    let reconfiguring = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            for round in 0..6 {
                let (w, h, fps) = requested[round % 2];
                loop {
                    match controller.reconfigure(StreamSettings::new(w, h, fps, vec![SourceId::Index(0)])) {
                        Err(StreamError::Busy) => thread::yield_now(),
                        other => {
                            other.unwrap();
                            break;
                        }
                    }
                }
            }
        })
    };

    while !reconfiguring.is_finished() {
        let status = controller.status();
        assert!(requested.contains(&(status.width, status.height, status.fps)));
    }
    reconfiguring.join().unwrap();
}

#[test]
fn device_reopens_after_stop() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(320, 240, 30, &[3]), &backend);

    for _ in 0..3 {
        let status = controller.start_stream().unwrap();
        assert_eq!(status.active_sources.len(), 1);
        controller.stop_stream().unwrap();
        assert!(!backend.is_open(&SourceId::Index(3)));
    }
    assert_eq!(backend.open_count(&SourceId::Index(3)), 3);
}

#[test]
fn start_while_running_and_stop_while_stopped_are_noops() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(320, 240, 30, &[0]), &backend);

    assert_eq!(controller.stop_stream().unwrap().state, StreamState::Stopped);
    controller.start_stream().unwrap();
    controller.start_stream().unwrap();
    assert_eq!(backend.open_count(&SourceId::Index(0)), 1);

    let status = controller.restart().unwrap();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!(backend.open_count(&SourceId::Index(0)), 2);
}

#[test]
fn reconfigure_while_stopped_starts_the_stream() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(320, 240, 30, &[0]), &backend);

    let status = controller
        .reconfigure(StreamSettings::new(
            640,
            360,
            10,
            vec![SourceId::Index(1)],
        ))
        .unwrap();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!((status.width, status.height, status.fps), (640, 360, 10));
    assert_eq!(status.active_sources[0].id, SourceId::Index(1));
}

#[test]
fn empty_source_list_uses_probed_devices() {
    let backend = SyntheticBackend::new().with_probe(vec![SourceId::Index(0), SourceId::Index(2)]);
    let controller = controller(config(320, 240, 30, &[]), &backend);

    let status = controller.start_stream().unwrap();
    let ids: Vec<_> = status.active_sources.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, vec![SourceId::Index(0), SourceId::Index(2)]);
}

#[test]
fn stalled_source_is_reported_degraded() {
    let backend = SyntheticBackend::new().with_read_failures_after(0, 1);
    let mut config = config(320, 240, 30, &[0]);
    config.capture.max_read_retries = 2;
    let controller = controller(config, &backend);
    controller.start_stream().unwrap();

    assert!(wait_until(|| {
        controller.status().active_sources[0].health == SourceHealth::Degraded
    }));
    assert_eq!(controller.status().active_sources[0].sequence, 1);
    assert_eq!(controller.state(), StreamState::Running);
}

struct EveryFrame;

impl Detector for EveryFrame {
    fn name(&self) -> &str {
        "every-frame"
    }

    fn detect(&self, _: &SourceId, _: &Frame) -> Result<Vec<Detection>, DetectError> {
        Ok(vec![Detection {
            label: "person".into(),
            confidence: 0.9,
            bbox: Some(BoundingBox::new(10, 10, 60, 80)),
        }])
    }
}

#[derive(Default)]
struct Collect(Mutex<Vec<DetectionEvent>>);

impl EventSink for Collect {
    fn publish(&self, event: &DetectionEvent) -> Result<(), SinkError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[test]
fn detections_reach_history_and_sink() {
    let backend = SyntheticBackend::new();
    let mut config = config(320, 240, 30, &[0]);
    config.detection.history_capacity = 5;
    let sink = Arc::new(Collect::default());
    let controller = StreamController::new(config, Arc::new(backend.clone()))
        .unwrap()
        .with_detector(Arc::new(EveryFrame), sink.clone())
        .unwrap();
    controller.start_stream().unwrap();

    assert!(wait_until(|| controller.status().total_detections > 6));
    let status = controller.status();
    assert_eq!(status.detection_count, 5);

    let recent = controller.recent_detections(2);
    assert_eq!(recent.len(), 2);
    assert!(recent[0].timestamp <= recent[1].timestamp);
    assert_eq!(recent[1].camera, SourceId::Index(0));
    assert_eq!(recent[1].label, "person");

    assert!(wait_until(|| !sink.0.lock().unwrap().is_empty()));
    controller.stop_stream().unwrap();
}

#[test]
fn config_file_drives_the_controller() {
    use std::io::Write;

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[stream]
width = 320
height = 240
fps = 10
sources = [0, 1]

[capture]
backend = "synthetic"
stop_timeout_ms = 2000

[controller]
settle_delay_ms = 0
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    let backend = SyntheticBackend::new();
    let controller = controller(config, &backend);

    let status = controller.start_stream().unwrap();
    assert_eq!((status.width, status.height, status.fps), (320, 240, 10));
    assert_eq!(status.active_sources.len(), 2);
}

#[test]
fn teardown_discards_composites_of_the_previous_run() {
    let backend = SyntheticBackend::new().with_unavailable(7);
    let controller = controller(config(320, 240, 30, &[0]), &backend);
    controller.start_stream().unwrap();

    let output = controller.output();
    assert!(wait_until(|| output.is_full()));

    let status = controller
        .reconfigure(StreamSettings::new(640, 480, 30, vec![SourceId::Index(7)]))
        .unwrap();
    assert!(status.active_sources.is_empty());

    thread::sleep(Duration::from_millis(100));
    assert!(controller.latest_composite().is_none());
    assert!(output.is_empty());
}

#[test]
fn stop_empties_the_output() {
    let backend = SyntheticBackend::new();
    let controller = controller(config(320, 240, 30, &[0]), &backend);
    controller.start_stream().unwrap();
    wait_for_composite(&controller, |_| true);

    controller.stop_stream().unwrap();
    assert!(controller.latest_composite().is_none());
    assert!(controller.output().is_empty());
}

#[test]
fn lagging_consumer_resumes_on_fresh_composites() {
    let backend = SyntheticBackend::new();
    let config = config(320, 240, 30, &[0]);
    let queue = config.compositor.output_queue as u64;
    let controller = controller(config, &backend);
    controller.start_stream().unwrap();

    wait_for_composite(&controller, |c| c.sequence > queue * 2);
    let queued: Vec<u64> = controller.output().drain().map(|c| c.sequence).collect();

    assert!(!queued.is_empty() && queued.len() as u64 <= queue);
    assert!(queued[0] > queue);
    assert!(queued.windows(2).all(|w| w[0] < w[1]));
}
