use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use ab_glyph::{FontRef, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, error, warn};

use super::{BoundingBox, Detection, DetectionEvent, Detector, EventSink, SinkError};
use crate::capture::{Frame, SourceId};
use crate::pipeline::DetectionHistory;
use crate::DetectionConfig;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const LABEL_SCALE: f32 = 16.0;

static LABEL_FONT: OnceLock<Option<FontRef<'static>>> = OnceLock::new();

fn label_font() -> Option<&'static FontRef<'static>> {
    LABEL_FONT
        .get_or_init(|| match FontRef::try_from_slice(include_bytes!("../../assets/DejaVuSans.ttf")) {
            Ok(font) => Some(font),
            Err(e) => {
                error!("Label font unusable, drawing boxes only: {}", e);
                None
            }
        })
        .as_ref()
}

/// Runs the detector for a capture loop and distributes the results.
pub struct DetectionHook {
    detector: Arc<dyn Detector>,
    sink: Arc<dyn EventSink>,
    history: Arc<DetectionHistory>,
    config: DetectionConfig,
}

impl DetectionHook {
    pub fn new(
        detector: Arc<dyn Detector>,
        sink: Arc<dyn EventSink>,
        history: Arc<DetectionHistory>,
        config: DetectionConfig,
    ) -> Self {
        Self {
            detector,
            sink,
            history,
            config,
        }
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// Detect on `frame`, the `frame_index`-th frame captured by `source`.
    ///
    /// Returns the frame to publish (annotated when anything was found) and
    /// the events that were recorded. Detector failures and panics are logged
    /// and count as "nothing detected".
    pub fn process(
        &self,
        source: &SourceId,
        frame_index: u64,
        frame: Frame,
    ) -> (Frame, Vec<DetectionEvent>) {
        let every = u64::from(self.config.detect_every.max(1));
        if frame_index % every != 0 {
            return (frame, Vec::new());
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.detector.detect(source, &frame)
        }));
        let detections = match outcome {
            Ok(Ok(detections)) => detections,
            Ok(Err(e)) => {
                warn!("Detector {} failed on camera {}: {}", self.detector.name(), source, e);
                return (frame, Vec::new());
            }
            Err(_) => {
                error!("Detector {} panicked on camera {}", self.detector.name(), source);
                return (frame, Vec::new());
            }
        };

        let (width, height) = frame.dimensions();
        let events: Vec<DetectionEvent> = detections
            .into_iter()
            .filter_map(|d| self.accept(d, width, height))
            .map(|d| DetectionEvent::new(source.clone(), d))
            .collect();

        if events.is_empty() {
            return (frame, events);
        }

        metrics::counter!("detections", "camera" => source.to_string())
            .increment(events.len() as u64);

        for event in &events {
            self.history.record(event.clone());
            match self.sink.publish(event) {
                Ok(()) => {}
                Err(SinkError::QueueFull) => debug!("Event queue full, dropped detection"),
                Err(e) => warn!("[Publish Error] {}", e),
            }
        }

        let frame = if self.config.annotate {
            annotate(frame, &events)
        } else {
            frame
        };
        (frame, events)
    }

    /// Thresholds; boxes are clipped to the frame first.
    fn accept(&self, mut detection: Detection, width: u32, height: u32) -> Option<Detection> {
        if !detection.confidence.is_finite() || detection.confidence < self.config.min_confidence {
            return None;
        }
        if let Some(bbox) = detection.bbox {
            let bbox = bbox.clamp_to(width, height);
            let min = self.config.min_box_size;
            if bbox.width() < min || bbox.height() < min {
                return None;
            }
            detection.bbox = Some(bbox);
        }
        Some(detection)
    }
}

fn annotate(frame: Frame, events: &[DetectionEvent]) -> Frame {
    if events.iter().all(|e| e.bbox.is_none()) {
        return frame;
    }
    let Some(mut image) = frame.to_image() else {
        return frame;
    };

    for event in events {
        let Some(bbox) = event.bbox else {
            continue;
        };
        for inset in 0..BOX_THICKNESS {
            let w = bbox.width().saturating_sub(2 * inset);
            let h = bbox.height().saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((bbox.x1 + inset) as i32, (bbox.y1 + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut image, rect, BOX_COLOR);
        }

        if let Some(font) = label_font() {
            let label = format!("{} {:.2}", event.label, event.confidence);
            let scale = PxScale::from(LABEL_SCALE);
            let (_, text_height) = text_size(scale, font, &label);
            // Above the box, pushed down when the box touches the top edge.
            let y = (bbox.y1 as i32 - text_height as i32 - 2).max(0);
            draw_text_mut(&mut image, BOX_COLOR, bbox.x1 as i32, y, scale, font, &label);
        }
    }

    let mut annotated = Frame::from_image(image);
    annotated.timestamp = frame.timestamp;
    if let Some(ts) = frame.meta.device_timestamp {
        annotated = annotated.with_device_timestamp(ts);
    }
    annotated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectError;
    use std::sync::Mutex;

    struct Scripted(Vec<Detection>);

    impl Detector for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn detect(&self, _: &SourceId, _: &Frame) -> Result<Vec<Detection>, DetectError> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn detect(&self, _: &SourceId, _: &Frame) -> Result<Vec<Detection>, DetectError> {
            Err(DetectError::Inference("model not loaded".into()))
        }
    }

    struct Panicking;

    impl Detector for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn detect(&self, _: &SourceId, _: &Frame) -> Result<Vec<Detection>, DetectError> {
            panic!("tensor shape mismatch")
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

    fn detection(label: &str, confidence: f32, bbox: Option<BoundingBox>) -> Detection {
        Detection {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    fn hook(
        detector: impl Detector + 'static,
        config: DetectionConfig,
    ) -> (DetectionHook, Arc<Collect>, Arc<DetectionHistory>) {
        let sink = Arc::new(Collect::default());
        let history = Arc::new(DetectionHistory::new(config.history_capacity));
        let hook = DetectionHook::new(Arc::new(detector), sink.clone(), history.clone(), config);
        (hook, sink, history)
    }

    #[test]
    fn filters_weak_and_tiny_detections() {
        let (hook, sink, history) = hook(
            Scripted(vec![
                detection("person", 0.9, Some(BoundingBox::new(10, 10, 50, 60))),
                detection("cat", 0.1, Some(BoundingBox::new(10, 10, 50, 60))),
                detection("dot", 0.9, Some(BoundingBox::new(10, 10, 15, 60))),
                detection("scene", 0.5, None),
            ]),
            DetectionConfig::default(),
        );

        let (_, events) = hook.process(&SourceId::Index(0), 0, Frame::blank(64, 64));

        let labels: Vec<_> = events.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["person", "scene"]);
        assert_eq!(history.len(), 2);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
        assert_eq!(events[0].camera, SourceId::Index(0));
    }

    #[test]
    fn draws_boxes_on_a_copy() {
        let (hook, _, _) = hook(
            Scripted(vec![detection("person", 0.9, Some(BoundingBox::new(10, 10, 40, 40)))]),
            DetectionConfig::default(),
        );
        let original = Frame::blank(64, 64);

        let (annotated, _) = hook.process(&SourceId::Index(0), 0, original.clone());

        let img = annotated.view().unwrap();
        assert_eq!(img.get_pixel(10, 20), &BOX_COLOR);
        assert_eq!(img.get_pixel(11, 20), &BOX_COLOR);
        assert_eq!(img.get_pixel(25, 25), &Rgb([0, 0, 0]));
        assert!(original.data.iter().all(|b| *b == 0));
        assert_eq!(annotated.timestamp, original.timestamp);
    }

    #[test]
    fn labels_are_written_above_boxes() {
        let (hook, _, _) = hook(
            Scripted(vec![detection("person", 0.87, Some(BoundingBox::new(8, 40, 120, 100)))]),
            DetectionConfig::default(),
        );

        let (annotated, _) = hook.process(&SourceId::Index(0), 0, Frame::blank(128, 128));

        let img = annotated.view().unwrap();
        let painted = (0..40u32)
            .flat_map(|y| (8..120u32).map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y)[1] > 0)
            .count();
        assert!(painted > 0);
    }

    #[test]
    fn label_on_a_box_at_the_top_edge_stays_in_frame() {
        let (hook, _, _) = hook(
            Scripted(vec![detection("cat", 0.5, Some(BoundingBox::new(0, 0, 60, 60)))]),
            DetectionConfig::default(),
        );

        let (annotated, events) = hook.process(&SourceId::Index(0), 0, Frame::blank(64, 64));
        assert_eq!(events.len(), 1);
        let img = annotated.view().unwrap();
        let painted = (2..20u32)
            .flat_map(|y| (2..58u32).map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y)[1] > 0)
            .count();
        assert!(painted > 0);
    }

    #[test]
    fn non_finite_confidence_is_rejected() {
        let (hook, sink, history) = hook(
            Scripted(vec![
                detection("nan", f32::NAN, None),
                detection("inf", f32::INFINITY, None),
                detection("ok", 0.6, None),
            ]),
            DetectionConfig::default(),
        );

        let (_, events) = hook.process(&SourceId::Index(0), 0, Frame::blank(8, 8));

        let labels: Vec<_> = events.iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["ok"]);
        assert_eq!(history.len(), 1);
        let published = sink.0.lock().unwrap();
        let json = serde_json::to_string(&published[0]).unwrap();
        let back: DetectionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.confidence, 0.6);
    }

    #[test]
    fn annotation_can_be_disabled() {
        let config = DetectionConfig {
            annotate: false,
            ..Default::default()
        };
        let (hook, _, _) = hook(
            Scripted(vec![detection("person", 0.9, Some(BoundingBox::new(10, 10, 40, 40)))]),
            config,
        );
        let (frame, events) = hook.process(&SourceId::Index(0), 0, Frame::blank(64, 64));
        assert_eq!(events.len(), 1);
        assert!(frame.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn runs_only_every_nth_frame() {
        let config = DetectionConfig {
            detect_every: 3,
            ..Default::default()
        };
        let (hook, _, history) = hook(Scripted(vec![detection("person", 0.9, None)]), config);

        for index in 0..7 {
            hook.process(&SourceId::Index(0), index, Frame::blank(8, 8));
        }
        // frames 0, 3, 6
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn detector_errors_and_panics_mean_no_detections() {
        let (failing, _, history) = hook(Failing, DetectionConfig::default());
        let (_, events) = failing.process(&SourceId::Index(0), 0, Frame::blank(8, 8));
        assert!(events.is_empty());
        assert_eq!(history.len(), 0);

        let (panicking, _, _) = hook(Panicking, DetectionConfig::default());
        let frame = Frame::blank(8, 8);
        let (out, events) = panicking.process(&SourceId::Index(1), 0, frame.clone());
        assert!(events.is_empty());
        assert_eq!(out.data, frame.data);
    }
}
