//! Frame-difference motion detector.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{BoundingBox, DetectError, Detection, Detector};
use crate::capture::{Frame, SourceId};

/// Block-averaged luma grid of one frame.
struct LumaGrid {
    cols: u32,
    rows: u32,
    cells: Vec<u8>,
}

/// Compares each frame with the previous frame of the same source.
///
/// Frames are reduced to `block`x`block` luma averages; blocks whose average
/// moved by more than `threshold` count as changed. When at least
/// `min_changed_ratio` of the blocks changed, one `motion` detection is
/// reported whose box spans all changed blocks.
pub struct MotionDetector {
    block: u32,
    threshold: u8,
    min_changed_ratio: f32,
    previous: Mutex<HashMap<SourceId, LumaGrid>>,
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(16, 25, 0.01)
    }
}

impl MotionDetector {
    pub fn new(block: u32, threshold: u8, min_changed_ratio: f32) -> Self {
        Self {
            block: block.max(1),
            threshold,
            min_changed_ratio,
            previous: Mutex::new(HashMap::new()),
        }
    }

    fn luma_grid(&self, frame: &Frame) -> Result<LumaGrid, DetectError> {
        let view = frame
            .view()
            .ok_or_else(|| DetectError::UnsupportedFrame(format!("{:?}", frame.meta.format)))?;
        let (width, height) = view.dimensions();
        let cols = width.div_ceil(self.block);
        let rows = height.div_ceil(self.block);

        let mut sums = vec![0u64; (cols * rows) as usize];
        let mut counts = vec![0u64; (cols * rows) as usize];
        for (x, y, px) in view.enumerate_pixels() {
            let cell = ((y / self.block) * cols + x / self.block) as usize;
            // BT.601 luma, integer weights
            let luma =
                (299 * u64::from(px[0]) + 587 * u64::from(px[1]) + 114 * u64::from(px[2])) / 1000;
            sums[cell] += luma;
            counts[cell] += 1;
        }

        let cells = sums
            .iter()
            .zip(&counts)
            .map(|(sum, count)| (sum / (*count).max(1)) as u8)
            .collect();
        Ok(LumaGrid { cols, rows, cells })
    }

    /// Box around the changed blocks and the changed fraction, if above the
    /// reporting ratio.
    fn changed_region(
        &self,
        previous: &LumaGrid,
        current: &LumaGrid,
    ) -> Option<(BoundingBox, f32)> {
        let mut changed = 0u32;
        let (mut min_c, mut min_r, mut max_c, mut max_r) = (u32::MAX, u32::MAX, 0, 0);
        for (i, (a, b)) in previous.cells.iter().zip(&current.cells).enumerate() {
            if a.abs_diff(*b) <= self.threshold {
                continue;
            }
            let (c, r) = (i as u32 % current.cols, i as u32 / current.cols);
            changed += 1;
            min_c = min_c.min(c);
            min_r = min_r.min(r);
            max_c = max_c.max(c);
            max_r = max_r.max(r);
        }

        let ratio = changed as f32 / current.cells.len().max(1) as f32;
        if changed == 0 || ratio < self.min_changed_ratio {
            return None;
        }

        let region = BoundingBox::new(
            min_c * self.block,
            min_r * self.block,
            (max_c + 1) * self.block,
            (max_r + 1) * self.block,
        );
        Some((region, ratio))
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &str {
        "motion"
    }

    fn detect(&self, source: &SourceId, frame: &Frame) -> Result<Vec<Detection>, DetectError> {
        let current = self.luma_grid(frame)?;
        let mut previous = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = match previous.get(source) {
            Some(prev) if prev.cols == current.cols && prev.rows == current.rows => {
                self.changed_region(prev, &current)
            }
            _ => None,
        };
        previous.insert(source.clone(), current);
        drop(previous);

        let Some((region, ratio)) = changed else {
            return Ok(Vec::new());
        };
        let (width, height) = frame.dimensions();
        Ok(vec![Detection {
            label: "motion".into(),
            confidence: 0.5 + 0.5 * ratio,
            bbox: Some(region.clamp_to(width, height)),
        }])
    }
}
