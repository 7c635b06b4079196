//! Latest-frame hand-off between one capture thread and any readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;

use crate::capture::Frame;

/// Holds the most recent frame of one source.
///
/// Publishing swaps in a new immutable `Arc<Frame>`, so readers observe
/// either the previous or the next frame, never a partial one. There is no
/// backlog: a frame nobody read before the next write is gone.
///
/// Only the owning capture loop may call [`write`](Self::write).
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: ArcSwapOption<Frame>,
    written: CachePadded<AtomicU64>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `frame`, stamping it with the next sequence number.
    pub fn write(&self, mut frame: Frame) -> u64 {
        let sequence = self.written.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::make_mut(&mut frame.meta).sequence = sequence;
        self.latest.store(Some(Arc::new(frame)));
        sequence
    }

    /// Most recent frame, or `None` before the first write.
    pub fn read_latest(&self) -> Option<Arc<Frame>> {
        self.latest.load_full()
    }

    /// Sequence number of the published frame; 0 while empty.
    pub fn sequence(&self) -> u64 {
        self.latest
            .load()
            .as_ref()
            .map_or(0, |frame| frame.meta.sequence)
    }

    pub fn is_empty(&self) -> bool {
        self.latest.load().is_none()
    }
}
