//! Bounded history of recent detection events

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::detect::DetectionEvent;

/// Fixed-capacity FIFO of detection events; the oldest is evicted first.
///
/// Appends are serialized by the write lock. Readers take a shared lock, so a
/// `recent` slice is always internally consistent.
pub struct DetectionHistory {
    ring: RwLock<HeapRb<DetectionEvent>>,

    /// Events ever recorded, including evicted ones
    total: CachePadded<AtomicU64>,
}

impl DetectionHistory {
    /// `capacity` of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(HeapRb::new(capacity.max(1))),
            total: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn record(&self, event: DetectionEvent) {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.push_overwrite(event);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// The last `n` events, oldest first. `n` is clamped to the current size.
    pub fn recent(&self, n: usize) -> Vec<DetectionEvent> {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        let len = ring.occupied_len();
        ring.iter().skip(len - n.min(len)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity()
            .get()
    }

    pub fn total_recorded(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
