//! Recent search latencies.

use std::{collections::VecDeque, time::Duration};

use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 1_024;

/// Bounded ring buffer of search latencies.
///
/// Owned by whoever creates it and handed to a
/// [`SegmentSearchIndex`](crate::search::SegmentSearchIndex); once full,
/// each new sample evicts the oldest.
#[derive(Debug)]
pub struct SearchMetrics {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl Default for SearchMetrics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SearchMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// Nearest-rank percentile of the retained samples; `p` is clamped to
    /// `0.0..=100.0`. `None` when nothing was recorded.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let mut sorted: Vec<Duration> =
            self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let p = if p.is_nan() { 100.0 } else { p.clamp(0.0, 100.0) };
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}
