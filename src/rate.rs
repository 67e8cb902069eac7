//! Sliding window counters used for anti-flood checks.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Counts events in one-second buckets. [`WindowCounter::rotate`] is driven
/// by the engine's decay loop once per second.
#[derive(Debug)]
pub struct WindowCounter {
    buckets: Mutex<VecDeque<u64>>,
    span: usize,
}

impl WindowCounter {
    pub fn new(span_secs: usize) -> Self {
        let span = span_secs.max(1);
        let mut buckets = VecDeque::with_capacity(span);
        buckets.push_back(0);
        Self { buckets: Mutex::new(buckets), span }
    }

    pub fn add(&self, n: u64) {
        let mut buckets = self.buckets.lock();
        if let Some(current) = buckets.back_mut() {
            *current = current.saturating_add(n);
        }
    }

    /// Events in the last `secs` buckets, the current one included.
    pub fn count(&self, secs: usize) -> u64 {
        let buckets = self.buckets.lock();
        buckets.iter().rev().take(secs).sum()
    }

    pub fn rotate(&self) {
        let mut buckets = self.buckets.lock();
        buckets.push_back(0);
        while buckets.len() > self.span {
            buckets.pop_front();
        }
    }
}
