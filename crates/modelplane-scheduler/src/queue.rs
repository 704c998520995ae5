//! Priority queue of pending events.
//!
//! A plain array-backed binary min-heap. Ordering is by priority class,
//! then submission instant, then a per-coordinator sequence number, so two
//! events submitted within the same clock tick still pop in submission order.

use std::cmp::Ordering;
use std::time::Instant;

use crate::events::{Event, Priority};

#[derive(Debug, Clone)]
pub struct PrioritizedEvent {
    pub event: Event,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub seq: u64,
}

impl PrioritizedEvent {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.submitted_at.cmp(&other.submitted_at))
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: Vec<PrioritizedEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek(&self) -> Option<&PrioritizedEvent> {
        self.heap.first()
    }

    pub fn push(&mut self, item: PrioritizedEvent) {
        self.heap.push(item);
        self.sift_up(self.heap.len() - 1);
    }

    pub fn pop(&mut self) -> Option<PrioritizedEvent> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Remove and return everything, in no particular order.
    pub fn drain(&mut self) -> Vec<PrioritizedEvent> {
        std::mem::take(&mut self.heap)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.heap[a].cmp_key(&self.heap[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < n && self.less(left, smallest) {
                smallest = left;
            }
            if right < n && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}
