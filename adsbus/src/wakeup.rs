//! Deadline-ordered timer queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Pending delayed callbacks, kept sorted by deadline. Entries with equal
/// deadlines fire in the order they were scheduled.
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: VecDeque<(Instant, T)>,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        TimerQueue {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn schedule(&mut self, delay: Duration, payload: T) {
        self.schedule_at(Instant::now() + delay, payload);
    }

    pub fn schedule_at(&mut self, deadline: Instant, payload: T) {
        let pos = self.entries.partition_point(|(d, _)| *d <= deadline);
        self.entries.insert(pos, (deadline, payload));
    }

    /// Time until the earliest deadline, or `None` if nothing is scheduled.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.entries
            .front()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Remove and return the earliest entry if its deadline has passed.
    ///
    /// The entry is out of the queue before the caller acts on it, so the
    /// caller may schedule new entries freely.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        match self.entries.front() {
            Some((deadline, _)) if *deadline <= now => self.entries.pop_front().map(|(_, p)| p),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
